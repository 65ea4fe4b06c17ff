//! Backend reading kernel uevents from a netlink socket

use crate::config::{BindPolicy, RunMode, WatcherConfig};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::uevent::{self, UEVENT_BUFFER_SIZE};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    bind, getsockname, recv, setsockopt, socket, sockopt, AddressFamily, MsgFlags, SockAddr,
    SockFlag, SockProtocol, SockType,
};
use nix::unistd::{close, pipe, write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Netlink multicast group carrying raw kernel uevents
const UDEV_MONITOR_KERNEL: u32 = 1;

/// Kernel receive buffer requested for the socket; enlarging is best-effort
const RECEIVE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Consecutive receive failures tolerated before the reader gives up
const MAX_READ_FAILURES: u32 = 5;

pub(crate) struct Backend {
    socket: Option<RawFd>,
    mode: Mode,
}

enum Mode {
    Background {
        stop_tx: RawFd,
        thread: Option<JoinHandle<()>>,
        alive: Arc<AtomicBool>,
    },
    Hosted {
        dispatcher: Arc<Dispatcher>,
        policy: BindPolicy,
    },
}

impl Backend {
    pub(crate) fn start(config: &WatcherConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let socket = open_uevent_socket()?;
        match config.run_mode {
            RunMode::Background => {
                let (stop_rx, stop_tx) = match pipe() {
                    Ok(fds) => fds,
                    Err(e) => {
                        close(socket).ok();
                        return Err(Error::Socket(Box::new(e)));
                    }
                };
                let alive = Arc::new(AtomicBool::new(true));
                let thread_alive = alive.clone();
                let policy = config.bind_policy;
                let thread = std::thread::spawn(move || {
                    receive_loop(socket, stop_rx, &dispatcher, policy);
                    thread_alive.store(false, Ordering::Release);
                });
                Ok(Backend {
                    socket: Some(socket),
                    mode: Mode::Background {
                        stop_tx,
                        thread: Some(thread),
                        alive,
                    },
                })
            }
            RunMode::Hosted => {
                if let Err(e) = fcntl(socket, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
                    close(socket).ok();
                    return Err(Error::Socket(Box::new(e)));
                }
                Ok(Backend {
                    socket: Some(socket),
                    mode: Mode::Hosted {
                        dispatcher,
                        policy: config.bind_policy,
                    },
                })
            }
        }
    }

    pub(crate) fn stop(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Mode::Background {
                stop_tx, thread, ..
            } = &mut self.mode
            {
                log::debug!("stopping uevent reader thread");
                write(*stop_tx, &[0]).ok();
                close(*stop_tx).ok();
                if let Some(thread) = thread.take() {
                    thread.join().ok();
                }
            }
            close(socket).ok();
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match &self.mode {
            Mode::Background { alive, .. } => alive.load(Ordering::Acquire),
            Mode::Hosted { .. } => self.socket.is_some(),
        }
    }

    pub(crate) fn watch_fd(&self) -> Option<RawFd> {
        match self.mode {
            Mode::Hosted { .. } => self.socket,
            Mode::Background { .. } => None,
        }
    }

    /// Drain all queued datagrams; hosted mode only
    pub(crate) fn dispatch_pending(&self) -> usize {
        let (dispatcher, policy) = match &self.mode {
            Mode::Hosted { dispatcher, policy } => (dispatcher, *policy),
            Mode::Background { .. } => return 0,
        };
        let socket = match self.socket {
            Some(socket) => socket,
            None => return 0,
        };
        let mut handled = 0;
        let mut data = vec![0_u8; UEVENT_BUFFER_SIZE * 2];
        loop {
            match recv(socket, &mut data, MsgFlags::empty()) {
                Ok(0) => break,
                Ok(len) => {
                    handle_datagram(&data[..len], dispatcher, policy);
                    handled += 1;
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                Err(e) => {
                    log::warn!("uevent receive failed: {}", e);
                    break;
                }
            }
        }
        handled
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_uevent_socket() -> Result<RawFd, Error> {
    let socket = socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkKObjectUEvent,
    )
    .map_err(|e| Error::Socket(Box::new(e)))?;
    if let Err(e) = setsockopt(socket, sockopt::RcvBufForce, &RECEIVE_BUFFER_SIZE) {
        log::debug!("unable to enlarge uevent receive buffer: {}", e);
    }
    let addr = SockAddr::new_netlink(0, UDEV_MONITOR_KERNEL);
    if let Err(e) = bind(socket, &addr) {
        close(socket).ok();
        return Err(Error::Bind(Box::new(e)));
    }
    // The kernel assigns the local address on bind, usually the pid
    match getsockname(socket) {
        Ok(SockAddr::Netlink(local)) => {
            log::debug!("uevent socket bound, local pid {}", local.pid());
        }
        Ok(_) => {}
        Err(e) => log::debug!("getsockname failed on uevent socket: {}", e),
    }
    Ok(socket)
}

fn receive_loop(socket: RawFd, stop: RawFd, dispatcher: &Dispatcher, policy: BindPolicy) {
    log::info!("watching the kernel uevent socket");
    let mut failures = 0_u32;
    loop {
        let socket_fd = PollFd::new(socket, PollFlags::POLLIN);
        let stop_fd = PollFd::new(stop, PollFlags::POLLIN);
        let mut pfds = [socket_fd, stop_fd];
        match poll(&mut pfds, -1) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::error!("uevent poll failed: {}", e);
                break;
            }
        }
        if let Some(revents) = pfds[1].revents() {
            if revents.contains(PollFlags::POLLIN) {
                break;
            }
        }
        if let Some(revents) = pfds[0].revents() {
            if revents.contains(PollFlags::POLLIN) {
                let mut data = vec![0_u8; UEVENT_BUFFER_SIZE * 2];
                match recv(socket, &mut data, MsgFlags::empty()) {
                    Ok(0) => {}
                    Ok(len) => {
                        failures = 0;
                        data.truncate(len);
                        log::trace!("read {} bytes from uevent socket", len);
                        handle_datagram(&data, dispatcher, policy);
                    }
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
                    Err(e) => {
                        failures += 1;
                        log::warn!("uevent receive failed: {}", e);
                        if failures >= MAX_READ_FAILURES {
                            log::error!("uevent socket is no longer usable, stopping reader");
                            break;
                        }
                    }
                }
            }
        }
    }
    close(stop).ok();
    log::debug!("uevent reader thread exiting");
}

fn handle_datagram(data: &[u8], dispatcher: &Dispatcher, policy: BindPolicy) {
    let text = uevent::normalize_buffer(data);
    if text.is_empty() {
        return;
    }
    let record = uevent::parse(&text);
    match record.derive_event(policy) {
        Some((action, device)) => {
            log::debug!("uevent: {} {}", action, device);
            dispatcher.emit(action, device);
        }
        None => log::trace!("uevent record produced no event"),
    }
}
