//! The watcher facade and its platform backends.
//!
//! Exactly one backend exists per watcher, chosen for the build target:
//! - Linux: a netlink socket receiving kernel uevents
//! - Windows: a hidden window receiving device broadcast messages

use crate::config::WatcherConfig;
use crate::dispatch::{DeviceEventReceiver, Dispatcher};
use crate::error::Error;
use std::sync::{Arc, Mutex};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        use self::linux as platform;
    } else if #[cfg(windows)] {
        mod windows;
        use self::windows as platform;
    } else {
        compile_error!("unsupported platform");
    }
}

/// Lifecycle of the active backend, driven only by start() and stop()
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    state: BackendState,
    backend: Option<platform::Backend>,
}

/// Watches for device attach / remove / change events and forwards them to
/// subscribed receivers.
pub struct DeviceWatcher {
    config: WatcherConfig,
    dispatcher: Arc<Dispatcher>,
    inner: Mutex<Inner>,
}

impl DeviceWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        DeviceWatcher {
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            inner: Mutex::new(Inner {
                state: BackendState::Stopped,
                backend: None,
            }),
        }
    }

    /// Register a receiver, returns false if it is already registered
    pub fn subscribe(&self, receiver: Arc<dyn DeviceEventReceiver>) -> bool {
        self.dispatcher.subscribe(receiver)
    }

    /// Remove a receiver; no events are delivered to it after this returns
    pub fn unsubscribe(&self, receiver: &Arc<dyn DeviceEventReceiver>) -> bool {
        self.dispatcher.unsubscribe(receiver)
    }

    /// Arm the platform backend. Idempotent while running; a failed attempt
    /// leaves the watcher stopped and may be retried.
    pub fn start(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.backend.is_some() {
            log::debug!("watcher is already running");
            return Ok(());
        }
        inner.state = BackendState::Starting;
        match platform::Backend::start(&self.config, self.dispatcher.clone()) {
            Ok(backend) => {
                inner.backend = Some(backend);
                inner.state = BackendState::Running;
                log::info!("device watcher started");
                Ok(())
            }
            Err(e) => {
                inner.state = BackendState::Stopped;
                Err(e)
            }
        }
    }

    /// Disarm and tear down the backend; idempotent
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut backend) = inner.backend.take() {
            inner.state = BackendState::Stopping;
            backend.stop();
            log::info!("device watcher stopped");
        }
        inner.state = BackendState::Stopped;
    }

    pub fn state(&self) -> BackendState {
        let inner = self.inner.lock().unwrap();
        match (&inner.backend, inner.state) {
            // A backend whose receive loop died on its own reads as stopped
            (Some(backend), BackendState::Running) if !backend.is_alive() => {
                BackendState::Stopped
            }
            _ => inner.state,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == BackendState::Running
    }
}

#[cfg(target_os = "linux")]
impl DeviceWatcher {
    /// File descriptor to watch for readability when the watcher was started
    /// with [`RunMode::Hosted`](crate::RunMode::Hosted)
    pub fn watch_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.inner.lock().unwrap().backend.as_ref().and_then(|b| b.watch_fd())
    }

    /// Drain and dispatch all queued notifications; hosted mode only.
    /// Returns the number of datagrams handled.
    pub fn dispatch_pending(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        match inner.backend.as_ref() {
            Some(backend) => backend.dispatch_pending(),
            None => 0,
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_begins_stopped() {
        let watcher = DeviceWatcher::new(WatcherConfig::default());
        assert_eq!(watcher.state(), BackendState::Stopped);
        assert!(!watcher.is_running());
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let watcher = DeviceWatcher::new(WatcherConfig::default());
        watcher.stop();
        watcher.stop();
        assert_eq!(watcher.state(), BackendState::Stopped);
    }

    #[test]
    fn facade_subscription_is_idempotent() {
        struct Sink;
        impl DeviceEventReceiver for Sink {
            fn on_device_event(&self, _event: &crate::DeviceEvent) {}
        }
        let watcher = DeviceWatcher::new(WatcherConfig::default());
        let receiver: Arc<dyn DeviceEventReceiver> = Arc::new(Sink);
        assert!(watcher.subscribe(receiver.clone()));
        assert!(!watcher.subscribe(receiver.clone()));
        assert!(watcher.unsubscribe(&receiver));
        assert!(!watcher.unsubscribe(&receiver));
    }
}
