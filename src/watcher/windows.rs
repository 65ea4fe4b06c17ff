//! Backend receiving device broadcast messages through a hidden window

use crate::config::{DeviceClass, RunMode, WatcherConfig};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::event::{normalize_port_name, ActionKind};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::JoinHandle;
use windows::core::{w, GUID, PCWSTR};
use windows::Win32::Foundation::{
    GetLastError, ERROR_CLASS_ALREADY_EXISTS, HANDLE, HWND, LPARAM, LRESULT, WPARAM,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcA, DestroyWindow, DispatchMessageA, GetMessageA,
    GetWindowLongPtrW, PostQuitMessage, RegisterClassW, RegisterDeviceNotificationW, SendMessageW,
    SetWindowLongPtrW, UnregisterDeviceNotification, CW_USEDEFAULT, DBT_DEVICEARRIVAL,
    DBT_DEVICEREMOVECOMPLETE, DBT_DEVTYP_DEVICEINTERFACE, DBT_DEVTYP_HANDLE, DBT_DEVTYP_OEM,
    DBT_DEVTYP_PORT, DBT_DEVTYP_VOLUME, DEVICE_NOTIFY_WINDOW_HANDLE,
    DEV_BROADCAST_DEVICEINTERFACE_W, DEV_BROADCAST_HDR, DEV_BROADCAST_PORT_W, GWLP_USERDATA,
    HDEVNOTIFY, MSG, WINDOW_EX_STYLE, WINDOW_STYLE, WM_APP, WM_DEVICECHANGE, WNDCLASSW,
};

const WINDOW_CLASS_NAME: PCWSTR = w!("device_watcher_notify_window");

/// Private message telling the background pump to exit
const MSG_STOP_PUMP: u32 = WM_APP + 0x0DE5;

pub(crate) struct Backend {
    mode: Mode,
}

enum Mode {
    Background {
        hwnd: HWND,
        thread: Option<JoinHandle<()>>,
        alive: Arc<AtomicBool>,
    },
    Hosted {
        window: Option<NotifyWindow>,
    },
}

impl Backend {
    pub(crate) fn start(config: &WatcherConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let class = class_guid(&config.device_class);
        match config.run_mode {
            RunMode::Background => Self::start_background(class, dispatcher),
            RunMode::Hosted => {
                // The window belongs to the calling thread; the host's own
                // message pump delivers its notifications, and stop() must be
                // called on that same thread
                let window = NotifyWindow::create(dispatcher, class)?;
                Ok(Backend {
                    mode: Mode::Hosted {
                        window: Some(window),
                    },
                })
            }
        }
    }

    fn start_background(class: GUID, dispatcher: Arc<Dispatcher>) -> Result<Self, Error> {
        let (tx, rx) = sync_channel(0);
        let alive = Arc::new(AtomicBool::new(true));
        let thread_alive = alive.clone();
        let thread = std::thread::spawn(move || {
            let window = match NotifyWindow::create(dispatcher, class) {
                Ok(window) => {
                    tx.send(Ok(window.hwnd)).unwrap();
                    window
                }
                Err(e) => {
                    thread_alive.store(false, Ordering::Release);
                    tx.send(Err(e)).unwrap();
                    return;
                }
            };
            unsafe {
                let mut message = MSG::default();
                while GetMessageA(&mut message, window.hwnd, 0, 0).into() {
                    DispatchMessageA(&message);
                }
            }
            drop(window);
            thread_alive.store(false, Ordering::Release);
            log::debug!("device notification thread exiting");
        });
        match rx.recv().unwrap() {
            Ok(hwnd) => Ok(Backend {
                mode: Mode::Background {
                    hwnd,
                    thread: Some(thread),
                    alive,
                },
            }),
            Err(e) => {
                thread.join().ok();
                Err(e)
            }
        }
    }

    pub(crate) fn stop(&mut self) {
        match &mut self.mode {
            Mode::Background { hwnd, thread, .. } => {
                if let Some(thread) = thread.take() {
                    log::debug!("stopping device notification thread");
                    unsafe { SendMessageW(*hwnd, MSG_STOP_PUMP, None, None) };
                    thread.join().ok();
                }
            }
            Mode::Hosted { window } => {
                window.take();
            }
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match &self.mode {
            Mode::Background { alive, .. } => alive.load(Ordering::Acquire),
            Mode::Hosted { window } => window.is_some(),
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WindowData {
    dispatcher: Arc<Dispatcher>,
}

/// A hidden window registered for device-interface notifications. Dropping it
/// unregisters the notification and destroys the window, so re-creating one
/// never leaks the previous registration.
struct NotifyWindow {
    hwnd: HWND,
    notification: HDEVNOTIFY,
    // Referenced by the wndproc through GWLP_USERDATA; must outlive the window
    _data: Box<WindowData>,
}

// HDEVNOTIFY is a plain handle; the window itself is only ever destroyed from
// the thread that created it
unsafe impl Send for NotifyWindow {}

impl NotifyWindow {
    fn create(dispatcher: Arc<Dispatcher>, class: GUID) -> Result<Self, Error> {
        let mut data = Box::new(WindowData { dispatcher });
        unsafe {
            let instance = GetModuleHandleW(None).map_err(|e| Error::Window(Box::new(e)))?;

            let window_class = WNDCLASSW {
                hInstance: instance.into(),
                lpszClassName: WINDOW_CLASS_NAME,
                lpfnWndProc: Some(wndproc),
                ..Default::default()
            };
            // The class persists for the life of the process; a second
            // watcher in the same process reuses it
            let atom = RegisterClassW(&window_class);
            if atom == 0 && GetLastError() != ERROR_CLASS_ALREADY_EXISTS {
                return Err(Error::Window(Box::new(windows::core::Error::from_win32())));
            }

            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                WINDOW_CLASS_NAME,
                None,
                WINDOW_STYLE::default(),
                CW_USEDEFAULT,
                CW_USEDEFAULT,
                CW_USEDEFAULT,
                CW_USEDEFAULT,
                None,
                None,
                instance,
                None,
            );
            if hwnd.0 == 0 {
                return Err(Error::Window(Box::new(windows::core::Error::from_win32())));
            }
            SetWindowLongPtrW(hwnd, GWLP_USERDATA, data.as_mut() as *mut WindowData as isize);

            let filter = DEV_BROADCAST_DEVICEINTERFACE_W {
                dbcc_size: std::mem::size_of::<DEV_BROADCAST_DEVICEINTERFACE_W>() as u32,
                dbcc_devicetype: DBT_DEVTYP_DEVICEINTERFACE,
                dbcc_reserved: 0,
                dbcc_classguid: class,
                dbcc_name: [0],
            };
            let notification = match RegisterDeviceNotificationW(
                HANDLE(hwnd.0),
                &filter as *const _ as *const c_void,
                DEVICE_NOTIFY_WINDOW_HANDLE,
            ) {
                Ok(notification) => notification,
                Err(e) => {
                    let _ = DestroyWindow(hwnd);
                    return Err(Error::Registration(Box::new(e)));
                }
            };
            log::debug!("registered for device interface notifications, class {:?}", class);
            Ok(NotifyWindow {
                hwnd,
                notification,
                _data: data,
            })
        }
    }
}

impl Drop for NotifyWindow {
    fn drop(&mut self) {
        unsafe {
            let _ = UnregisterDeviceNotification(self.notification);
            SetWindowLongPtrW(self.hwnd, GWLP_USERDATA, 0);
            let _ = DestroyWindow(self.hwnd);
        }
    }
}

fn class_guid(class: &DeviceClass) -> GUID {
    GUID::from_values(class.data1, class.data2, class.data3, class.data4)
}

unsafe fn get_user_data<T>(hwnd: &HWND) -> Option<&mut T> {
    let user_data = GetWindowLongPtrW(*hwnd, GWLP_USERDATA);
    if user_data == 0 {
        return None;
    }
    Some(&mut *(user_data as *mut T))
}

/// Read a NUL terminated wide string out of a notification structure
unsafe fn read_wide_name(ptr: *const u16) -> String {
    let mut len = 0_usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}

unsafe extern "system" fn wndproc(
    window: HWND,
    message: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match message {
        WM_DEVICECHANGE => {
            if let Some(window_data) = get_user_data::<WindowData>(&window) {
                on_device_change(window_data, wparam, lparam);
            }
        }
        MSG_STOP_PUMP => {
            PostQuitMessage(0);
        }
        _ => {}
    }
    DefWindowProcA(window, message, wparam, lparam)
}

unsafe fn on_device_change(window_data: &WindowData, wparam: WPARAM, lparam: LPARAM) {
    let header = lparam.0 as *const DEV_BROADCAST_HDR;
    if header.is_null() {
        return;
    }
    let action = match wparam.0 as u32 {
        DBT_DEVICEARRIVAL => ActionKind::Add,
        DBT_DEVICEREMOVECOMPLETE => ActionKind::Remove,
        _ => ActionKind::Change,
    };
    let device_type = (*header).dbch_devicetype;
    let device = if device_type == DBT_DEVTYP_DEVICEINTERFACE {
        let interface = &*(header as *const DEV_BROADCAST_DEVICEINTERFACE_W);
        Some(read_wide_name(interface.dbcc_name.as_ptr()))
    } else if device_type == DBT_DEVTYP_PORT {
        let port = &*(header as *const DEV_BROADCAST_PORT_W);
        Some(normalize_port_name(&read_wide_name(port.dbcp_name.as_ptr())))
    } else if device_type == DBT_DEVTYP_HANDLE
        || device_type == DBT_DEVTYP_OEM
        || device_type == DBT_DEVTYP_VOLUME
    {
        log::debug!("ignoring device notification of type {:?}", device_type);
        None
    } else {
        log::debug!("unknown device notification type {:?}", device_type);
        None
    };
    if let Some(device) = device {
        if !device.is_empty() {
            log::debug!("device broadcast: {} {}", action, device);
            window_data.dispatcher.emit(action, device);
        }
    }
}
