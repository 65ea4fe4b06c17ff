//! Notifies subscribers when hardware devices are attached, removed or
//! reconfigured.
//!
//! One backend is active per platform: on Linux a netlink socket receives raw
//! kernel uevents, on Windows a hidden window receives `WM_DEVICECHANGE`
//! broadcasts. Both normalize what they see into [`DeviceEvent`]s, which are
//! delivered asynchronously to every subscribed [`DeviceEventReceiver`].
//!
//! ```no_run
//! use device_watcher::{DeviceEvent, DeviceEventReceiver, DeviceWatcher, WatcherConfig};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl DeviceEventReceiver for Printer {
//!     fn on_device_event(&self, event: &DeviceEvent) {
//!         println!("{} {}", event.action, event.device);
//!     }
//! }
//!
//! let watcher = DeviceWatcher::new(WatcherConfig::default());
//! watcher.subscribe(Arc::new(Printer));
//! watcher.start().expect("unable to start watching for device events");
//! ```

pub mod common;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod uevent;
pub mod watcher;

pub use config::{BindPolicy, DeviceClass, RunMode, WatcherConfig};
pub use dispatch::{DeviceEventReceiver, Dispatcher};
pub use error::Error;
pub use event::{ActionKind, DeviceEvent};
pub use watcher::{BackendState, DeviceWatcher};
