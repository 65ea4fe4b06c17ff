use thiserror::Error;

type Source = Box<dyn std::error::Error + Send + Sync>;

/// Failures that can be reported from [`DeviceWatcher::start`].
///
/// All of these are terminal for that start attempt; the watcher is left
/// stopped and the caller decides whether to retry. Failures inside a running
/// receive loop are logged instead and never surface here.
///
/// [`DeviceWatcher::start`]: crate::DeviceWatcher::start
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to create the kernel event socket: {0}")]
    Socket(#[source] Source),
    #[error("Unable to bind the kernel event socket: {0}")]
    Bind(#[source] Source),
    #[error("Unable to create the notification window: {0}")]
    Window(#[source] Source),
    #[error("Unable to register for device notifications: {0}")]
    Registration(#[source] Source),
}
