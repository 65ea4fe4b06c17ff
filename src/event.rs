//! The normalized event type shared by both platform backends

use serde::Serialize;
use std::fmt;

/// Canonical device-path prefix for port style device names
pub const PORT_PREFIX: &str = r"\\.\";

/// What happened to a device.
///
/// `Ignore` marks a notification that is deliberately suppressed and is never
/// delivered to a receiver. `Unknown` marks a notification whose action could
/// not be resolved; it is logged but still delivered with a best-effort
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Add,
    Remove,
    Change,
    Ignore,
    Unknown,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Add => "add",
            ActionKind::Remove => "remove",
            ActionKind::Change => "change",
            ActionKind::Ignore => "ignore",
            ActionKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single device attach / remove / change notification.
///
/// The `device` identifier is never empty; its format depends on the platform
/// backend that produced the event. `seq` orders events from the same watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEvent {
    pub action: ActionKind,
    pub device: String,
    pub seq: u64,
}

/// Ensure a port name carries the `\\.\` device-path prefix exactly once
pub fn normalize_port_name(name: &str) -> String {
    if name.starts_with(PORT_PREFIX) {
        name.to_owned()
    } else {
        format!("{}{}", PORT_PREFIX, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_name_gains_prefix() {
        assert_eq!(normalize_port_name("COM3"), r"\\.\COM3");
    }

    #[test]
    fn prefixed_port_name_is_unchanged() {
        assert_eq!(normalize_port_name(r"\\.\COM3"), r"\\.\COM3");
    }

    #[test]
    fn action_display_matches_wire_names() {
        assert_eq!(ActionKind::Add.to_string(), "add");
        assert_eq!(ActionKind::Remove.to_string(), "remove");
        assert_eq!(ActionKind::Change.to_string(), "change");
    }
}
