//! Parser for kernel uevent datagrams.
//!
//! A uevent datagram is a sequence of NUL separated `KEY=value` lines. The
//! receive layer rewrites the NUL separators to newlines before handing the
//! buffer to [`parse`], which extracts the action and the recognised identity
//! fields into a transient [`DeviceRecord`].

use crate::config::BindPolicy;
use crate::event::ActionKind;

/// Nominal size of one uevent record; reads use a buffer of twice this size
pub const UEVENT_BUFFER_SIZE: usize = 2048;

/// Separator placed between identity fields so they remain distinguishable
/// after being joined into a single device string
pub const FIELD_SEPARATOR: &str = "@#@";

const DATA_FIELDS_USED: [&str; 8] = [
    "SUBSYSTEM", "DEVTYPE", "DEVNAME", "HID_ID", "HID_NAME", "HID_UNIQ", "PRODUCT", "DEVPATH",
];

/// Result of parsing one datagram; discarded once an event has been derived
#[derive(Debug, Default)]
pub struct DeviceRecord {
    /// Raw value of the `ACTION=` line, if one was present
    pub action: Option<String>,
    /// Recognised identity fields in first-seen order
    pub fields: Vec<(&'static str, String)>,
}

/// Rewrite the NUL separators of a raw receive buffer to newlines
pub fn normalize_buffer(data: &[u8]) -> String {
    let text: Vec<u8> = data
        .iter()
        .map(|&b| if b == 0 { b'\n' } else { b })
        .collect();
    String::from_utf8_lossy(&text).trim().to_owned()
}

/// Scan the newline-delimited record for the action and identity fields.
/// Lines matching neither pattern are ignored.
pub fn parse(data: &str) -> DeviceRecord {
    let mut record = DeviceRecord::default();
    for line in data.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("ACTION=") {
            record.action = Some(value.to_owned());
            continue;
        }
        for field in DATA_FIELDS_USED {
            if let Some(value) = line
                .strip_prefix(field)
                .and_then(|rest| rest.strip_prefix('='))
            {
                record.fields.push((field, value.to_owned()));
                break;
            }
        }
    }
    record
}

/// Map a raw action value to an [`ActionKind`].
///
/// The kernel fires `add` when a device is registered and `bind` once a
/// driver has attached and the node is usable. Exactly one of the two maps to
/// `Add` (controlled by the policy) so an attachment is only reported once.
pub fn resolve_action(raw: Option<&str>, policy: BindPolicy) -> ActionKind {
    match raw {
        Some("add") => match policy {
            BindPolicy::AddIsCanonical => ActionKind::Add,
            BindPolicy::BindIsCanonical => ActionKind::Ignore,
        },
        Some("remove") => ActionKind::Remove,
        Some("bind") => match policy {
            BindPolicy::AddIsCanonical => ActionKind::Change,
            BindPolicy::BindIsCanonical => ActionKind::Add,
        },
        _ => ActionKind::Change,
    }
}

impl DeviceRecord {
    /// Join the captured fields into the device identity string, each
    /// prefixed by [`FIELD_SEPARATOR`] with one trailing separator.
    /// `None` when no recognised field was seen.
    pub fn device_identity(&self) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }
        let mut device = String::new();
        for (name, value) in &self.fields {
            device.push_str(FIELD_SEPARATOR);
            device.push_str(name);
            device.push('=');
            device.push_str(value);
        }
        device.push_str(FIELD_SEPARATOR);
        Some(device)
    }

    /// Resolve the record into an action plus device identity.
    ///
    /// A record with no recognised fields describes nothing we can report and
    /// yields `None`, as does a policy-suppressed action.
    pub fn derive_event(&self, policy: BindPolicy) -> Option<(ActionKind, String)> {
        let device = self.device_identity()?;
        let action = resolve_action(self.action.as_deref(), policy);
        if action == ActionKind::Ignore {
            return None;
        }
        Some((action, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_datagram(buf: &[u8]) -> DeviceRecord {
        parse(&normalize_buffer(buf))
    }

    #[test]
    fn add_with_fields_yields_one_add_event() {
        let record = parse_datagram(b"ACTION=add\0SUBSYSTEM=block\0DEVNAME=sdb\0");
        let (action, device) = record.derive_event(BindPolicy::AddIsCanonical).unwrap();
        assert_eq!(action, ActionKind::Add);
        assert_eq!(device, "@#@SUBSYSTEM=block@#@DEVNAME=sdb@#@");
    }

    #[test]
    fn add_is_suppressed_when_bind_is_canonical() {
        let record = parse_datagram(b"ACTION=add\0SUBSYSTEM=block\0DEVNAME=sdb\0");
        assert!(record.derive_event(BindPolicy::BindIsCanonical).is_none());
    }

    #[test]
    fn bind_flips_between_change_and_add() {
        let record = parse_datagram(b"ACTION=bind\0DEVNAME=ttyUSB0\0");
        let (action, _) = record.derive_event(BindPolicy::AddIsCanonical).unwrap();
        assert_eq!(action, ActionKind::Change);
        let (action, _) = record.derive_event(BindPolicy::BindIsCanonical).unwrap();
        assert_eq!(action, ActionKind::Add);
    }

    #[test]
    fn remove_is_unaffected_by_policy() {
        let record = parse_datagram(b"ACTION=remove\0DEVNAME=sdb\0");
        for policy in [BindPolicy::AddIsCanonical, BindPolicy::BindIsCanonical] {
            let (action, _) = record.derive_event(policy).unwrap();
            assert_eq!(action, ActionKind::Remove);
        }
    }

    #[test]
    fn unrecognised_action_resolves_to_change() {
        let record = parse_datagram(b"ACTION=offline\0DEVNAME=sdb\0");
        let (action, _) = record.derive_event(BindPolicy::AddIsCanonical).unwrap();
        assert_eq!(action, ActionKind::Change);
    }

    #[test]
    fn missing_action_line_resolves_to_change() {
        let record = parse_datagram(b"SUBSYSTEM=usb\0DEVPATH=/devices/usb1\0");
        assert!(record.action.is_none());
        let (action, _) = record.derive_event(BindPolicy::AddIsCanonical).unwrap();
        assert_eq!(action, ActionKind::Change);
    }

    #[test]
    fn no_recognised_fields_yields_no_event() {
        let record = parse_datagram(b"ACTION=add\0SEQNUM=4242\0SYNTH_UUID=0\0");
        assert!(record.derive_event(BindPolicy::AddIsCanonical).is_none());
        assert!(record.derive_event(BindPolicy::BindIsCanonical).is_none());
    }

    #[test]
    fn empty_buffer_yields_no_event() {
        let record = parse_datagram(b"");
        assert!(record.derive_event(BindPolicy::AddIsCanonical).is_none());
    }

    #[test]
    fn fields_keep_first_seen_order() {
        let record = parse_datagram(b"DEVNAME=sdb\0ACTION=add\0SUBSYSTEM=block\0");
        let (_, device) = record.derive_event(BindPolicy::AddIsCanonical).unwrap();
        assert_eq!(device, "@#@DEVNAME=sdb@#@SUBSYSTEM=block@#@");
    }

    #[test]
    fn field_names_must_match_exactly() {
        let record = parse_datagram(b"ACTION=add\0SUBSYSTEMX=block\0DEVNAME_EXTRA=sdb\0");
        assert!(record.fields.is_empty());
    }

    #[test]
    fn all_allow_listed_fields_are_captured() {
        let record = parse_datagram(
            b"ACTION=add\0SUBSYSTEM=hid\0DEVTYPE=usb_device\0DEVNAME=hidraw0\0HID_ID=0003\0\
              HID_NAME=Gamepad\0HID_UNIQ=abc123\0PRODUCT=4e8/503b/100\0DEVPATH=/devices/hid0\0",
        );
        assert_eq!(record.fields.len(), 8);
    }
}
