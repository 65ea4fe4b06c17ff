use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::{fs, io};
use thiserror::Error;

/// Which uevent is treated as the canonical "device attached" signal.
///
/// The kernel fires `add` when a device is registered and `bind` once a
/// driver has attached and the device node is ready for use. Treating both as
/// an attachment would double-count devices, so callers pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindPolicy {
    /// `add` reports `Add`; `bind` reports `Change`
    #[default]
    AddIsCanonical,
    /// `bind` reports `Add`; `add` is suppressed
    BindIsCanonical,
}

/// How the backend's receive path is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// A dedicated thread owned by the watcher blocks on the notification
    /// source until stopped
    #[default]
    Background,
    /// The caller's own event loop waits for readiness and drives dispatch;
    /// no thread is created
    Hosted,
}

#[derive(Debug, Error)]
#[error("Invalid device class GUID: {0}")]
pub struct InvalidDeviceClass(String);

/// A device interface class GUID, stored as plain data so that configs parse
/// on every platform. Only the Windows backend uses it, to scope which device
/// notifications are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClass {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl DeviceClass {
    /// Interface class of USB mass-storage devices
    pub const USB_STORAGE: DeviceClass = DeviceClass {
        data1: 0xA5DC_BF10,
        data2: 0x6530,
        data3: 0x11D2,
        data4: [0x90, 0x1F, 0x00, 0xC0, 0x4F, 0xB9, 0x51, 0xED],
    };
}

impl Default for DeviceClass {
    fn default() -> Self {
        DeviceClass::USB_STORAGE
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl FromStr for DeviceClass {
    type Err = InvalidDeviceClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        let invalid = || InvalidDeviceClass(s.to_owned());
        if !trimmed.is_ascii() {
            return Err(invalid());
        }
        let parts: Vec<&str> = trimmed.split('-').collect();
        let lengths_ok = parts.len() == 5
            && parts[0].len() == 8
            && parts[1].len() == 4
            && parts[2].len() == 4
            && parts[3].len() == 4
            && parts[4].len() == 12;
        if !lengths_ok {
            return Err(invalid());
        }
        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| invalid())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| invalid())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| invalid())?;
        let tail = format!("{}{}", parts[3], parts[4]);
        let mut data4 = [0_u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(DeviceClass {
            data1,
            data2,
            data3,
            data4,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub bind_policy: BindPolicy,
    pub run_mode: RunMode,
    pub device_class: DeviceClass,
}

impl WatcherConfig {
    /// Load a config file, `Ok(None)` when the file does not exist
    pub fn load(path: &Path) -> Result<Option<WatcherConfig>, anyhow::Error> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        match toml::from_str::<WatcherConfig>(&text) {
            Ok(config) => {
                log::info!("Successfully loaded config file {:?}", path);
                Ok(Some(config))
            }
            Err(e) => {
                log::error!("Failed to load config file {:?}: {}", path, e);
                Err(e.into())
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let toml = toml::to_string(self).unwrap();
        match fs::write(path, toml) {
            Ok(()) => {
                log::info!("Successfully saved config file {:?}", path);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to save config file {:?}: {}", path, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = WatcherConfig::default();
        config.save(&path).unwrap();
        let loaded = WatcherConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_config_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = WatcherConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn device_class_parses_and_formats() {
        let text = "A5DCBF10-6530-11D2-901F-00C04FB951ED";
        let class: DeviceClass = text.parse().unwrap();
        assert_eq!(class, DeviceClass::USB_STORAGE);
        assert_eq!(class.to_string(), text);
    }

    #[test]
    fn device_class_accepts_braces() {
        let class: DeviceClass = "{A5DCBF10-6530-11D2-901F-00C04FB951ED}".parse().unwrap();
        assert_eq!(class, DeviceClass::USB_STORAGE);
    }

    #[test]
    fn malformed_device_class_is_rejected() {
        assert!("A5DCBF10".parse::<DeviceClass>().is_err());
        assert!("A5DCBF10-6530-11D2-901F-00C04FB951XY"
            .parse::<DeviceClass>()
            .is_err());
    }

    #[test]
    fn bind_policy_defaults_to_add() {
        assert_eq!(
            WatcherConfig::default().bind_policy,
            BindPolicy::AddIsCanonical
        );
    }
}
