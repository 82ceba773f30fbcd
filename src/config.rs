use std::{collections::HashMap, fs, io, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    externals::serial::{framer::DEFAULT_MAX_LINE_BYTES, services::DeviceInfo},
    models::user_config::UserConfig,
};

/// Application configuration, read from a TOML file.
///
/// ```toml
/// [serial]
/// baud_rate = 115200
/// write_timeout_ms = 1000
///
/// [device]
/// product = "STM32 Virtual ComPort"
///
/// [users.ayse]
/// enabled_sensors = ["TEMP", "LOAD"]
/// default_sensor_refresh_ms = 500
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: LinkSettings,
    pub device: DeviceFilter,
    pub users: HashMap<String, UserConfig>,
}

/// Parameters for the physical link. Data bits, stop bits and parity are
/// fixed at 8N1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub baud_rate: u32,

    /// Upper bound on a single command write.
    pub write_timeout_ms: u64,

    /// How long a single read blocks. Bounds how quickly the reader notices
    /// that the link was closed.
    pub read_timeout_ms: u64,

    /// Longest line the framer buffers before giving up on it.
    pub max_line_bytes: usize,

    /// Appended to every outbound command.
    pub command_terminator: String,

    /// How long to wait for the platform to answer a permission request.
    /// Waits forever when unset.
    pub permission_timeout_ms: Option<u64>,
}

/// Picks the controller out of the attached USB serial devices. Unset fields
/// match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}'. Error: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config. Error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            write_timeout_ms: 1000,
            read_timeout_ms: 100,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            command_terminator: "\n".into(),
            permission_timeout_ms: None,
        }
    }
}

impl LinkSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn permission_timeout(&self) -> Option<Duration> {
        self.permission_timeout_ms.map(Duration::from_millis)
    }
}

impl DeviceFilter {
    /// Check the device against every field that is set.
    pub fn matches(&self, device: &DeviceInfo) -> bool {
        fn field_matches<T: PartialEq>(wanted: &Option<T>, actual: &Option<T>) -> bool {
            match wanted {
                None => true,
                Some(wanted) => actual.as_ref() == Some(wanted),
            }
        }

        field_matches(&self.vendor_id, &device.vendor_id)
            && field_matches(&self.product_id, &device.product_id)
            && field_matches(&self.product, &device.product)
            && field_matches(&self.serial_number, &device.serial_number)
    }
}

impl AppConfig {
    /// Load from `path`. A missing file gives the default config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "Config file '{}' not found. Using defaults.",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config = Self::from_toml_str(&text)?;
        info!(
            "Loaded config from '{}' with {} users.",
            path.display(),
            config.users.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}
