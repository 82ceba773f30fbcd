use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use super::sensor_key::SensorKey;

/// Refresh intervals below this are raised to it so a misconfigured user
/// can't turn a poller into a busy loop.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(50);

/// Per-user settings supplied by the config store at login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Sensors whose pollers start as soon as the user logs in.
    pub enabled_sensors: Vec<SensorKey>,

    /// Poller interval in milliseconds.
    pub default_sensor_refresh_ms: u64,

    /// Current limits per sensor, pushed to the device from the config screen.
    pub current_limits: HashMap<SensorKey, CurrentRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentRange {
    pub min: i32,
    pub max: i32,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            enabled_sensors: vec![],
            default_sensor_refresh_ms: 1000,
            current_limits: HashMap::new(),
        }
    }
}

impl Default for CurrentRange {
    fn default() -> Self {
        Self { min: 0, max: 1000 }
    }
}

impl UserConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.default_sensor_refresh_ms).max(MIN_REFRESH_INTERVAL)
    }

    /// Configured range for `key`, or the default range.
    pub fn current_range(&self, key: &SensorKey) -> CurrentRange {
        self.current_limits.get(key).copied().unwrap_or_default()
    }
}
