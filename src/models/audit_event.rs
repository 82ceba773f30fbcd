use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sensor_key::SensorKey;

/// Response text recorded when a poll finds no line for its sensor.
pub const NO_DATA: &str = "NO_DATA";

/// Screen tag used for events emitted by the sensor pollers.
pub const BACKGROUND_LOGGER_SCREEN: &str = "BackgroundLogger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditStatus {
    /// A command was accepted for transmission. Not an acknowledgment from the device.
    #[serde(rename = "SUCCESS")]
    Success,

    /// Produced by a sensor poller on every interval.
    #[serde(rename = "PERIODIC")]
    Periodic,

    /// A single on-demand sample of a sensor line.
    #[serde(rename = "ONESHOT")]
    OneShot,
}

impl Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Periodic => "PERIODIC",
            AuditStatus::OneShot => "ONESHOT",
        };
        write!(f, "{}", tag)
    }
}

/// Structured record of an issued command or a periodic observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub username: String,
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub screen: Option<String>,
    pub sensor: Option<SensorKey>,
    pub status: AuditStatus,
    pub response: Option<String>,
}

impl AuditEvent {
    /// Event for a command sent by an operator from `screen`.
    pub fn command(username: &str, command: &str, screen: &str) -> Self {
        Self {
            username: username.to_owned(),
            command: command.to_owned(),
            timestamp: Utc::now(),
            screen: Some(screen.to_owned()),
            sensor: None,
            status: AuditStatus::Success,
            response: None,
        }
    }

    /// Event for one poller iteration. `line` is `None` when nothing matched.
    pub fn periodic(username: &str, key: &SensorKey, line: Option<&str>) -> Self {
        Self {
            username: username.to_owned(),
            command: format!("{}_LOG_AUTO", key),
            timestamp: Utc::now(),
            screen: Some(BACKGROUND_LOGGER_SCREEN.to_owned()),
            sensor: Some(key.clone()),
            status: AuditStatus::Periodic,
            response: Some(line.unwrap_or(NO_DATA).to_owned()),
        }
    }

    /// Event for a single sample taken on request from `screen`.
    pub fn one_shot(username: &str, key: &SensorKey, screen: &str, line: &str) -> Self {
        Self {
            username: username.to_owned(),
            command: format!("{}_LOG", key),
            timestamp: Utc::now(),
            screen: Some(screen.to_owned()),
            sensor: Some(key.clone()),
            status: AuditStatus::OneShot,
            response: Some(line.to_owned()),
        }
    }
}

impl Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Audit | user:{}, command:{}, status:{}",
            self.username, self.command, self.status
        )?;
        if let Some(screen) = &self.screen {
            write!(f, ", screen:{}", screen)?;
        }
        if let Some(sensor) = &self.sensor {
            write!(f, ", sensor:{}", sensor)?;
        }
        if let Some(response) = &self.response {
            write!(f, ", response:{}", response)?;
        }
        write!(f, ">")
    }
}
