use std::fmt::Display;

use derive_more::Deref;

use super::sensor_key::SensorKey;

/// Text sent verbatim to the device. Has no identity beyond its content.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, Deref)]
pub struct OutboundCommand(String);

impl OutboundCommand {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OutboundCommand {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OutboundCommand {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<Command> for OutboundCommand {
    fn from(value: Command) -> Self {
        Self(value.to_string())
    }
}

/// The command vocabulary understood by the controller firmware.
/// `Display` renders the exact wire text.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask a sensor to report. Rendered as the bare key.
    Query(SensorKey),
    On(SensorKey),
    Off(SensorKey),
    MinValue(SensorKey, i32),
    MaxValue(SensorKey, i32),
    MinCurrent(SensorKey, i32),
    MaxCurrent(SensorKey, i32),

    ServoForwardStart,
    ServoBackwardStart,
    ServoStop,
    ServoSpeedMultiplier(f32),
    ServoAcceleration(i32),
    ServoSpeed(i32),

    ActuatorForwardStart,
    ActuatorBackwardStart,
    ActuatorStop,
    ActuatorSpeedMultiplier(f32),
    ActuatorTarget(i32),
    ActuatorAcceleration(i32),
    ActuatorSpeed(i32),

    /// Free-form text typed by the operator.
    Raw(String),
}

impl Command {
    /// `<KEY>_ON` or `<KEY>_OFF`.
    pub fn toggle(key: SensorKey, on: bool) -> Self {
        if on {
            Command::On(key)
        } else {
            Command::Off(key)
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // NOTE: Multipliers use the Debug format so whole numbers keep their
        // trailing ".0" (the firmware parses them as floats).
        match self {
            Command::Query(key) => write!(f, "{}", key),
            Command::On(key) => write!(f, "{}_ON", key),
            Command::Off(key) => write!(f, "{}_OFF", key),
            Command::MinValue(key, v) => write!(f, "{}_MIN_VAL={}", key, v),
            Command::MaxValue(key, v) => write!(f, "{}_MAX_VAL={}", key, v),
            Command::MinCurrent(key, v) => write!(f, "{}_MIN_CURR={}", key, v),
            Command::MaxCurrent(key, v) => write!(f, "{}_MAX_CURR={}", key, v),
            Command::ServoForwardStart => write!(f, "SERVO_FWD_START"),
            Command::ServoBackwardStart => write!(f, "SERVO_BWD_START"),
            Command::ServoStop => write!(f, "SERVO_STOP"),
            Command::ServoSpeedMultiplier(v) => write!(f, "SERVO_SPEED_MULT={:?}", v),
            Command::ServoAcceleration(v) => write!(f, "SERVO_ACC={}", v),
            Command::ServoSpeed(v) => write!(f, "SERVO_SPEED={}", v),
            Command::ActuatorForwardStart => write!(f, "ACT_FWD_START"),
            Command::ActuatorBackwardStart => write!(f, "ACT_BWD_START"),
            Command::ActuatorStop => write!(f, "ACT_STOP"),
            Command::ActuatorSpeedMultiplier(v) => write!(f, "ACT_SPEED_MULT={:?}", v),
            Command::ActuatorTarget(v) => write!(f, "ACT_TARGET={}", v),
            Command::ActuatorAcceleration(v) => write!(f, "ACT_ACC={}", v),
            Command::ActuatorSpeed(v) => write!(f, "ACT_SPEED={}", v),
            Command::Raw(text) => write!(f, "{}", text),
        }
    }
}
