use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::{
    externals::{event_logging::AuditLog, serial::session::DeviceSession},
    models::{
        audit_event::AuditEvent,
        command::{Command, OutboundCommand},
        sensor_key::SensorKey,
        user_config::CurrentRange,
    },
};

/// Who issued a command and from where. Carried into the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOrigin {
    pub username: String,
    pub screen: String,
}

impl CommandOrigin {
    pub fn new(username: &str, screen: &str) -> Self {
        Self {
            username: username.to_owned(),
            screen: screen.to_owned(),
        }
    }
}

/// Value and current limits pushed to a sensor from its config screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorLimits {
    pub min_value: i32,
    pub max_value: i32,
    pub current: CurrentRange,
}

/// Single path for every outbound command.
///
/// Commands go out one at a time in the order `send` was called and each is
/// paired with a `SUCCESS` audit event. `SUCCESS` means accepted for
/// transmission; the device does not acknowledge commands.
pub struct CommandDispatcher {
    session: DeviceSession,
    audit: AuditLog,
    outbound: Mutex<()>,
}

impl CommandDispatcher {
    pub fn new(session: DeviceSession, audit: AuditLog) -> Self {
        Self {
            session,
            audit,
            outbound: Mutex::new(()),
        }
    }

    #[instrument(skip_all, fields(screen = %origin.screen))]
    pub async fn send(&self, origin: &CommandOrigin, command: impl Into<OutboundCommand>) {
        let command = command.into();
        let _outbound = self.outbound.lock().await;

        debug!("Sending command '{}'.", command);
        self.session.write(&command).await;
        self.audit.record(AuditEvent::command(
            &origin.username,
            command.as_str(),
            &origin.screen,
        ));
    }

    /// `<KEY>_ON` / `<KEY>_OFF`.
    pub async fn toggle_sensor(&self, origin: &CommandOrigin, key: &SensorKey, on: bool) {
        self.send(origin, Command::toggle(key.clone(), on)).await;
    }

    /// Push value limits, then current limits.
    pub async fn apply_sensor_limits(
        &self,
        origin: &CommandOrigin,
        key: &SensorKey,
        limits: SensorLimits,
    ) {
        self.send(origin, Command::MinValue(key.clone(), limits.min_value))
            .await;
        self.send(origin, Command::MaxValue(key.clone(), limits.max_value))
            .await;
        self.apply_current_limits(origin, key, limits.current).await;
    }

    pub async fn apply_current_limits(
        &self,
        origin: &CommandOrigin,
        key: &SensorKey,
        range: CurrentRange,
    ) {
        self.send(origin, Command::MinCurrent(key.clone(), range.min))
            .await;
        self.send(origin, Command::MaxCurrent(key.clone(), range.max))
            .await;
    }

    pub async fn configure_servo(&self, origin: &CommandOrigin, acceleration: i32, speed: i32) {
        self.send(origin, Command::ServoAcceleration(acceleration)).await;
        self.send(origin, Command::ServoSpeed(speed)).await;
    }

    pub async fn configure_actuator(&self, origin: &CommandOrigin, acceleration: i32, speed: i32) {
        self.send(origin, Command::ActuatorAcceleration(acceleration))
            .await;
        self.send(origin, Command::ActuatorSpeed(speed)).await;
    }
}
