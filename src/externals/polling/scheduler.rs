use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    externals::{event_logging::AuditLog, telemetry::broadcaster::TelemetryBroadcaster},
    models::{
        audit_event::AuditEvent, raw_line::RawLine, sensor_key::SensorKey,
        user_config::UserConfig,
    },
};

use super::task::{select_line, task_poll_sensor, PollingEnvironment};

/// Registry of per-sensor polling tasks.
///
/// At most one task runs per key. Each task owns a child of the scheduler's
/// cancellation token, so a key can be stopped alone or all of them together.
pub struct PollingScheduler {
    broadcaster: Arc<TelemetryBroadcaster>,
    audit: AuditLog,
    environment: RwLock<Option<PollingEnvironment>>,
    enabled: Mutex<HashMap<SensorKey, watch::Sender<bool>>>,
    tasks: Mutex<HashMap<SensorKey, CancellationToken>>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl PollingScheduler {
    pub fn new(
        broadcaster: Arc<TelemetryBroadcaster>,
        audit: AuditLog,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            broadcaster,
            audit,
            environment: RwLock::new(None),
            enabled: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            token,
            tracker,
        }
    }

    /// Begin logging for `username`: stop whatever was running, then enable
    /// every sensor the user has configured.
    pub fn start_session(&self, username: &str, config: &UserConfig) {
        let mut tasks = self.tasks.lock();
        self.clear_locked(&mut tasks);
        *self.environment.write() = Some(PollingEnvironment {
            username: username.to_owned(),
            refresh_interval: config.refresh_interval(),
        });
        info!(
            "Started polling session for '{}' with {} sensors every {:?}.",
            username,
            config.enabled_sensors.len(),
            config.refresh_interval()
        );
        for key in &config.enabled_sensors {
            self.enable_locked(&mut tasks, key);
        }
    }

    /// Start polling `key`. Does nothing if it is already being polled.
    /// Without an active session only the enabled flag is recorded.
    pub fn enable(&self, key: &SensorKey) {
        let mut tasks = self.tasks.lock();
        self.enable_locked(&mut tasks, key);
    }

    /// Stop polling `key`. Does nothing if it is not being polled.
    pub fn disable(&self, key: &SensorKey) {
        let mut tasks = self.tasks.lock();
        self.set_enabled(key, false);
        if let Some(token) = tasks.remove(key) {
            token.cancel();
            debug!("Stopped polling {}.", key);
        }
    }

    /// Stop every task, reset every enabled flag and end the session.
    /// Readings are left as they were.
    pub fn clear_all(&self) {
        let mut tasks = self.tasks.lock();
        self.clear_locked(&mut tasks);
    }

    pub fn is_enabled(&self, key: &SensorKey) -> bool {
        self.enabled
            .lock()
            .get(key)
            .map(|sender| *sender.borrow())
            .unwrap_or(false)
    }

    /// Live view of the enabled flag for `key`.
    pub fn subscribe_enabled(&self, key: &SensorKey) -> watch::Receiver<bool> {
        self.enabled
            .lock()
            .entry(key.clone())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Keys with a live polling task, sorted.
    pub fn running(&self) -> Vec<SensorKey> {
        let mut keys: Vec<SensorKey> = self.tasks.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Sample `key` once on behalf of `screen`. Records a one-shot audit event
    /// when a matching line is present and a session is active.
    pub fn snapshot(&self, key: &SensorKey, screen: &str) -> Option<RawLine> {
        let latest = self.broadcaster.latest_line()?;
        let line = RawLine::new(select_line(latest.as_str(), key)?)?;
        if let Some(environment) = self.environment.read().as_ref() {
            self.audit.record(AuditEvent::one_shot(
                &environment.username,
                key,
                screen,
                line.as_str(),
            ));
        }
        Some(line)
    }

    // Lock order is `tasks`, then `environment`, then `enabled`. Every change
    // to the task map happens with `tasks` held.
    fn enable_locked(
        &self,
        tasks: &mut HashMap<SensorKey, CancellationToken>,
        key: &SensorKey,
    ) {
        self.set_enabled(key, true);
        if tasks.contains_key(key) {
            trace!("Sensor {} is already being polled.", key);
            return;
        }
        if self.token.is_cancelled() {
            warn!("Scheduler is shut down. Not polling {}.", key);
            return;
        }
        let Some(environment) = self.environment.read().clone() else {
            debug!("No active session. Not polling {} yet.", key);
            return;
        };

        let token = self.token.child_token();
        self.tracker.spawn(task_poll_sensor(
            token.clone(),
            key.clone(),
            environment,
            self.broadcaster.clone(),
            self.audit.clone(),
        ));
        tasks.insert(key.clone(), token);
        debug!("Started polling {}.", key);
    }

    fn clear_locked(&self, tasks: &mut HashMap<SensorKey, CancellationToken>) {
        let ended = self.environment.write().take().is_some();
        let stopped = tasks.len();
        for (_, token) in tasks.drain() {
            token.cancel();
        }
        for sender in self.enabled.lock().values() {
            sender.send_replace(false);
        }
        if ended || stopped > 0 {
            info!("Cleared polling session. Stopped {} tasks.", stopped);
        }
    }

    fn set_enabled(&self, key: &SensorKey, enabled: bool) {
        let mut flags = self.enabled.lock();
        match flags.get(key) {
            Some(sender) => {
                sender.send_replace(enabled);
            }
            None => {
                flags.insert(key.clone(), watch::channel(enabled).0);
            }
        }
    }
}
