use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use crate::{
    config::LinkSettings,
    externals::{
        commands::dispatcher::{CommandDispatcher, CommandOrigin},
        config_store::ConfigStore,
        event_logging::{adapters::AuditSink, task::task_audit_log_writer, AuditLog},
        polling::scheduler::PollingScheduler,
        serial::{services::DeviceDriver, session::DeviceSession},
        telemetry::broadcaster::TelemetryBroadcaster,
    },
    models::{
        connection_state::ConnectionState,
        sensor_key::SensorKey,
        user_config::{CurrentRange, UserConfig},
    },
};

/// The serial link and telemetry core, wired together around one
/// cancellation token and one task tracker.
pub struct LinkSystem {
    pub broadcaster: Arc<TelemetryBroadcaster>,
    pub session: DeviceSession,
    pub scheduler: PollingScheduler,
    pub dispatcher: CommandDispatcher,
    config_store: Arc<dyn ConfigStore>,
    operator: RwLock<Option<String>>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl LinkSystem {
    /// Build every component and start the audit log writer.
    pub fn start(
        settings: LinkSettings,
        driver: Arc<dyn DeviceDriver>,
        config_store: Arc<dyn ConfigStore>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let (audit, rx_audit_events) = AuditLog::channel();
        let token_clone = token.clone();
        tracker.spawn(async move {
            task_audit_log_writer(token_clone, rx_audit_events, audit_sink).await
        });

        let broadcaster = Arc::new(TelemetryBroadcaster::new());
        let session = DeviceSession::new(
            driver,
            settings,
            broadcaster.clone(),
            token.clone(),
            tracker.clone(),
        );
        let scheduler = PollingScheduler::new(
            broadcaster.clone(),
            audit.clone(),
            token.clone(),
            tracker.clone(),
        );
        let dispatcher = CommandDispatcher::new(session.clone(), audit);

        Self {
            broadcaster,
            session,
            scheduler,
            dispatcher,
            config_store,
            operator: RwLock::new(None),
            token,
            tracker,
        }
    }

    pub async fn connect(&self) -> ConnectionState {
        self.session.connect().await
    }

    /// Load the user's config and start polling their enabled sensors.
    pub fn login(&self, username: &str) -> UserConfig {
        let config = self.config_store.load_user_config(username);
        self.scheduler.start_session(username, &config);
        *self.operator.write() = Some(username.to_owned());
        info!("User '{}' logged in.", username);
        config
    }

    /// Store a new config for the logged in user and restart polling with it.
    pub fn update_user_config(&self, config: UserConfig) {
        let Some(username) = self.operator() else {
            warn!("No user logged in. Ignoring config update.");
            return;
        };
        self.config_store.save_user_config(&username, config.clone());
        self.scheduler.start_session(&username, &config);
    }

    /// Push the logged in user's configured current range for `key` to the
    /// device. Returns the range sent, or `None` when nobody is logged in.
    pub async fn push_current_limits(
        &self,
        screen: &str,
        key: &SensorKey,
    ) -> Option<CurrentRange> {
        let origin = self.origin(screen)?;
        let range = self
            .config_store
            .load_user_config(&origin.username)
            .current_range(key);
        self.dispatcher
            .apply_current_limits(&origin, key, range)
            .await;
        Some(range)
    }

    /// Stop all polling. Readings are kept.
    pub fn logout(&self) {
        if let Some(username) = self.operator.write().take() {
            info!("User '{}' logged out.", username);
        }
        self.scheduler.clear_all();
    }

    pub fn operator(&self) -> Option<String> {
        self.operator.read().clone()
    }

    /// Origin for commands issued by the logged in user from `screen`.
    pub fn origin(&self, screen: &str) -> Option<CommandOrigin> {
        self.operator()
            .map(|username| CommandOrigin::new(&username, screen))
    }

    /// Stop polling, close the link, flush the audit log and wait for every task.
    pub async fn shutdown(self) {
        info!("Shutting down.");
        self.logout();
        self.session.close();
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Shut down.");
    }
}
