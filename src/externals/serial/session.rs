use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    config::LinkSettings,
    externals::telemetry::broadcaster::TelemetryBroadcaster,
    models::{command::OutboundCommand, connection_state::ConnectionState},
};

use super::{
    framer::LineFramer,
    services::{DeviceDriver, DeviceInfo, OpenLink, SessionError},
};

const READ_BUFFER_SIZE: usize = 1024;

/// Owns the connection to the controller: discovery, permission, open,
/// the background reader, outbound writes and teardown.
///
/// Transport failures never reach the caller. They are logged and the
/// session falls back to `Disconnected`; the operator has to reconnect.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    driver: Arc<dyn DeviceDriver>,
    settings: LinkSettings,
    broadcaster: Arc<TelemetryBroadcaster>,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<SessionSlot>,
    token: CancellationToken,
    tracker: TaskTracker,
}

/// Everything guarded together with state transitions. Never held across an await.
#[derive(Default)]
struct SessionSlot {
    link: Option<ActiveLink>,
    pending_permission: Option<PendingPermission>,
    generation: u64,
}

struct ActiveLink {
    device: DeviceInfo,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// Set when a write outlived the write timeout.
    write_stalled: Arc<AtomicBool>,
    reader_token: CancellationToken,
    generation: u64,
}

/// The single continuation waiting on the platform's permission answer.
struct PendingPermission {
    device: DeviceInfo,
    respond: oneshot::Sender<bool>,
}

impl DeviceSession {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        settings: LinkSettings,
        broadcaster: Arc<TelemetryBroadcaster>,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                driver,
                settings,
                broadcaster,
                state,
                slot: Mutex::new(SessionSlot::default()),
                token,
                tracker,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Live view of the connection state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The device behind the open handle, if any.
    pub fn connected_device(&self) -> Option<DeviceInfo> {
        self.inner
            .slot
            .lock()
            .link
            .as_ref()
            .map(|link| link.device.clone())
    }

    /// First compatible attached device. Only one device is supported.
    #[instrument(skip_all)]
    pub fn discover(&self) -> Option<DeviceInfo> {
        let devices = match self.inner.driver.discover() {
            Ok(devices) => devices,
            Err(e) => {
                error!("Failed to discover devices. Error: {}", e);
                return None;
            }
        };
        trace!("Found {} compatible devices.", devices.len());

        match devices.into_iter().next() {
            Some(device) => {
                info!("Found device {}.", device);
                Some(device)
            }
            None => {
                error!("{}", SessionError::NoDevice);
                None
            }
        }
    }

    /// Discover and connect to the first compatible device.
    pub async fn connect(&self) -> ConnectionState {
        match self.discover() {
            Some(device) => self.request_access(device).await,
            None => self.state(),
        }
    }

    /// Open `device`, asking the platform for permission first if needed.
    ///
    /// While a permission request is pending this waits until
    /// `resolve_permission` is called, the optional permission timeout runs
    /// out, or the session is closed.
    #[instrument(skip_all)]
    pub async fn request_access(&self, device: DeviceInfo) -> ConnectionState {
        if self.inner.driver.has_permission(&device) {
            if !self.leave_disconnected(ConnectionState::Connecting) {
                return self.state();
            }
            return self.open(device).await;
        }

        let (respond, answer) = oneshot::channel();
        {
            let mut slot = self.inner.slot.lock();
            let state = *self.inner.state.borrow();
            if state != ConnectionState::Disconnected {
                warn!("Session is already {}. Ignoring access request.", state);
                return state;
            }
            slot.pending_permission = Some(PendingPermission {
                device: device.clone(),
                respond,
            });
            self.inner
                .state
                .send_replace(ConnectionState::AwaitingPermission);
        }
        info!("Requesting permission for device {}.", device);
        self.inner.driver.request_permission(&device);

        let answer = match self.inner.settings.permission_timeout() {
            None => answer.await,
            Some(timeout) => match tokio::time::timeout(timeout, answer).await {
                Ok(answer) => answer,
                Err(_) => {
                    error!(
                        "{}",
                        SessionError::PermissionTimeout(device.clone(), timeout)
                    );
                    let mut slot = self.inner.slot.lock();
                    slot.pending_permission = None;
                    self.transition(
                        ConnectionState::AwaitingPermission,
                        ConnectionState::Disconnected,
                    );
                    return self.state();
                }
            },
        };

        match answer {
            Ok(true) => {
                info!("Permission granted for device {}.", device);
                let _slot = self.inner.slot.lock();
                if !self.transition(
                    ConnectionState::AwaitingPermission,
                    ConnectionState::Connecting,
                ) {
                    warn!("Session was closed while awaiting permission.");
                    return self.state();
                }
            }
            Ok(false) => {
                error!("{}", SessionError::PermissionDenied(device));
                let _slot = self.inner.slot.lock();
                self.transition(ConnectionState::AwaitingPermission, ConnectionState::Disconnected);
                return self.state();
            }
            Err(_) => {
                warn!("Permission request was cancelled.");
                return self.state();
            }
        }

        self.open(device).await
    }

    /// Platform callback carrying the answer to the pending permission
    /// request. Resolves it exactly once; returns false if nothing was pending.
    pub fn resolve_permission(&self, granted: bool) -> bool {
        let pending = self.inner.slot.lock().pending_permission.take();
        match pending {
            Some(pending) => {
                debug!(
                    "Resolving permission for device {}. Granted: {}",
                    pending.device, granted
                );
                if pending.respond.send(granted).is_err() {
                    warn!("Permission request was abandoned before the answer arrived.");
                }
                true
            }
            None => {
                warn!("Received a permission answer with no pending request. Ignoring.");
                false
            }
        }
    }

    /// Acquire the handle and start the reader. Expects state `Connecting`.
    async fn open(&self, device: DeviceInfo) -> ConnectionState {
        let OpenLink { reader, writer } =
            match self.inner.driver.open(&device, &self.inner.settings) {
                Ok(link) => link,
                Err(e) => {
                    error!("{}", e);
                    let _slot = self.inner.slot.lock();
                    self.transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                    return self.state();
                }
            };

        let reader_token = self.inner.token.child_token();
        let generation = {
            let mut slot = self.inner.slot.lock();
            if *self.inner.state.borrow() != ConnectionState::Connecting {
                warn!("Session was closed while opening device {}. Dropping handle.", device);
                return self.state();
            }
            slot.generation += 1;
            slot.link = Some(ActiveLink {
                device: device.clone(),
                writer: Arc::new(Mutex::new(writer)),
                write_stalled: Arc::new(AtomicBool::new(false)),
                reader_token: reader_token.clone(),
                generation: slot.generation,
            });
            self.inner.state.send_replace(ConnectionState::Connected);
            slot.generation
        };

        self.spawn_reader(reader, reader_token, generation);
        info!("Serial connection established with {}.", device);
        ConnectionState::Connected
    }

    fn spawn_reader(
        &self,
        reader: Box<dyn Read + Send>,
        token: CancellationToken,
        generation: u64,
    ) {
        let session = self.clone();
        let broadcaster = self.inner.broadcaster.clone();
        let framer = LineFramer::new(self.inner.settings.max_line_bytes);

        self.inner.tracker.spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                read_lines_until_cancelled(reader, framer, &broadcaster, &token)
            })
            .await;

            match result {
                Ok(Ok(())) => debug!("Reader stopped."),
                Ok(Err(e)) => error!("Reader stopped. Error: {}", e),
                Err(e) => error!("Reader task failed. Error: {}", e),
            }
            session.teardown(Some(generation));
        });
    }

    /// Send `command` followed by the configured terminator.
    ///
    /// Dropped when not connected, or while an earlier write that timed out
    /// still holds the port. Waits at most the write timeout; failures and
    /// timeouts are logged and never returned.
    #[instrument(skip_all)]
    pub async fn write(&self, command: &OutboundCommand) {
        let (writer, write_stalled) = {
            let slot = self.inner.slot.lock();
            match (&slot.link, *self.inner.state.borrow()) {
                (Some(link), ConnectionState::Connected) => {
                    (link.writer.clone(), link.write_stalled.clone())
                }
                (_, state) => {
                    warn!("Session is {}. Dropping command '{}'.", state, command);
                    return;
                }
            }
        };

        if write_stalled.load(Ordering::SeqCst) {
            if writer.is_locked() {
                warn!(
                    "An earlier write is still blocked. Dropping command '{}'.",
                    command
                );
                return;
            }
            write_stalled.store(false, Ordering::SeqCst);
        }

        let mut payload = command.as_str().as_bytes().to_vec();
        payload.extend_from_slice(self.inner.settings.command_terminator.as_bytes());

        let timeout = self.inner.settings.write_timeout();
        let write = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let Some(mut writer) = writer.try_lock_for(timeout) else {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "port is held by another write",
                ));
            };
            writer.write_all(&payload)?;
            writer.flush()
        });

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(Ok(()))) => debug!("Wrote command '{}'.", command),
            Ok(Ok(Err(e))) => error!("Failed to write command '{}'. Error: {}", command, e),
            Ok(Err(e)) => error!("Write task for '{}' failed. Error: {}", command, e),
            Err(_) => {
                write_stalled.store(true, Ordering::SeqCst);
                error!(
                    "Timed out writing command '{}' after {:?}.",
                    command, timeout
                );
            }
        }
    }

    /// Release the handle, stop the reader and abandon any pending
    /// permission request. Safe to call at any time.
    pub fn close(&self) {
        if self.teardown(None) {
            info!("Serial connection closed.");
        }
    }

    /// Platform notification that `device` was detached.
    pub fn device_removed(&self, device: &DeviceInfo) {
        let is_ours = self
            .inner
            .slot
            .lock()
            .link
            .as_ref()
            .map(|link| link.device.port_name == device.port_name)
            .unwrap_or(false);
        if is_ours {
            warn!("Device {} was removed.", device);
            self.teardown(None);
        } else {
            trace!("Ignoring removal of unrelated device {}.", device);
        }
    }

    /// Drop the link and any pending request. With `Some(generation)` only
    /// the link of that generation is torn down, so a reader that outlived
    /// its connection can't close a newer one. Returns true if anything changed.
    fn teardown(&self, generation: Option<u64>) -> bool {
        let mut slot = self.inner.slot.lock();
        if let (Some(generation), Some(link)) = (generation, &slot.link) {
            if link.generation != generation {
                trace!("Reader of an old connection stopped.");
                return false;
            }
        }
        if generation.is_some() && slot.link.is_none() {
            return false;
        }

        let had_pending = slot.pending_permission.take().is_some();
        let link = slot.link.take();
        if let Some(link) = &link {
            link.reader_token.cancel();
            if generation.is_some() {
                warn!("Lost connection to device {}.", link.device);
            }
        }
        let changed = self
            .inner
            .state
            .send_if_modified(|state| {
                let modified = *state != ConnectionState::Disconnected;
                *state = ConnectionState::Disconnected;
                modified
            });
        changed || had_pending || link.is_some()
    }

    /// `Disconnected -> next`. False if the session was not disconnected.
    fn leave_disconnected(&self, next: ConnectionState) -> bool {
        let _slot = self.inner.slot.lock();
        let state = *self.inner.state.borrow();
        if state != ConnectionState::Disconnected {
            warn!("Session is already {}. Ignoring access request.", state);
            return false;
        }
        self.inner.state.send_replace(next);
        true
    }

    /// `from -> to` if the state is still `from`. Caller holds the slot lock.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        })
    }
}

/// Blocking read loop run on its own thread. Returns `Ok` when cancelled
/// and `Err` when the link fails or reaches end of stream.
fn read_lines_until_cancelled(
    mut reader: Box<dyn Read + Send>,
    mut framer: LineFramer,
    broadcaster: &TelemetryBroadcaster,
    token: &CancellationToken,
) -> io::Result<()> {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        match reader.read(&mut buffer) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Device closed the stream.",
                ))
            }
            Ok(count) => {
                trace!("Received {} bytes.", count);
                for line in framer.feed(&buffer[..count]) {
                    debug!("Received line: {}", line);
                    broadcaster.publish(line);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use crate::{
        externals::serial::mock::{mock_device, MockDriver},
        models::raw_line::RawLine,
    };

    use super::*;

    struct Fixture {
        driver: Arc<MockDriver>,
        broadcaster: Arc<TelemetryBroadcaster>,
        session: DeviceSession,
    }

    fn fixture(driver: MockDriver, settings: LinkSettings) -> Fixture {
        let driver = Arc::new(driver);
        let broadcaster = Arc::new(TelemetryBroadcaster::new());
        let session = DeviceSession::new(
            driver.clone(),
            settings,
            broadcaster.clone(),
            CancellationToken::new(),
            TaskTracker::new(),
        );
        Fixture {
            driver,
            broadcaster,
            session,
        }
    }

    async fn wait_for_state(session: &DeviceSession, expected: ConnectionState) {
        let mut receiver = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), receiver.wait_for(|s| *s == expected))
            .await
            .expect("Timed out waiting for state.")
            .expect("Session dropped.");
    }

    async fn wait_for_line(broadcaster: &TelemetryBroadcaster, expected: &str) {
        let mut receiver = broadcaster.subscribe_latest_line();
        tokio::time::timeout(
            Duration::from_secs(2),
            receiver.wait_for(|line| line.as_ref().map(RawLine::as_str) == Some(expected)),
        )
        .await
        .expect("Timed out waiting for line.")
        .expect("Broadcaster dropped.");
    }

    #[tokio::test]
    async fn test_connect_reads_lines_into_broadcaster() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());

        assert_eq!(f.session.connect().await, ConnectionState::Connected);
        assert_eq!(f.session.connected_device(), Some(mock_device()));

        f.driver.push(b"TEMP=1\nLO");
        f.driver.push(b"AD=2\n");
        wait_for_line(&f.broadcaster, "LOAD=2").await;

        f.session.close();
    }

    #[tokio::test]
    async fn test_write_appends_terminator() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());
        f.session.connect().await;

        f.session.write(&OutboundCommand::from("SERVO_STOP")).await;
        f.session.write(&OutboundCommand::from("ACT_TARGET=40")).await;
        assert_eq!(f.driver.written(), "SERVO_STOP\nACT_TARGET=40\n");

        f.session.close();
    }

    #[tokio::test]
    async fn test_write_while_disconnected_is_dropped() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());

        f.session.write(&OutboundCommand::from("TEMP_ON")).await;
        assert_eq!(f.driver.written(), "");
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_timeout_returns_normally() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());
        f.driver.set_write_delay(Duration::from_millis(1500));
        f.session.connect().await;

        let started = std::time::Instant::now();
        f.session.write(&OutboundCommand::from("SERVO_FWD_START")).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1400), "{:?}", elapsed);
        assert_eq!(f.session.state(), ConnectionState::Connected);

        f.session.close();
    }

    #[tokio::test]
    async fn test_writes_behind_a_stalled_write_are_dropped() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());
        f.driver.set_write_delay(Duration::from_millis(1500));
        f.session.connect().await;

        f.session.write(&OutboundCommand::from("SERVO_FWD_START")).await;

        let started = std::time::Instant::now();
        f.session.write(&OutboundCommand::from("SERVO_STOP")).await;
        assert!(started.elapsed() < Duration::from_millis(100));

        // Once the stuck write completes the port takes commands again.
        tokio::time::sleep(Duration::from_millis(700)).await;
        f.driver.set_write_delay(Duration::ZERO);
        f.session.write(&OutboundCommand::from("SERVO_STOP")).await;
        assert_eq!(f.driver.written(), "SERVO_FWD_START\nSERVO_STOP\n");

        f.session.close();
    }

    #[tokio::test]
    async fn test_no_device_stays_disconnected() {
        let f = fixture(MockDriver::new(vec![], true), LinkSettings::default());

        assert_eq!(f.session.discover(), None);
        assert_eq!(f.session.connect().await, ConnectionState::Disconnected);
        assert_eq!(f.driver.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_failure_falls_back_to_disconnected() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());
        f.driver.set_fail_open(true);

        assert_eq!(f.session.connect().await, ConnectionState::Disconnected);
        assert_eq!(f.session.connected_device(), None);
    }

    #[tokio::test]
    async fn test_second_connect_keeps_single_handle() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());

        assert_eq!(f.session.connect().await, ConnectionState::Connected);
        assert_eq!(f.session.connect().await, ConnectionState::Connected);
        assert_eq!(f.driver.opens.load(Ordering::SeqCst), 1);

        f.session.close();
    }

    #[tokio::test]
    async fn test_permission_granted_opens_device() {
        let f = fixture(
            MockDriver::new(vec![mock_device()], false),
            LinkSettings::default(),
        );

        let session = f.session.clone();
        let connecting = tokio::spawn(async move { session.connect().await });
        wait_for_state(&f.session, ConnectionState::AwaitingPermission).await;
        assert_eq!(f.driver.permission_requests.load(Ordering::SeqCst), 1);

        assert!(f.session.resolve_permission(true));
        let state = connecting.await.expect("Connect task failed.");
        assert_eq!(state, ConnectionState::Connected);

        // Resolves exactly once.
        assert!(!f.session.resolve_permission(true));
        f.session.close();
    }

    #[tokio::test]
    async fn test_permission_denied_returns_to_disconnected() {
        let f = fixture(
            MockDriver::new(vec![mock_device()], false),
            LinkSettings::default(),
        );

        let session = f.session.clone();
        let connecting = tokio::spawn(async move { session.connect().await });
        wait_for_state(&f.session, ConnectionState::AwaitingPermission).await;

        assert!(f.session.resolve_permission(false));
        let state = connecting.await.expect("Connect task failed.");
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(f.driver.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_permission() {
        let f = fixture(
            MockDriver::new(vec![mock_device()], false),
            LinkSettings::default(),
        );

        let session = f.session.clone();
        let connecting = tokio::spawn(async move { session.connect().await });
        wait_for_state(&f.session, ConnectionState::AwaitingPermission).await;

        f.session.close();
        let state = connecting.await.expect("Connect task failed.");
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(!f.session.resolve_permission(true));
    }

    #[tokio::test]
    async fn test_permission_timeout() {
        let settings = LinkSettings {
            permission_timeout_ms: Some(50),
            ..Default::default()
        };
        let f = fixture(MockDriver::new(vec![mock_device()], false), settings);

        assert_eq!(f.session.connect().await, ConnectionState::Disconnected);
        assert!(!f.session.resolve_permission(true));
    }

    #[tokio::test]
    async fn test_unplug_disconnects() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());
        f.session.connect().await;

        f.driver.unplug();
        wait_for_state(&f.session, ConnectionState::Disconnected).await;
        assert_eq!(f.session.connected_device(), None);

        // The operator can reconnect afterwards.
        assert_eq!(f.session.connect().await, ConnectionState::Connected);
        f.session.close();
    }

    #[tokio::test]
    async fn test_device_removed_notification() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());
        f.session.connect().await;

        let mut other = mock_device();
        other.port_name = "/dev/ttyOTHER".into();
        f.session.device_removed(&other);
        assert_eq!(f.session.state(), ConnectionState::Connected);

        f.session.device_removed(&mock_device());
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture(MockDriver::authorized(), LinkSettings::default());
        f.session.close();
        f.session.connect().await;
        f.session.close();
        f.session.close();
        assert_eq!(f.session.state(), ConnectionState::Disconnected);
    }
}
