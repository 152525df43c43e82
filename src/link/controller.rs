//! Serial Link Controller - connection lifecycle and line dispatch
//!
//! Owns one connection to the cabinet controller: acquiring and opening the
//! port, the read loop, keepalive and watchdog timers, command dispatch and
//! roll gating. The consumer only sees the status stream, the roll stream and
//! the `connect` / `disconnect` / `send_result` calls.
//!
//! # Task Model
//!
//! ```text
//!                      ┌──► read loop ──► dispatch ──► roll stream
//! connect() ──► port ──┼──► keepalive (PING every 2s)
//!                      └──► watchdog (silence > 3s ⇒ Disconnected)
//! ```
//!
//! The three background tasks share [`LinkShared`] and are bound to one
//! session cancellation token. Losing the link from any task flips the
//! `connected` flag exactly once, cancels the session and schedules a
//! teardown that closes the port once the lifecycle lock is free.
//!
//! Lifecycle operations are serialized through an async mutex around the
//! active link, so no two transitions run at the same time.

use super::codec::LineCodec;
use super::error::{ConnectError, LinkError};
use super::gate::{GateDecision, RollGate, RollOutcome};
use super::protocol::{Command, OutboundMessage};
use super::session::{pause, Acquired, Linked, PortSession};
use super::status::{ConnectionState, LinkStatus, RollRequest};
use crate::config::LinkSettings;
use crate::transport::{PortProvider, PortReader, PortWriter};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATUS_CHANNEL_CAPACITY: usize = 64;
const ROLL_CHANNEL_CAPACITY: usize = 16;

type LineWriter = FramedWrite<PortWriter, LineCodec>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Log a roll gate decision at info when verbose roll logging is on.
macro_rules! roll_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Handle for one serial link to the cabinet controller.
///
/// Create one per logical connection and pass it to whatever needs it; it is
/// not a global. Dropping the controller cancels all background tasks.
///
/// # Examples
///
/// ```rust,no_run
/// use slotlink::link::SerialLinkController;
/// use slotlink::transport::serial::SerialPortProvider;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = Arc::new(SerialPortProvider::new(Some("/dev/ttyACM0".into())));
/// let controller = SerialLinkController::new(provider, None);
/// let mut rolls = controller.subscribe_rolls();
///
/// controller.connect().await?;
/// while let Ok(roll) = rolls.recv().await {
///     println!("roll #{}", roll.sequence);
///     controller.send_result(false, None).await;
/// }
/// # Ok(())
/// # }
/// ```
pub struct SerialLinkController {
    provider: Arc<dyn PortProvider>,
    shared: Arc<LinkShared>,
    pending_connect: Mutex<CancellationToken>,
}

impl SerialLinkController {
    pub fn new(provider: Arc<dyn PortProvider>, settings: Option<LinkSettings>) -> Self {
        let settings = settings.unwrap_or_default();
        info!(
            "Creating serial link controller: baud={}, port={:?}",
            settings.baud_rate, settings.port_path
        );

        let initial = if provider.is_supported() {
            ConnectionState::Disconnected
        } else {
            warn!("Serial transport is not supported on this platform");
            ConnectionState::Unsupported
        };

        Self {
            provider,
            shared: Arc::new(LinkShared::new(settings, initial)),
            pending_connect: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.provider.is_supported()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Cooldown currently applied between accepted rolls.
    pub fn active_cooldown(&self) -> Duration {
        lock(&self.shared.gate).current_cooldown()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<LinkStatus> {
        debug!("New subscriber to link status");
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_rolls(&self) -> broadcast::Receiver<RollRequest> {
        debug!("New subscriber to roll requests");
        self.shared.roll_tx.subscribe()
    }

    /// Opens the link. Takes a few seconds: the device reboots when the port opens.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if !self.provider.is_supported() {
            warn!("Connect requested but serial transport is unsupported");
            return Err(ConnectError::Unsupported);
        }

        let cancel = CancellationToken::new();
        *lock(&self.pending_connect) = cancel.clone();

        let mut active = self.shared.active.lock().await;
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        if self.shared.is_connected() {
            info!("Serial link already connected");
            return Ok(());
        }

        if let Some(stale) = active.take() {
            info!("Releasing stale port handle before reconnecting");
            self.shared.release(stale).await;
        }

        self.shared.set_state(
            ConnectionState::Connecting,
            Some("Requesting serial port".to_string()),
        );

        match self.establish(&cancel).await {
            Ok(link) => {
                *active = Some(link);
                Ok(())
            }
            Err(e) => {
                error!("Serial link connect failed: {}", e);
                self.shared
                    .set_state(ConnectionState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn establish(&self, cancel: &CancellationToken) -> Result<ActiveLink, ConnectError> {
        let settings = &self.shared.settings;

        let session =
            PortSession::<Acquired>::acquire(self.provider.as_ref(), settings, cancel).await?;
        let session = session.open(cancel).await?;
        let (session, reader, writer) = session.link().await?;
        let port_name = session.port_name().to_string();

        let token = CancellationToken::new();
        let session_id = self
            .shared
            .begin_session(FramedWrite::new(writer, LineCodec::new()), token.clone())
            .await;

        // Reader first, so nothing the device sends on boot is lost.
        let reader_task = tokio::spawn(run_read_loop(
            self.shared.clone(),
            FramedRead::new(reader, LineCodec::new()),
            token.clone(),
        ));
        let mut link = ActiveLink {
            session_id,
            session,
            token,
            reader_task,
            keepalive_task: None,
            watchdog_task: None,
        };

        self.shared.set_state(
            ConnectionState::Connected,
            Some(format!("Connected to {}", port_name)),
        );

        debug!(
            "Waiting {}ms for the device to boot",
            settings.timings.boot_delay_ms
        );
        if let Err(e) = pause(settings.timings.boot_delay(), cancel).await {
            self.shared.end_session();
            self.shared.release(link).await;
            return Err(e);
        }
        if !self.shared.is_connected() {
            self.shared.release(link).await;
            return Err(ConnectError::LostDuringBoot);
        }

        if let Err(e) = self.shared.send(OutboundMessage::ConnectedAck).await {
            warn!("Failed to send connected acknowledgement: {}", e);
        }

        self.shared.touch();
        link.keepalive_task = Some(tokio::spawn(run_keepalive(
            self.shared.clone(),
            link.token.clone(),
        )));
        link.watchdog_task = Some(tokio::spawn(run_watchdog(
            self.shared.clone(),
            link.token.clone(),
        )));

        info!("Serial link to {} established", port_name);
        Ok(link)
    }

    /// Closes the link. Best-effort: always ends in `Disconnected`.
    pub async fn disconnect(&self) {
        lock(&self.pending_connect).cancel();

        let mut active = self.shared.active.lock().await;
        let Some(link) = active.take() else {
            if !matches!(
                self.state(),
                ConnectionState::Disconnected | ConnectionState::Unsupported
            ) {
                self.shared.set_state(ConnectionState::Disconnected, None);
            }
            debug!("Disconnect requested with no active link");
            return;
        };

        info!("Disconnecting serial link");
        self.shared.set_state(
            ConnectionState::Disconnecting,
            Some("Closing serial link".to_string()),
        );

        if self.shared.is_connected() {
            if let Err(e) = self.shared.send(OutboundMessage::DisconnectNotice).await {
                debug!("Disconnect notice not sent: {}", e);
            }
            tokio::time::sleep(self.shared.settings.timings.disconnect_grace()).await;
        }

        self.shared.end_session();
        self.shared.release(link).await;
        self.shared.set_state(
            ConnectionState::Disconnected,
            Some("Disconnected".to_string()),
        );

        tokio::time::sleep(self.shared.settings.timings.post_close_cooldown()).await;
    }

    /// Reports the outcome of the last roll to the device.
    ///
    /// The matching cooldown is applied before the line is written, so a
    /// trigger the device sends right after reading it is already gated.
    pub async fn send_result(&self, is_win: bool, prize: Option<&str>) {
        if !self.shared.is_connected() {
            debug!("Ignoring roll result while disconnected");
            return;
        }

        let (outcome, message) = if is_win {
            (RollOutcome::Win, OutboundMessage::win(prize))
        } else {
            (RollOutcome::Lose, OutboundMessage::LoseNotice)
        };
        self.shared.apply_outcome(outcome);

        if let Err(e) = self.shared.send(message.clone()).await {
            warn!("Failed to send result {}: {}", message, e);
        }
    }
}

impl Drop for SerialLinkController {
    fn drop(&mut self) {
        lock(&self.pending_connect).cancel();
        self.shared.end_session();
    }
}

/// Resources of one connection, released together.
struct ActiveLink {
    session_id: u64,
    session: PortSession<Linked>,
    token: CancellationToken,
    reader_task: JoinHandle<()>,
    keepalive_task: Option<JoinHandle<()>>,
    watchdog_task: Option<JoinHandle<()>>,
}

/// State shared between the controller and its background tasks.
struct LinkShared {
    settings: LinkSettings,
    connected: AtomicBool,
    transition: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    status_tx: broadcast::Sender<LinkStatus>,
    roll_tx: broadcast::Sender<RollRequest>,
    gate: Mutex<RollGate>,
    last_received_at: Mutex<Instant>,
    session_token: Mutex<Option<CancellationToken>>,
    session_id: AtomicU64,
    // Lifecycle lock: connect, disconnect and teardown of a lost link.
    active: tokio::sync::Mutex<Option<ActiveLink>>,
    writer: tokio::sync::Mutex<Option<LineWriter>>,
    roll_sequence: AtomicU64,
}

impl LinkShared {
    fn new(settings: LinkSettings, initial: ConnectionState) -> Self {
        let (state, _) = watch::channel(initial);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (roll_tx, _) = broadcast::channel(ROLL_CHANNEL_CAPACITY);
        let gate = RollGate::new(&settings.timings);

        Self {
            settings,
            connected: AtomicBool::new(false),
            transition: Mutex::new(()),
            state,
            status_tx,
            roll_tx,
            gate: Mutex::new(gate),
            last_received_at: Mutex::new(Instant::now()),
            session_token: Mutex::new(None),
            session_id: AtomicU64::new(0),
            active: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            roll_sequence: AtomicU64::new(0),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState, message: Option<String>) {
        let _transition = lock(&self.transition);
        self.publish(state, message);
    }

    /// Re-announces `Connected` unless the link is going away.
    fn refresh_connected(&self, message: String) {
        let _transition = lock(&self.transition);
        if !self.is_connected() || *self.state.borrow() == ConnectionState::Disconnecting {
            debug!("Ignoring device ready report: {}", message);
            return;
        }
        self.publish(ConnectionState::Connected, Some(message));
    }

    fn publish(&self, state: ConnectionState, message: Option<String>) {
        let previous = self.state.send_replace(state);
        match &message {
            Some(message) => info!("Link state {} -> {}: {}", previous, state, message),
            None => info!("Link state {} -> {}", previous, state),
        }

        if self.status_tx.send(LinkStatus::new(state, message)).is_err() {
            debug!("No status subscribers");
        }
    }

    async fn begin_session(&self, writer: LineWriter, token: CancellationToken) -> u64 {
        *self.writer.lock().await = Some(writer);
        *lock(&self.gate) = RollGate::new(&self.settings.timings);
        *lock(&self.session_token) = Some(token);
        self.touch();
        let session_id = self.session_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.connected.store(true, Ordering::SeqCst);
        session_id
    }

    /// Clears the connected flag and stops the session's tasks.
    /// Returns whether the link was connected.
    fn end_session(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(token) = lock(&self.session_token).take() {
            token.cancel();
        }
        was_connected
    }

    /// Connection lost underneath us; only the first caller publishes.
    fn mark_lost(self: &Arc<Self>, state: ConnectionState, message: String) {
        if self.end_session() {
            warn!("Serial link lost: {}", message);
            self.set_state(state, Some(message));
            self.schedule_teardown(self.session_id.load(Ordering::SeqCst));
        }
    }

    /// Releases the lost session's port in the background.
    ///
    /// Runs on its own task because `release` aborts the timer tasks that
    /// may have detected the loss. If a newer session already replaced the
    /// lost one, or connect/disconnect released it first, there is nothing to do.
    fn schedule_teardown(self: &Arc<Self>, session_id: u64) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let mut active = shared.active.lock().await;
            if !active.as_ref().is_some_and(|link| link.session_id == session_id) {
                return;
            }
            if let Some(link) = active.take() {
                debug!("Tearing down lost session {}", session_id);
                shared.release(link).await;
            }
        });
    }

    fn touch(&self) {
        *lock(&self.last_received_at) = Instant::now();
    }

    fn silence(&self) -> Duration {
        lock(&self.last_received_at).elapsed()
    }

    fn apply_outcome(&self, outcome: RollOutcome) {
        let mut gate = lock(&self.gate);
        gate.set_outcome(outcome);
        roll_log!(
            self.settings.verbose_roll_logging,
            "Roll outcome {:?}, cooldown now {}ms",
            outcome,
            gate.current_cooldown().as_millis()
        );
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), LinkError> {
        tokio::time::timeout(self.settings.timings.write_timeout(), self.write_line(message))
            .await
            .map_err(|_| LinkError::WriteTimeout)?
    }

    async fn write_line(&self, message: OutboundMessage) -> Result<(), LinkError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(LinkError::NotConnected)?;
        debug!("-> {}", message);
        writer.send(message).await?;
        Ok(())
    }

    async fn handle_command(self: &Arc<Self>, command: Command) {
        self.touch();
        debug!("<- {:?}", command);

        match command {
            Command::Roll => self.handle_roll(),
            Command::Ping => {
                if let Err(e) = self.send(OutboundMessage::Pong).await {
                    warn!("Failed to answer ping: {}", e);
                }
            }
            Command::StatusQuery => {
                let ready = self.is_connected();
                if let Err(e) = self.send(OutboundMessage::StatusReply { ready }).await {
                    warn!("Failed to answer status query: {}", e);
                }
            }
            Command::Connected => {
                lock(&self.gate).reset_cooldown();
                self.refresh_connected("Device reported ready".to_string());
            }
            Command::Win(prize) => {
                debug!("Device reported win {:?}", prize);
                self.apply_outcome(RollOutcome::Win);
            }
            Command::Lose => self.apply_outcome(RollOutcome::Lose),
            Command::Pong => {}
            Command::Disconnect => {
                self.mark_lost(
                    ConnectionState::Disconnected,
                    "Device closed the connection".to_string(),
                );
            }
            Command::Unknown(raw) => warn!("Unrecognized command from device: {:?}", raw),
        }
    }

    fn handle_roll(&self) {
        let verbose = self.settings.verbose_roll_logging;
        let decision = lock(&self.gate).evaluate(Instant::now());

        match decision {
            GateDecision::Accepted => {
                let sequence = self.roll_sequence.fetch_add(1, Ordering::SeqCst) + 1;
                roll_log!(verbose, "Roll #{} accepted", sequence);
                let request = RollRequest {
                    sequence,
                    received_at: chrono::Local::now(),
                };
                if self.roll_tx.send(request).is_err() {
                    warn!("Roll #{} accepted but nobody is listening", sequence);
                }
            }
            GateDecision::Bounced { since_last } => {
                roll_log!(
                    verbose,
                    "Roll ignored as bounce ({}ms after previous trigger)",
                    since_last.as_millis()
                );
            }
            GateDecision::CoolingDown { remaining } => {
                roll_log!(
                    verbose,
                    "Roll ignored, cooldown has {}ms left",
                    remaining.as_millis()
                );
            }
        }
    }

    /// Tears down a link's tasks, streams and port. Never fails.
    async fn release(&self, link: ActiveLink) {
        let ActiveLink {
            session,
            token,
            mut reader_task,
            keepalive_task,
            watchdog_task,
            ..
        } = link;
        let timings = &self.settings.timings;

        token.cancel();
        for task in [keepalive_task, watchdog_task].into_iter().flatten() {
            task.abort();
        }
        tokio::time::sleep(timings.reader_exit_wait()).await;

        if tokio::time::timeout(timings.pipe_close_timeout(), &mut reader_task)
            .await
            .is_err()
        {
            warn!("Read loop did not stop in time, aborting it");
            reader_task.abort();
        }

        let close_writer = async {
            if let Some(mut writer) = self.writer.lock().await.take() {
                if let Err(e) = SinkExt::<OutboundMessage>::close(&mut writer).await {
                    debug!("Ignoring writer close error: {}", e);
                }
            }
        };
        if tokio::time::timeout(timings.pipe_close_timeout(), close_writer)
            .await
            .is_err()
        {
            warn!("Writer did not close in time, dropping it");
        }

        if let Err(e) = session.close().await {
            debug!("Ignoring port close error: {}", e);
        }
    }
}

async fn run_read_loop(
    shared: Arc<LinkShared>,
    mut lines: FramedRead<PortReader, LineCodec>,
    token: CancellationToken,
) {
    debug!("Read loop started");

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = lines.next() => next,
        };

        match next {
            Some(Ok(command)) => {
                if !shared.is_connected() {
                    break;
                }
                shared.handle_command(command).await;
            }
            Some(Err(e)) => {
                shared.mark_lost(ConnectionState::Error, format!("Read error: {}", e));
                break;
            }
            None => {
                shared.mark_lost(
                    ConnectionState::Disconnected,
                    "Serial stream ended".to_string(),
                );
                break;
            }
        }
    }

    debug!("Read loop stopped");
}

async fn run_keepalive(shared: Arc<LinkShared>, token: CancellationToken) {
    let period = shared.settings.timings.keepalive_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !shared.is_connected() {
            break;
        }
        if let Err(e) = shared.send(OutboundMessage::Ping).await {
            debug!("Keepalive ping failed: {}", e);
        }
    }

    debug!("Keepalive stopped");
}

async fn run_watchdog(shared: Arc<LinkShared>, token: CancellationToken) {
    let timings = &shared.settings.timings;
    let timeout = timings.watchdog_timeout();
    let mut ticker = interval_at(Instant::now() + timings.watchdog_poll(), timings.watchdog_poll());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !shared.is_connected() {
            break;
        }

        let silence = shared.silence();
        if silence > timeout {
            shared.mark_lost(
                ConnectionState::Disconnected,
                format!(
                    "Connection timed out: no data from device for {}ms",
                    silence.as_millis()
                ),
            );
            break;
        }
    }

    debug!("Watchdog stopped");
}
