//! [`ConnectionManager`] – a telemetry feed that never goes quiet.
//!
//! One background task drives the connection state machine:
//!
//! ```text
//! Disconnected ─► Connecting ─ok─► Connected ─close/error─► Reconnecting(1)
//!                     │                ▲                        │
//!                     └─fail─► Reconnecting(n) ─ok──────────────┘
//!                                      │ n > max_attempts
//!                                      ▼
//!                                    Failed ─cooldown or reconnect()─► Reconnecting(1)
//! ```
//!
//! Whenever the state is anything but `Connected`, a local aggregator over
//! synthetic sources feeds the same stream at the same cadence, so consumers
//! see one uninterrupted sequence of [`FeedItem`]s tagged with their origin.
//! After a live session the fallback resumes from the last live snapshot:
//! sequence numbers keep rising and position and charge start from their
//! last known values.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use evdash_hal::{GnssModule, HardwareSource, SimRegistry, SourceRegistry, VehicleBus};
use evdash_kernel::{AggregatorConfig, StateAggregator};
use evdash_types::{
    Command, EvError, GpsUpdate, ServerMessage, VehicleSettings, VehicleSnapshot,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FEED_CAPACITY: usize = 64;
const RESPONSE_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server endpoint, e.g. `ws://localhost:8765`.
    pub url: String,
    /// Fixed wait between connection attempts.
    pub reconnect_delay: Duration,
    /// Reconnect attempts per cycle before entering `Failed`.
    pub max_attempts: u32,
    /// Wait in `Failed` before a fresh cycle. `None` waits for
    /// [`ConnectionManager::reconnect`].
    pub failed_cooldown: Option<Duration>,
    /// Upper bound on a single handshake.
    pub connect_timeout: Duration,
    /// Cadence of the synthetic fallback feed.
    pub synthetic_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".to_string(),
            reconnect_delay: Duration::from_millis(2000),
            max_attempts: 5,
            failed_cooldown: Some(Duration::from_millis(30_000)),
            connect_timeout: Duration::from_secs(5),
            synthetic_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Attempt number within the current cycle, starting at 1.
    Reconnecting(u32),
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(n) => write!(f, "reconnecting (attempt {n})"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrigin {
    Live,
    Synthetic,
}

impl std::fmt::Display for FeedOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FeedOrigin::Live => "live",
            FeedOrigin::Synthetic => "synthetic",
        })
    }
}

#[derive(Debug, Clone)]
pub struct FeedItem {
    pub snapshot: Arc<VehicleSnapshot>,
    pub origin: FeedOrigin,
}

/// What happened to a command handed to [`ConnectionManager::send_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued on the live connection; the server's verdict arrives on the
    /// response stream.
    Sent,
    /// Not connected. Commands are never queued for later.
    Dropped,
}

struct Shared {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    feed: broadcast::Sender<FeedItem>,
    responses: broadcast::Sender<ServerMessage>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    last_live: Mutex<Option<Arc<VehicleSnapshot>>>,
    retry_now: Notify,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "connection state changed");
        }
    }
}

/// Handle to the background connection task.  Dropping it does not stop
/// the task; cancel the token passed to [`ConnectionManager::start`].
pub struct ConnectionManager {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Spawn the connection task.  The feed starts immediately, synthetic
    /// until the first connection succeeds.
    pub fn start(config: ClientConfig, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let (responses, _) = broadcast::channel(RESPONSE_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            state,
            feed,
            responses,
            outbound: Mutex::new(None),
            last_live: Mutex::new(None),
            retry_now: Notify::new(),
        });

        tokio::spawn(drive(Arc::clone(&shared), cancel.clone()));
        Self { shared, cancel }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Follow state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Snapshots from the server or the synthetic fallback.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedItem> {
        self.shared.feed.subscribe()
    }

    /// Command responses and error frames from the server.
    pub fn responses(&self) -> broadcast::Receiver<ServerMessage> {
        self.shared.responses.subscribe()
    }

    /// Send a command over the live connection.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::Serialization`] if the command cannot be encoded.
    pub fn send_command(&self, command: &Command) -> Result<SendOutcome, EvError> {
        self.send_with_id(command, None)
    }

    /// Like [`send_command`](Self::send_command) with a `request_id` the
    /// server echoes in its response.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::Serialization`] if the command cannot be encoded.
    pub fn send_with_id(
        &self,
        command: &Command,
        request_id: Option<&str>,
    ) -> Result<SendOutcome, EvError> {
        let mut envelope = serde_json::to_value(command)?;
        if let (Some(id), Some(obj)) = (request_id, envelope.as_object_mut()) {
            obj.insert("request_id".to_string(), id.into());
        }
        let text = serde_json::to_string(&envelope)?;

        let outbound = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let sent = match outbound {
            Some(tx) if self.state().is_connected() => tx.try_send(text).is_ok(),
            _ => false,
        };
        if sent {
            debug!(action = command.action(), "command sent");
            Ok(SendOutcome::Sent)
        } else {
            warn!(action = command.action(), state = %self.state(), "not connected; command dropped");
            Ok(SendOutcome::Dropped)
        }
    }

    /// Skip the current wait and try to connect now.  In `Failed` this
    /// starts a fresh cycle.
    pub fn reconnect(&self) {
        self.shared.retry_now.notify_one();
    }

    /// Stop the connection task and the synthetic feed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Local aggregator over synthetic sources, stopped on drop.
struct SyntheticFeed {
    cancel: CancellationToken,
}

impl SyntheticFeed {
    fn start(shared: &Arc<Shared>, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let config = AggregatorConfig {
            interval: shared.config.synthetic_interval,
            ..AggregatorConfig::default()
        };
        let last = shared
            .last_live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let (aggregator, _handle, bus) = match last {
            Some(last) => {
                debug!(seq = last.seq, "synthetic feed resuming from last live snapshot");
                StateAggregator::resume(resumed_registry(&last), (*last).clone(), config)
            }
            None => StateAggregator::new(
                SimRegistry::full().build(),
                VehicleSettings::default(),
                config,
            ),
        };

        let mut rx = bus.subscribe();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = aggregator.run(task_cancel).await {
                error!(error = %e, "synthetic aggregator failed");
            }
        });

        let feed = shared.feed.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(snapshot) => {
                            let _ = feed.send(FeedItem { snapshot, origin: FeedOrigin::Synthetic });
                        }
                        None => break,
                    },
                }
            }
        });

        info!("synthetic feed started");
        Self { cancel }
    }
}

/// Synthetic sources that pick up where `last` left off.
fn resumed_registry(last: &VehicleSnapshot) -> SourceRegistry {
    let mut gnss = GnssModule::synthetic();
    let fix = &last.gps;
    let hold = Command::UpdateGps(GpsUpdate {
        latitude: fix.latitude,
        longitude: fix.longitude,
        altitude: Some(fix.altitude),
        speed: Some(fix.speed_gps),
        heading: Some(fix.heading),
        accuracy: Some(fix.accuracy),
    });
    if let Err(e) = gnss.apply(&hold) {
        warn!(error = %e, "could not seed synthetic position");
    }
    SimRegistry::builder()
        .with_climate()
        .with_source(Box::new(VehicleBus::synthetic_from_soc(last.battery_soc)))
        .with_source(Box::new(gnss))
        .with_media()
        .with_parking()
        .build()
}

impl Drop for SyntheticFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
        info!("synthetic feed stopped");
    }
}

async fn drive(shared: Arc<Shared>, cancel: CancellationToken) {
    let config = shared.config.clone();
    let mut synthetic = Some(SyntheticFeed::start(&shared, &cancel));
    // The attempt about to be made in the current cycle; 0 for the very
    // first connection.
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting(attempt)
        });

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(
                config.connect_timeout,
                tokio_tungstenite::connect_async(config.url.as_str()),
            ) => match result {
                Ok(Ok((ws, _))) => Some(ws),
                Ok(Err(e)) => {
                    warn!(url = %config.url, attempt, error = %e, "connect failed");
                    None
                }
                Err(_) => {
                    warn!(url = %config.url, attempt, "connect timed out");
                    None
                }
            },
        };

        if let Some(ws) = connected {
            synthetic = None;
            let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
            *shared.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
            shared.set_state(ConnectionState::Connected);

            run_connection(&shared, ws, rx, &cancel).await;

            *shared.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
            if cancel.is_cancelled() {
                break;
            }
            // Consumers must see the state change before the first synthetic
            // item.
            attempt = 1;
            shared.set_state(ConnectionState::Reconnecting(attempt));
            synthetic = Some(SyntheticFeed::start(&shared, &cancel));
            if !wait_to_retry(&shared, &cancel, config.reconnect_delay).await {
                break;
            }
            continue;
        }

        if attempt >= config.max_attempts {
            shared.set_state(ConnectionState::Failed);
            error!(
                url = %config.url,
                max_attempts = config.max_attempts,
                "reconnection limit reached"
            );
            match config.failed_cooldown {
                Some(cooldown) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = shared.retry_now.notified() => {}
                    _ = tokio::time::sleep(cooldown) => {}
                },
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = shared.retry_now.notified() => {}
                },
            }
            attempt = 1;
            continue;
        }

        if !wait_to_retry(&shared, &cancel, config.reconnect_delay).await {
            break;
        }
        attempt += 1;
    }

    drop(synthetic);
    *shared.outbound.lock().unwrap_or_else(|e| e.into_inner()) = None;
    shared.set_state(ConnectionState::Disconnected);
    debug!("connection task exiting");
}

/// Sleep out the reconnect delay, or less if [`ConnectionManager::reconnect`]
/// is called. `false` once cancelled.
async fn wait_to_retry(shared: &Shared, cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = shared.retry_now.notified() => true,
        _ = tokio::time::sleep(delay) => true,
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Pump one live connection until it closes, errors or is cancelled.
async fn run_connection(
    shared: &Shared,
    ws: WsStream,
    mut outbound: mpsc::Receiver<String>,
    cancel: &CancellationToken,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!(error = %e, "send failed");
                    return;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(shared, text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    info!("server closed the connection");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "connection error");
                    return;
                }
            },
        }
    }
}

fn handle_frame(shared: &Shared, text: &str) {
    match ServerMessage::from_json(text) {
        Ok(ServerMessage::Telemetry(snapshot)) => {
            let snapshot = Arc::new(*snapshot);
            *shared.last_live.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(Arc::clone(&snapshot));
            let _ = shared.feed.send(FeedItem {
                snapshot,
                origin: FeedOrigin::Live,
            });
        }
        Ok(ServerMessage::Connection { message, .. }) => info!(%message, "server greeting"),
        Ok(message) => {
            if let ServerMessage::Error { message } = &message {
                warn!(%message, "server reported an error");
            }
            let _ = shared.responses.send(message);
        }
        Err(e) => warn!(error = %e, "unreadable frame from server"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdash_cockpit::{BroadcastServer, ServerConfig};
    use evdash_kernel::{CommandDispatcher, CommandValidator};
    use evdash_middleware::SnapshotHistory;
    use evdash_types::ResponseStatus;
    use std::net::SocketAddr;

    fn fast_config(url: String) -> ClientConfig {
        ClientConfig {
            url,
            reconnect_delay: Duration::from_millis(30),
            max_attempts: 2,
            failed_cooldown: None,
            connect_timeout: Duration::from_millis(500),
            synthetic_interval: Duration::from_millis(20),
        }
    }

    /// A port nothing listens on (bound, then released).
    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn start_server(port: u16, cancel: &CancellationToken) -> SocketAddr {
        let (agg, handle, bus) = StateAggregator::new(
            SimRegistry::full().build(),
            VehicleSettings::default(),
            AggregatorConfig {
                interval: Duration::from_millis(20),
                ..AggregatorConfig::default()
            },
        );
        tokio::spawn(agg.run(cancel.clone()));
        let bound = BroadcastServer::new(
            ServerConfig {
                host: "127.0.0.1".to_string(),
                port,
                ..ServerConfig::default()
            },
            bus,
            CommandDispatcher::new(CommandValidator::standard(), handle),
            SnapshotHistory::default(),
        )
        .bind()
        .await
        .unwrap();
        let addr = bound.local_addr();
        tokio::spawn(bound.run(cancel.clone()));
        addr
    }

    async fn next_with_origin(rx: &mut broadcast::Receiver<FeedItem>, origin: FeedOrigin) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match rx.recv().await {
                    Ok(item) if item.origin == origin => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("feed closed: {e}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {origin} item"));
    }

    async fn wait_for(manager: &ConnectionManager, want: ConnectionState) {
        let mut rx = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("never reached {want}"))
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_falls_back_then_fails() {
        let port = free_port().await;
        let cancel = CancellationToken::new();
        let manager = ConnectionManager::start(fast_config(format!("ws://127.0.0.1:{port}")), cancel.clone());
        let mut feed = manager.subscribe();

        next_with_origin(&mut feed, FeedOrigin::Synthetic).await;
        wait_for(&manager, ConnectionState::Failed).await;

        // The feed keeps going while failed.
        next_with_origin(&mut feed, FeedOrigin::Synthetic).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn commands_while_disconnected_are_dropped() {
        let port = free_port().await;
        let cancel = CancellationToken::new();
        let manager = ConnectionManager::start(fast_config(format!("ws://127.0.0.1:{port}")), cancel.clone());
        let outcome = manager
            .send_command(&Command::SetChargeLimit { value: 80 })
            .unwrap();
        assert_eq!(outcome, SendOutcome::Dropped);
        cancel.cancel();
    }

    #[tokio::test]
    async fn live_feed_and_correlated_response() {
        let cancel = CancellationToken::new();
        let addr = start_server(0, &cancel).await;
        let manager = ConnectionManager::start(fast_config(format!("ws://{addr}")), cancel.clone());
        let mut feed = manager.subscribe();
        let mut responses = manager.responses();

        wait_for(&manager, ConnectionState::Connected).await;
        next_with_origin(&mut feed, FeedOrigin::Live).await;

        let outcome = manager
            .send_with_id(&Command::SetChargeLimit { value: 90 }, Some("c-1"))
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent);

        let reply = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .unwrap()
            .unwrap();
        let ServerMessage::Response {
            action,
            status,
            request_id,
            ..
        } = reply
        else {
            panic!("expected response, got {reply:?}");
        };
        assert_eq!(action, "set_charge_limit");
        assert_eq!(status, ResponseStatus::Success);
        assert_eq!(request_id.as_deref(), Some("c-1"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn resumes_live_when_server_returns() {
        let port = free_port().await;
        let cancel = CancellationToken::new();
        let mut config = fast_config(format!("ws://127.0.0.1:{port}"));
        config.max_attempts = 1_000;
        let manager = ConnectionManager::start(config, cancel.clone());
        let mut feed = manager.subscribe();
        next_with_origin(&mut feed, FeedOrigin::Synthetic).await;

        let server_cancel = cancel.child_token();
        start_server(port, &server_cancel).await;
        wait_for(&manager, ConnectionState::Connected).await;
        next_with_origin(&mut feed, FeedOrigin::Live).await;

        // Server goes away: back to synthetic without a gap in the stream.
        server_cancel.cancel();
        next_with_origin(&mut feed, FeedOrigin::Synthetic).await;
        assert!(!manager.state().is_connected());
        cancel.cancel();
    }

    #[tokio::test]
    async fn losing_the_server_reports_reconnecting_at_once() {
        let cancel = CancellationToken::new();
        let server_cancel = cancel.child_token();
        let addr = start_server(0, &server_cancel).await;
        let mut config = fast_config(format!("ws://{addr}"));
        config.reconnect_delay = Duration::from_secs(2);
        let manager = ConnectionManager::start(config, cancel.clone());
        wait_for(&manager, ConnectionState::Connected).await;

        let mut states = manager.watch_state();
        server_cancel.cancel();
        let lost = tokio::time::Instant::now();
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|s| *s == ConnectionState::Reconnecting(1)),
        )
        .await
        .unwrap_or_else(|_| panic!("still {} after server loss", manager.state()))
        .unwrap();
        assert!(lost.elapsed() < Duration::from_secs(1));
        cancel.cancel();
    }

    #[tokio::test]
    async fn fallback_continues_from_last_live_snapshot() {
        let cancel = CancellationToken::new();
        let server_cancel = cancel.child_token();
        let addr = start_server(0, &server_cancel).await;
        let mut config = fast_config(format!("ws://{addr}"));
        config.max_attempts = 1_000;
        let manager = ConnectionManager::start(config, cancel.clone());
        let mut feed = manager.subscribe();

        // Drop the server as soon as live data flows; remember the last
        // live item seen before the fallback takes over.
        let mut last_live: Option<Arc<VehicleSnapshot>> = None;
        let first_synthetic = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match feed.recv().await {
                    Ok(item) if item.origin == FeedOrigin::Live => {
                        if last_live.is_none() {
                            server_cancel.cancel();
                        }
                        last_live = Some(item.snapshot);
                    }
                    Ok(item) if last_live.is_some() => return item.snapshot,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("feed closed: {e}"),
                }
            }
        })
        .await
        .unwrap();
        let last_live = last_live.unwrap();

        assert!(first_synthetic.seq > last_live.seq);
        assert_eq!(first_synthetic.gps.latitude, last_live.gps.latitude);
        assert_eq!(first_synthetic.gps.longitude, last_live.gps.longitude);
        assert!((first_synthetic.battery_soc - last_live.battery_soc).abs() <= 0.1);
        assert_eq!(first_synthetic.settings, last_live.settings);
        cancel.cancel();
    }

    #[tokio::test]
    async fn manual_reconnect_leaves_failed() {
        let port = free_port().await;
        let cancel = CancellationToken::new();
        let manager = ConnectionManager::start(fast_config(format!("ws://127.0.0.1:{port}")), cancel.clone());
        wait_for(&manager, ConnectionState::Failed).await;

        let mut states = manager.watch_state();
        manager.reconnect();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| matches!(s, ConnectionState::Reconnecting(_))),
        )
        .await
        .unwrap()
        .unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn shutdown_reports_disconnected() {
        let port = free_port().await;
        let manager = ConnectionManager::start(
            fast_config(format!("ws://127.0.0.1:{port}")),
            CancellationToken::new(),
        );
        let mut states = manager.watch_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s != ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        manager.shutdown();
        wait_for(&manager, ConnectionState::Disconnected).await;
    }
}
