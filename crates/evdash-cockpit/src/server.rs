//! [`BroadcastServer`] – WebSocket + HTTP front door of the backend.
//!
//! Listens on `0.0.0.0:8765` by default.
//!
//! * WebSocket upgrades → a streaming [`ClientSession`].
//! * `GET /health` → `{"status":"ok","clients":N,"seq":S}`.
//! * `GET /history` → the snapshot ring buffer as a JSON array.
//! * Anything else → 404.
//!
//! A single fan-out task follows the [`SnapshotBus`], serializes each
//! snapshot once and hands the shared frame to every live session.
//!
//! # Shutdown
//!
//! When the run token fires the listener stops accepting and every reader
//! stops taking new frames. A command already being dispatched still gets
//! its reply written before the session drains and closes. Sessions left
//! after `shutdown_grace` are closed hard.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use evdash_kernel::CommandDispatcher;
use evdash_middleware::{SnapshotBus, SnapshotHistory};
use evdash_types::{CommandEnvelope, EvError, ServerMessage, encode_telemetry};
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::{accept_async, tungstenite::Message, tungstenite::Utf8Bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::session::{ClientSession, SessionConfig};

pub const DEFAULT_PORT: u16 = 8765;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session: SessionConfig,
    /// How long sessions get to flush pending replies on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            session: SessionConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

type SessionMap = RwLock<HashMap<Uuid, Arc<ClientSession>>>;

struct Shared {
    bus: SnapshotBus,
    dispatcher: CommandDispatcher,
    history: SnapshotHistory,
    sessions: SessionMap,
    session_config: SessionConfig,
}

impl Shared {
    fn client_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn live_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Broadcast server, not yet bound.
///
/// # Example
///
/// ```rust,no_run
/// use evdash_cockpit::{BroadcastServer, ServerConfig};
/// # async fn demo(
/// #     bus: evdash_middleware::SnapshotBus,
/// #     dispatcher: evdash_kernel::CommandDispatcher,
/// #     history: evdash_middleware::SnapshotHistory,
/// # ) -> Result<(), evdash_types::EvError> {
/// let cancel = tokio_util::sync::CancellationToken::new();
/// BroadcastServer::new(ServerConfig::default(), bus, dispatcher, history)
///     .bind()
///     .await?
///     .run(cancel)
///     .await
/// # }
/// ```
pub struct BroadcastServer {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl BroadcastServer {
    pub fn new(
        config: ServerConfig,
        bus: SnapshotBus,
        dispatcher: CommandDispatcher,
        history: SnapshotHistory,
    ) -> Self {
        let shared = Arc::new(Shared {
            bus,
            dispatcher,
            history,
            sessions: RwLock::new(HashMap::new()),
            session_config: config.session.clone(),
        });
        Self { config, shared }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener.  Use port 0 to let the OS pick one.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::Bind`] if the address cannot be bound.
    pub async fn bind(self) -> Result<BoundServer, EvError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| EvError::Bind {
            addr: addr.clone(),
            details: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| EvError::Bind {
            addr,
            details: e.to_string(),
        })?;
        Ok(BoundServer {
            listener,
            local_addr,
            shared: self.shared,
            shutdown_grace: self.config.shutdown_grace,
        })
    }
}

/// A bound server, ready to accept connections.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_grace: Duration,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.shared.client_count()
    }

    /// Accept connections until `cancel` fires, then drain every session.
    ///
    /// Returns once every connection task has ended. Sessions still open
    /// after the shutdown grace period are closed without flushing.
    ///
    /// # Errors
    ///
    /// Currently never fails once bound; accept errors are logged and the
    /// loop continues.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), EvError> {
        info!(addr = %self.local_addr, "broadcast server listening");
        let fanout = tokio::spawn(fan_out(Arc::clone(&self.shared), cancel.clone()));
        let hard_stop = CancellationToken::new();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&self.shared);
                        let shutdown = cancel.clone();
                        let hard_stop = hard_stop.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, shared, shutdown, hard_stop).await {
                                warn!(%peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next() => {}
            }
        }
        drop(self.listener);

        let pending = connections.len();
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.shared.client_count(),
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "sessions did not drain in time; closing"
            );
            hard_stop.cancel();
            for session in self.shared.live_sessions() {
                session.close();
            }
            if tokio::time::timeout(Duration::from_secs(1), async {
                while connections.join_next().await.is_some() {}
            })
            .await
            .is_err()
            {
                connections.abort_all();
            }
        }
        if let Err(e) = fanout.await {
            error!(error = %e, "fan-out task failed");
        }
        info!(connections = pending, "broadcast server stopped");
        Ok(())
    }
}

async fn fan_out(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut rx = shared.bus.subscribe();
    loop {
        let snapshot = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(snapshot) => snapshot,
                None => break,
            },
        };
        let frame = match encode_telemetry(&snapshot) {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                error!(seq = snapshot.seq, error = %e, "snapshot serialization failed");
                continue;
            }
        };
        let sessions = shared.live_sessions();
        for session in &sessions {
            session.push_telemetry(snapshot.seq, frame.clone());
        }
        debug!(seq = snapshot.seq, clients = sessions.len(), "snapshot fanned out");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    hard_stop: CancellationToken,
) -> Result<(), EvError> {
    // `peek` leaves the request in the socket for the WebSocket handshake.
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| EvError::Transport(format!("peek error from {peer}: {e}")))?;

    let head = String::from_utf8_lossy(&buf[..n]);
    let is_ws_upgrade = head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });

    if is_ws_upgrade {
        handle_ws(stream, peer, shared, shutdown, hard_stop).await
    } else {
        let path = head
            .lines()
            .next()
            .and_then(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("GET"), Some(path)) => Some(path.to_string()),
                    _ => None,
                }
            })
            .unwrap_or_default();
        serve_http(stream, &path, &shared).await
    }
}

async fn serve_http(mut stream: TcpStream, path: &str, shared: &Shared) -> Result<(), EvError> {
    // Consume what was peeked so closing the socket does not reset it.
    let mut discard = [0u8; 1024];
    let _ = stream.read(&mut discard).await;

    let (status, body) = match path.split('?').next().unwrap_or_default() {
        "/health" => (
            "200 OK",
            json!({
                "status": "ok",
                "clients": shared.client_count(),
                "seq": shared.bus.latest().seq,
            })
            .to_string(),
        ),
        "/history" => ("200 OK", shared.history.to_json()?),
        _ => (
            "404 Not Found",
            json!({ "error": "not found" }).to_string(),
        ),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| EvError::Transport(format!("HTTP write error: {e}")))?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    hard_stop: CancellationToken,
) -> Result<(), EvError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| EvError::Transport(format!("WS handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let session = Arc::new(ClientSession::new(
        peer,
        shared.session_config.clone(),
        &hard_stop,
    ));
    let id = session.id();

    // Welcome first, then the current snapshot so nobody waits for a tick.
    session.push_control(&ServerMessage::welcome())?;
    let current = shared.bus.latest();
    session.push_telemetry(current.seq, Utf8Bytes::from(encode_telemetry(&current)?));
    shared
        .sessions
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, Arc::clone(&session));
    info!(session = %id, %peer, clients = shared.client_count(), "client connected");

    let writer = write_frames(&session, &mut ws_tx);

    let reader = async {
        loop {
            let next = tokio::select! {
                biased;
                _ = session.cancelled() => break,
                _ = shutdown.cancelled() => {
                    debug!(session = %id, "server shutting down; draining session");
                    session.drain();
                    break;
                }
                next = ws_rx.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_text(&session, &shared.dispatcher, text.as_str()).await;
                    if session.push_control(&reply).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(session = %id, "binary frame from client; closing");
                    let _ = session.push_control(&ServerMessage::error(
                        "binary frames are not supported",
                    ));
                    session.drain();
                    break;
                }
                Some(Ok(Message::Close(_))) | None => {
                    session.close();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session = %id, error = %e, "protocol error; closing");
                    let _ = session.push_control(&ServerMessage::error(format!(
                        "protocol error: {e}"
                    )));
                    session.drain();
                    break;
                }
            }
        }
    };

    tokio::join!(writer, reader);

    session.close();
    shared
        .sessions
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);
    info!(
        session = %id,
        %peer,
        dropped = session.dropped(),
        clients = shared.client_count(),
        "client disconnected"
    );
    Ok(())
}

/// Write queued frames until the session ends, then send a close frame.
///
/// Every send races the session's cancellation, so closing a session stops
/// this loop even when the peer has stopped reading.
async fn write_frames<S>(session: &ClientSession, sink: &mut S)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = session.next_outbound().await {
        tokio::select! {
            biased;
            _ = session.cancelled() => return,
            sent = sink.send(Message::Text(frame)) => {
                if let Err(e) = sent {
                    debug!(session = %session.id(), error = %e, "write failed");
                    session.close();
                    return;
                }
            }
        }
    }
    tokio::select! {
        biased;
        _ = session.cancelled() => {}
        _ = sink.send(Message::Close(None)) => {}
    }
    session.close();
}

async fn handle_text(
    session: &ClientSession,
    dispatcher: &CommandDispatcher,
    text: &str,
) -> ServerMessage {
    if text.len() > session.config().max_message_bytes {
        return ServerMessage::error(format!(
            "message exceeds {} bytes",
            session.config().max_message_bytes
        ));
    }
    if !session.allow_command() {
        let envelope = CommandEnvelope::parse(text).ok();
        let action = envelope
            .as_ref()
            .and_then(|e| e.action.clone())
            .unwrap_or_else(|| "unknown".to_string());
        warn!(session = %session.id(), %action, "command rate limit exceeded");
        return ServerMessage::rejected(
            &action,
            "rate limit exceeded",
            envelope.and_then(|e| e.request_id),
        );
    }
    dispatcher.dispatch(text).await
}
