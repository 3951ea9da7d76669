// Upstream gateway socket: connection state machine with reconnection.
//
// One `UpstreamSocket` owns at most one physical connection. The owner
// (a room or site actor) drives it: it feeds socket events back in,
// asks for reconnect scheduling, and awaits `reconnect_deadline()`.
//
// Transport is abstracted via `GatewayConnector` for testability.
// The tungstenite connector lives in `ws`.

pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use livecount_common::protocol::gateway::OutboundMessage;

use crate::origin::{OriginResolver, SchemeClass};

// ── Configuration ───────────────────────────────────────────────────

/// Reconnection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which fallback polling should start.
    pub fallback_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            fallback_after: 2,
        }
    }
}

// ── Transport trait ─────────────────────────────────────────────────

/// Lifecycle and data events of one physical socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Message(String),
    /// Transport error. A `Closed` event follows.
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Where a connection reports its events, tagged with the generation of
/// the socket that produced them.
#[derive(Debug, Clone)]
pub struct SocketEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
}

impl SocketEventSink {
    /// Returns false once the owner has gone away.
    pub fn emit(&self, event: SocketEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Owner side of an open (or opening) connection. Dropping it cancels the
/// connection task.
#[derive(Debug)]
pub struct SocketHandle {
    outbound: mpsc::UnboundedSender<String>,
    task: Option<JoinHandle<()>>,
}

impl SocketHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>, task: Option<JoinHandle<()>>) -> Self {
        Self { outbound, task }
    }

    fn send_text(&self, frame: String) -> Result<(), SendError> {
        self.outbound.send(frame).map_err(|_| SendError::Closed)
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid gateway url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported socket scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("socket is closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] livecount_common::protocol::ProtocolError),
}

/// Opens physical sockets. `open` fails synchronously only for problems
/// detectable before any I/O (e.g. a malformed URL); everything later is
/// reported through the sink.
pub trait GatewayConnector: Send + Sync + 'static {
    fn open(&self, url: &Url, events: SocketEventSink) -> Result<SocketHandle, ConnectError>;
}

// ── Connection state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Result of a close (or of anything treated like one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    pub consecutive_failures: u32,
    /// The failure threshold for fallback polling has been reached.
    pub fallback: bool,
    /// The closed attempt used the first candidate path.
    pub was_primary_path: bool,
}

#[derive(Debug)]
pub enum ConnectAttempt {
    /// Already connecting or open; nothing done.
    AlreadyActive,
    Started { url: Url },
    /// The connector refused synchronously. Already accounted as a close.
    InitFailed { error: ConnectError, outcome: CloseOutcome },
}

pub struct UpstreamSocket {
    connector: Arc<dyn GatewayConnector>,
    resolver: Arc<OriginResolver>,
    paths: Vec<String>,
    path_index: usize,
    query: Vec<(String, String)>,
    policy: ReconnectPolicy,
    events_tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
    generation: u64,
    handle: Option<SocketHandle>,
    state: SocketState,
    opened_this_attempt: bool,
    backoff: Duration,
    grow_backoff_on_retry: bool,
    consecutive_failures: u32,
    reconnect_at: Option<Instant>,
}

impl UpstreamSocket {
    /// Returns the socket and the receiver its events arrive on.
    pub fn new(
        connector: Arc<dyn GatewayConnector>,
        resolver: Arc<OriginResolver>,
        paths: Vec<String>,
        query: Vec<(String, String)>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<(u64, SocketEvent)>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let paths = if paths.is_empty() { vec!["/v1/ws".to_string()] } else { paths };
        let backoff = policy.base_delay;
        let socket = Self {
            connector,
            resolver,
            paths,
            path_index: 0,
            query,
            policy,
            events_tx,
            generation: 0,
            handle: None,
            state: SocketState::Idle,
            opened_this_attempt: false,
            backoff,
            grow_backoff_on_retry: true,
            consecutive_failures: 0,
            reconnect_at: None,
        };
        (socket, events_rx)
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SocketState::Connecting | SocketState::Open)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay the next scheduled reconnect will use.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn current_path(&self) -> &str {
        &self.paths[self.path_index]
    }

    pub fn path_index(&self) -> usize {
        self.path_index
    }

    /// Whether an event belongs to the live connection.
    pub fn accepts(&self, generation: u64) -> bool {
        self.handle.is_some() && generation == self.generation
    }

    /// The URL the next attempt will dial.
    pub fn target_url(&self) -> Url {
        let mut url = self.resolver.resolve(self.current_path(), SchemeClass::Ws);
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        url
    }

    /// Open a connection unless one is already connecting or open.
    pub fn ensure_connected(&mut self) -> ConnectAttempt {
        if self.is_active() {
            return ConnectAttempt::AlreadyActive;
        }
        self.reconnect_at = None;
        self.generation += 1;
        self.opened_this_attempt = false;
        let url = self.target_url();
        let sink = SocketEventSink { generation: self.generation, tx: self.events_tx.clone() };
        match self.connector.open(&url, sink) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = SocketState::Connecting;
                ConnectAttempt::Started { url }
            }
            Err(error) => {
                self.state = SocketState::Connecting;
                let outcome = self.record_close();
                ConnectAttempt::InitFailed { error, outcome }
            }
        }
    }

    pub fn on_opened(&mut self) {
        self.state = SocketState::Open;
        self.opened_this_attempt = true;
        self.backoff = self.policy.base_delay;
        self.consecutive_failures = 0;
        self.reconnect_at = None;
    }

    pub fn on_closed(&mut self) -> CloseOutcome {
        self.handle = None;
        self.record_close()
    }

    /// Drop a connection whose send path broke; accounted as a close.
    pub fn abandon(&mut self) -> CloseOutcome {
        self.generation += 1;
        self.handle = None;
        self.record_close()
    }

    fn record_close(&mut self) -> CloseOutcome {
        let was_primary_path = self.path_index == 0;
        self.state = SocketState::Closed;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.opened_this_attempt {
            self.path_index = (self.path_index + 1) % self.paths.len();
        }
        CloseOutcome {
            consecutive_failures: self.consecutive_failures,
            fallback: self.consecutive_failures >= self.policy.fallback_after,
            was_primary_path,
        }
    }

    /// Close deliberately. Late events from the old connection are ignored.
    pub fn close(&mut self) {
        self.generation += 1;
        self.handle = None;
        self.reconnect_at = None;
        self.state = SocketState::Idle;
    }

    /// Arm a reconnect after the current backoff.
    pub fn schedule_reconnect(&mut self, now: Instant) {
        self.reconnect_at = Some(now + self.backoff);
        self.grow_backoff_on_retry = true;
    }

    /// Arm a one-off reconnect that leaves the backoff untouched.
    pub fn schedule_retry(&mut self, now: Instant, delay: Duration) {
        self.reconnect_at = Some(now + delay);
        self.grow_backoff_on_retry = false;
    }

    pub fn cancel_reconnect(&mut self) {
        self.reconnect_at = None;
    }

    /// The reconnect deadline fired: step the backoff for the attempt after this one.
    pub fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        if self.grow_backoff_on_retry {
            self.backoff = (self.backoff * 2).min(self.policy.max_delay);
        }
    }

    /// Send a frame on the open socket. Not being open is not an error.
    pub fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        if self.state != SocketState::Open {
            return Ok(());
        }
        let Some(handle) = &self.handle else {
            return Ok(());
        };
        handle.send_text(message.encode()?)
    }
}
