// Room actor: the single owner of one room's connection record.
//
// Every mutation of a room's state happens inside this task. Socket
// events, timer fires, fallback-poll results and broadcast deliveries are
// all funnelled through one `select!`, so they are serialized the same
// way a browser serializes callbacks. Timers are plain deadlines; clearing
// one is setting it to `None`, and dropping the actor revokes them all.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use livecount_common::protocol::broadcast::BroadcastMessage;
use livecount_common::protocol::gateway::{InboundMessage, OutboundMessage};
use livecount_common::types::Room;

use crate::broadcast::{BusEndpoint, LocalBus};
use crate::config::PresenceConfig;
use crate::facade::PresenceState;
use crate::heartbeat::{sleep_until, HeartbeatScheduler};
use crate::identity::SessionIdentity;
use crate::leader::LeaderElection;
use crate::origin::{OriginResolver, SchemeClass};
use crate::poller::{FallbackPoller, OnlineFetcher, PollResult};
use crate::socket::{
    CloseOutcome, ConnectAttempt, GatewayConnector, SocketEvent, UpstreamSocket,
};

/// Advisory error string for socket error events.
pub const WS_ERROR: &str = "ws-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoomCommand {
    EnsurePresence,
    Reconnect,
    Shutdown,
}

/// Everything a room actor needs from its owning service.
pub(crate) struct RoomDeps<F> {
    pub identity: SessionIdentity,
    pub config: Arc<PresenceConfig>,
    pub resolver: Arc<OriginResolver>,
    pub connector: Arc<dyn GatewayConnector>,
    pub fetcher: Arc<F>,
    pub bus: LocalBus,
    pub debug: bool,
}

impl<F> Clone for RoomDeps<F> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            config: Arc::clone(&self.config),
            resolver: Arc::clone(&self.resolver),
            connector: Arc::clone(&self.connector),
            fetcher: Arc::clone(&self.fetcher),
            bus: self.bus.clone(),
            debug: self.debug,
        }
    }
}

/// Channels connecting a spawned actor to its registry entry.
pub(crate) struct RoomTask {
    pub commands: mpsc::UnboundedSender<RoomCommand>,
    pub state: watch::Receiver<PresenceState>,
    pub task: JoinHandle<()>,
}

/// Spawn the actor for `room`. It stays idle until it receives a command.
pub(crate) fn spawn<F: OnlineFetcher>(room: Room, deps: &RoomDeps<F>) -> RoomTask {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(PresenceState::default());
    // Join the bus before spawning so nothing posted after acquire is missed.
    let bus = deps.bus.join(&room.channel_name());
    let actor = RoomActor::new(room, deps, bus, state_tx, commands_rx);
    let task = tokio::spawn(actor.run());
    RoomTask { commands: commands_tx, state: state_rx, task }
}

struct RoomActor<F> {
    room: Room,
    tab_id: String,
    session_id: String,
    send_update_sid: bool,
    debug: bool,

    election: LeaderElection,
    socket: UpstreamSocket,
    socket_events: mpsc::UnboundedReceiver<(u64, SocketEvent)>,
    heartbeat: HeartbeatScheduler,

    poller: FallbackPoller,
    poll_tx: mpsc::UnboundedSender<PollResult>,
    poll_rx: mpsc::UnboundedReceiver<PollResult>,
    fetcher: Arc<F>,
    online_url: Url,

    bus: BusEndpoint,
    last_snapshot_ts: Option<i64>,
    state: watch::Sender<PresenceState>,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
}

impl<F: OnlineFetcher> RoomActor<F> {
    fn new(
        room: Room,
        deps: &RoomDeps<F>,
        bus: BusEndpoint,
        state: watch::Sender<PresenceState>,
        commands: mpsc::UnboundedReceiver<RoomCommand>,
    ) -> Self {
        let tab_id = deps.identity.tab_id().to_string();
        let session_id = deps.identity.profile_session_id().to_string();
        let timing = &deps.config.timing;
        let (socket, socket_events) = UpstreamSocket::new(
            Arc::clone(&deps.connector),
            Arc::clone(&deps.resolver),
            deps.config.room_paths.clone(),
            vec![
                ("room".to_string(), room.as_str().to_string()),
                ("socket_session_id".to_string(), session_id.clone()),
            ],
            timing.reconnect_policy(),
        );
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        Self {
            election: LeaderElection::new(tab_id.clone(), timing.election()),
            online_url: deps.resolver.resolve(&deps.config.online_path, SchemeClass::Http),
            poller: FallbackPoller::new(timing.poll_interval()),
            fetcher: Arc::clone(&deps.fetcher),
            send_update_sid: deps.config.send_update_sid,
            debug: deps.debug,
            last_snapshot_ts: None,
            heartbeat: HeartbeatScheduler::new(),
            room,
            tab_id,
            session_id,
            socket,
            socket_events,
            poll_tx,
            poll_rx,
            bus,
            state,
            commands,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(RoomCommand::EnsurePresence) => self.ensure_presence(),
                    Some(RoomCommand::Reconnect) => self.reconnect(),
                    Some(RoomCommand::Shutdown) | None => break,
                },
                () = sleep_until(self.election.election_deadline()) => self.on_election_due(),
                () = sleep_until(self.election.beat_deadline()) => self.on_beat_due(),
                () = sleep_until(self.election.watchdog_deadline()) => self.on_watchdog_due(),
                () = sleep_until(self.socket.reconnect_deadline()) => self.on_reconnect_due(),
                () = sleep_until(self.heartbeat.deadline()) => self.on_heartbeat_due(),
                Some((generation, event)) = self.socket_events.recv() => {
                    self.on_socket_event(generation, event);
                }
                Some((generation, count)) = self.poll_rx.recv() => {
                    self.on_poll_result(generation, count);
                }
                Some(message) = self.bus.recv() => self.on_broadcast(message),
            }
        }
        self.teardown();
    }

    // ── Election ────────────────────────────────────────────────────

    fn ensure_presence(&mut self) {
        self.bus.post(BroadcastMessage::SyncRequest {
            room: self.room.clone(),
            from: self.tab_id.clone(),
        });
        if self.election.is_leader() {
            self.connect();
            return;
        }
        if self.election.ensure_presence(Instant::now()) {
            lifecycle!(self.debug, room = %self.room, tab = %self.tab_id, "no recent leader; election pending");
        }
    }

    fn on_election_due(&mut self) {
        if !self.election.on_election_due(Instant::now()) {
            debug!(room = %self.room, tab = %self.tab_id, "leader appeared during election delay");
            return;
        }
        lifecycle!(self.debug, room = %self.room, tab = %self.tab_id, "promoted to leader");
        self.update(|s| s.leader = true);
        self.post_heartbeat();
        self.connect();
    }

    fn on_beat_due(&mut self) {
        self.election.on_beat_due(Instant::now());
        if self.election.is_leader() {
            self.post_heartbeat();
        }
    }

    fn on_watchdog_due(&mut self) {
        if self.election.on_watchdog_due(Instant::now()) {
            lifecycle!(self.debug, room = %self.room, tab = %self.tab_id, "leader signal stale");
            self.ensure_presence();
        }
    }

    fn step_down(&mut self, peer: &str) {
        lifecycle!(self.debug, room = %self.room, tab = %self.tab_id, peer, "stepping down");
        self.election.step_down(Instant::now());
        self.socket.close();
        self.heartbeat.stop();
        self.stop_fallback();
        self.update(|s| {
            s.leader = false;
            s.connected = false;
            s.connecting = false;
        });
    }

    // ── Socket ──────────────────────────────────────────────────────

    fn connect(&mut self) {
        match self.socket.ensure_connected() {
            ConnectAttempt::AlreadyActive => {}
            ConnectAttempt::Started { url } => {
                lifecycle!(self.debug, room = %self.room, url = %url, "connecting");
                self.update(|s| s.connecting = true);
                self.post_state();
            }
            ConnectAttempt::InitFailed { error, outcome } => {
                warn!(room = %self.room, error = %error, "could not create gateway socket");
                let message = error.to_string();
                self.update(|s| {
                    s.error = Some(message);
                    s.connecting = false;
                    s.connected = false;
                });
                self.after_close(outcome);
            }
        }
    }

    fn reconnect(&mut self) {
        if !self.election.is_leader() {
            self.ensure_presence();
            return;
        }
        lifecycle!(self.debug, room = %self.room, "manual reconnect");
        self.socket.close();
        self.heartbeat.stop();
        self.update(|s| s.connected = false);
        self.connect();
    }

    fn on_reconnect_due(&mut self) {
        self.socket.on_reconnect_due();
        if self.election.is_leader() {
            self.connect();
        }
    }

    fn on_socket_event(&mut self, generation: u64, event: SocketEvent) {
        if !self.socket.accepts(generation) {
            debug!(room = %self.room, generation, "dropping event from stale socket");
            return;
        }
        match event {
            SocketEvent::Opened => self.on_opened(),
            SocketEvent::Message(text) => self.on_frame(&text),
            SocketEvent::Error(reason) => {
                debug!(room = %self.room, reason = %reason, "gateway socket error");
                self.update(|s| {
                    s.error = Some(WS_ERROR.to_string());
                    s.connected = false;
                });
                self.post_state();
            }
            SocketEvent::Closed { code, reason } => {
                let path = self.socket.current_path().to_string();
                let outcome = self.socket.on_closed();
                lifecycle!(
                    self.debug,
                    room = %self.room,
                    code = ?code,
                    reason = %reason,
                    path = %path,
                    failures = outcome.consecutive_failures,
                    "gateway socket closed"
                );
                self.update(|s| {
                    s.connecting = false;
                    s.connected = false;
                });
                self.after_close(outcome);
            }
        }
    }

    fn on_opened(&mut self) {
        self.socket.on_opened();
        lifecycle!(self.debug, room = %self.room, path = self.socket.current_path(), "gateway socket open");
        self.stop_fallback();
        self.heartbeat.start_with_ttl(None, Instant::now());
        self.update(|s| {
            s.connecting = false;
            s.connected = true;
            s.error = None;
        });
        self.send(&OutboundMessage::Heartbeat);
        if self.send_update_sid {
            self.send(&OutboundMessage::UpdateSid { session_id: self.session_id.clone() });
        }
        self.post_state();
    }

    fn on_frame(&mut self, text: &str) {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(error) => {
                debug!(room = %self.room, %error, "dropping malformed frame");
                return;
            }
        };
        match message {
            InboundMessage::Hello { ttl, count, .. } => {
                self.heartbeat.start_with_ttl(ttl, Instant::now());
                if let Some(count) = count {
                    self.update(|s| s.count = count);
                }
                self.post_state();
            }
            InboundMessage::Sync { count: Some(count) } => {
                self.update(|s| s.count = count);
                self.post_state();
            }
            InboundMessage::Sync { count: None } | InboundMessage::Unknown => {}
        }
    }

    fn after_close(&mut self, outcome: CloseOutcome) {
        self.heartbeat.stop();
        if outcome.fallback {
            self.start_fallback();
        }
        self.post_state();
        if self.election.is_leader() {
            self.socket.schedule_reconnect(Instant::now());
        }
    }

    fn on_heartbeat_due(&mut self) {
        self.heartbeat.on_due(Instant::now());
        self.send(&OutboundMessage::Heartbeat);
    }

    fn send(&mut self, message: &OutboundMessage) {
        if let Err(error) = self.socket.send(message) {
            warn!(room = %self.room, %error, "gateway send failed; reconnecting");
            let outcome = self.socket.abandon();
            self.update(|s| s.connected = false);
            self.after_close(outcome);
        }
    }

    // ── Fallback polling ────────────────────────────────────────────

    fn start_fallback(&mut self) {
        if self.poller.is_active() {
            return;
        }
        lifecycle!(self.debug, room = %self.room, url = %self.online_url, "fallback polling started");
        self.poller.start(Arc::clone(&self.fetcher), self.online_url.clone(), self.poll_tx.clone());
        self.update(|s| s.fallback_active = true);
    }

    fn stop_fallback(&mut self) {
        if !self.poller.is_active() {
            return;
        }
        lifecycle!(self.debug, room = %self.room, "fallback polling stopped");
        self.poller.stop();
        self.update(|s| s.fallback_active = false);
    }

    fn on_poll_result(&mut self, generation: u64, count: u64) {
        if !self.poller.accepts(generation) {
            return;
        }
        self.update(|s| s.count = count);
        self.post_state();
    }

    // ── Broadcast ───────────────────────────────────────────────────

    fn on_broadcast(&mut self, message: BroadcastMessage) {
        if message.room() != &self.room || message.from() == self.tab_id {
            return;
        }
        let now = Instant::now();
        match message {
            BroadcastMessage::Heartbeat { from, .. } => {
                if self.election.observe_peer(&from, now) {
                    self.step_down(&from);
                }
            }
            BroadcastMessage::StateSnapshot { from, ts, count, connecting, error, .. } => {
                if self.election.observe_peer(&from, now) {
                    self.step_down(&from);
                }
                if self.election.is_leader() || self.last_snapshot_ts.is_some_and(|last| ts < last) {
                    return;
                }
                self.last_snapshot_ts = Some(ts);
                self.update(|s| {
                    s.count = count;
                    s.connecting = connecting;
                    s.error = error;
                });
            }
            BroadcastMessage::SyncRequest { .. } => {
                if self.election.is_leader() {
                    self.post_state();
                }
            }
        }
    }

    fn post_heartbeat(&self) {
        self.bus.post(BroadcastMessage::Heartbeat {
            room: self.room.clone(),
            from: self.tab_id.clone(),
            ts: Utc::now().timestamp_millis(),
        });
    }

    /// Rebroadcast the current state. Only the leader speaks for a room.
    fn post_state(&self) {
        if !self.election.is_leader() {
            return;
        }
        let state = self.state.borrow().clone();
        self.bus.post(BroadcastMessage::StateSnapshot {
            room: self.room.clone(),
            from: self.tab_id.clone(),
            ts: Utc::now().timestamp_millis(),
            count: state.count,
            connecting: state.connecting,
            error: state.error,
        });
    }

    fn update(&self, f: impl FnOnce(&mut PresenceState)) {
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    fn teardown(&mut self) {
        self.socket.close();
        self.heartbeat.stop();
        self.poller.stop();
        lifecycle!(self.debug, room = %self.room, tab = %self.tab_id, "room torn down");
    }
}
