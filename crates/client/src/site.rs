// Site-wide visitor counter.
//
// A single socket per service with no election and no broadcast. A first
// attempt that dies before opening on the primary path gets one quick
// retry on the alternate path; after that the ordinary backoff applies.
// While degraded it polls the per-room activity endpoint and sums it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use livecount_common::protocol::gateway::SiteMessage;

use crate::facade::PresenceState;
use crate::heartbeat::sleep_until;
use crate::origin::SchemeClass;
use crate::poller::{FallbackPoller, OnlineFetcher, PollResult};
use crate::room::{RoomDeps, WS_ERROR};
use crate::socket::{CloseOutcome, ConnectAttempt, SocketEvent, UpstreamSocket};

/// Delay before the one-off alternate-path retry.
pub const ALTERNATE_PATH_RETRY: Duration = Duration::from_millis(10);

enum SiteCommand {
    Reconnect,
}

/// Handle to the running counter. Dropping it stops the counter.
pub struct SiteOnline {
    state: watch::Receiver<PresenceState>,
    commands: mpsc::UnboundedSender<SiteCommand>,
    task: JoinHandle<()>,
}

impl SiteOnline {
    pub(crate) fn spawn<F: OnlineFetcher>(deps: &RoomDeps<F>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PresenceState::default());
        let actor = SiteActor::new(deps, state_tx, commands_rx);
        let task = tokio::spawn(actor.run());
        Self { state: state_rx, commands: commands_tx, task }
    }

    pub fn state(&self) -> PresenceState {
        self.state.borrow().clone()
    }

    pub fn count(&self) -> u64 {
        self.state.borrow().count
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.state.clone()
    }

    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }

    pub fn reconnect(&self) {
        if self.commands.send(SiteCommand::Reconnect).is_err() {
            warn!("site counter task is gone; reconnect dropped");
        }
    }
}

impl Drop for SiteOnline {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SiteActor<F> {
    debug: bool,
    socket: UpstreamSocket,
    socket_events: mpsc::UnboundedReceiver<(u64, SocketEvent)>,
    alternate_tried: bool,
    poller: FallbackPoller,
    poll_tx: mpsc::UnboundedSender<PollResult>,
    poll_rx: mpsc::UnboundedReceiver<PollResult>,
    fetcher: Arc<F>,
    activity_url: Url,
    state: watch::Sender<PresenceState>,
    commands: mpsc::UnboundedReceiver<SiteCommand>,
}

impl<F: OnlineFetcher> SiteActor<F> {
    fn new(
        deps: &RoomDeps<F>,
        state: watch::Sender<PresenceState>,
        commands: mpsc::UnboundedReceiver<SiteCommand>,
    ) -> Self {
        let timing = &deps.config.timing;
        let (socket, socket_events) = UpstreamSocket::new(
            Arc::clone(&deps.connector),
            Arc::clone(&deps.resolver),
            deps.config.site_paths.clone(),
            vec![(
                "socket_session_id".to_string(),
                deps.identity.profile_session_id().to_string(),
            )],
            timing.reconnect_policy(),
        );
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        Self {
            debug: deps.debug,
            socket,
            socket_events,
            alternate_tried: false,
            poller: FallbackPoller::new(timing.poll_interval()),
            poll_tx,
            poll_rx,
            fetcher: Arc::clone(&deps.fetcher),
            activity_url: deps.resolver.resolve(&deps.config.activity_path, SchemeClass::Http),
            state,
            commands,
        }
    }

    async fn run(mut self) {
        self.connect();
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SiteCommand::Reconnect) => {
                        lifecycle!(self.debug, "site counter manual reconnect");
                        self.socket.close();
                        self.connect();
                    }
                    None => break,
                },
                () = sleep_until(self.socket.reconnect_deadline()) => {
                    self.socket.on_reconnect_due();
                    self.connect();
                }
                Some((generation, event)) = self.socket_events.recv() => {
                    self.on_socket_event(generation, event);
                }
                Some((generation, count)) = self.poll_rx.recv() => {
                    if self.poller.accepts(generation) {
                        self.update(|s| s.count = count);
                    }
                }
            }
        }
        self.socket.close();
        self.poller.stop();
    }

    fn connect(&mut self) {
        match self.socket.ensure_connected() {
            ConnectAttempt::AlreadyActive => {}
            ConnectAttempt::Started { url } => {
                lifecycle!(self.debug, url = %url, "site counter connecting");
                self.update(|s| s.connecting = true);
            }
            ConnectAttempt::InitFailed { error, outcome } => {
                warn!(error = %error, "could not create site socket");
                let message = error.to_string();
                self.update(|s| {
                    s.error = Some(message);
                    s.connecting = false;
                });
                self.after_close(outcome);
            }
        }
    }

    fn on_socket_event(&mut self, generation: u64, event: SocketEvent) {
        if !self.socket.accepts(generation) {
            return;
        }
        match event {
            SocketEvent::Opened => {
                self.socket.on_opened();
                self.alternate_tried = false;
                lifecycle!(self.debug, path = self.socket.current_path(), "site counter open");
                if self.poller.is_active() {
                    self.poller.stop();
                    lifecycle!(self.debug, "site fallback polling stopped");
                }
                self.update(|s| {
                    s.connecting = false;
                    s.connected = true;
                    s.error = None;
                    s.fallback_active = false;
                });
            }
            SocketEvent::Message(text) => match SiteMessage::decode(&text) {
                Ok(message) => {
                    if let Some(online) = message.online() {
                        self.update(|s| s.count = online);
                    }
                }
                Err(error) => debug!(%error, "dropping malformed site frame"),
            },
            SocketEvent::Error(reason) => {
                debug!(reason = %reason, "site socket error");
                self.update(|s| {
                    s.error = Some(WS_ERROR.to_string());
                    s.connected = false;
                });
            }
            SocketEvent::Closed { code, reason } => {
                let outcome = self.socket.on_closed();
                lifecycle!(
                    self.debug,
                    code = ?code,
                    reason = %reason,
                    failures = outcome.consecutive_failures,
                    "site socket closed"
                );
                self.update(|s| {
                    s.connecting = false;
                    s.connected = false;
                });
                self.after_close(outcome);
            }
        }
    }

    fn after_close(&mut self, outcome: CloseOutcome) {
        if outcome.fallback && !self.poller.is_active() {
            lifecycle!(self.debug, url = %self.activity_url, "site fallback polling started");
            self.poller.start(Arc::clone(&self.fetcher), self.activity_url.clone(), self.poll_tx.clone());
            self.update(|s| s.fallback_active = true);
        }
        // The path only advances when the attempt never opened.
        let advanced_off_primary = outcome.was_primary_path && self.socket.path_index() != 0;
        let now = Instant::now();
        if advanced_off_primary && !self.alternate_tried {
            self.alternate_tried = true;
            self.socket.schedule_retry(now, ALTERNATE_PATH_RETRY);
        } else {
            self.socket.schedule_reconnect(now);
        }
    }

    fn update(&self, f: impl FnOnce(&mut PresenceState)) {
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }
}
