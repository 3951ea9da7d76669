// Public presence surface.
//
// A `PresenceService` is one tab: it owns a tab identity, a connection
// registry and an attachment to the profile's broadcast bus. UI code calls
// `acquire` on mount and drops the returned handle on unmount.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::warn;
use url::Url;

use livecount_common::types::Room;

use crate::broadcast::LocalBus;
use crate::config::PresenceConfig;
use crate::identity::SessionIdentity;
use crate::origin::{debug_flag, origin_override, OriginResolver};
use crate::poller::{FetchError, HttpFetcher, OnlineFetcher};
use crate::registry::{ConnectionRegistry, Releaser};
use crate::room::{RoomCommand, RoomDeps};
use crate::site::SiteOnline;
use crate::socket::ws::WsConnector;
use crate::socket::GatewayConnector;
use crate::store::{FileStore, KeyValueStore, MemoryStore};

/// Observable state of one room (or of the site counter).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceState {
    pub count: u64,
    pub connecting: bool,
    /// True only on the tab holding the socket, once it is open.
    pub connected: bool,
    /// Advisory; the count keeps its last value regardless.
    pub error: Option<String>,
    pub leader: bool,
    pub fallback_active: bool,
}

/// Collaborators for a service. Tests swap in doubles here.
pub struct ServiceParts<F> {
    pub config: PresenceConfig,
    pub identity: SessionIdentity,
    pub resolver: OriginResolver,
    pub connector: Arc<dyn GatewayConnector>,
    pub fetcher: Arc<F>,
    pub bus: LocalBus,
    pub debug: bool,
}

pub struct PresenceService<F: OnlineFetcher = HttpFetcher> {
    deps: RoomDeps<F>,
    registry: Arc<ConnectionRegistry<F>>,
}

impl PresenceService<HttpFetcher> {
    /// Production wiring: durable state under `~/.livecount/`, a
    /// session-scoped memory store, tungstenite sockets and reqwest polling.
    ///
    /// `page_url` plays the role of the browser location: its query may
    /// carry the `gatewayOrigin`/`gw` and `presenceDebug` overrides.
    pub fn from_config(
        config: PresenceConfig,
        page_url: Option<&Url>,
        bus: LocalBus,
    ) -> Result<Self, FetchError> {
        let durable: Box<dyn KeyValueStore> = match FileStore::open_default() {
            Some(store) => Box::new(store),
            None => Box::new(MemoryStore::new()),
        };
        let session = MemoryStore::new();
        let identity = SessionIdentity::resolve(durable.as_ref(), &session);
        let origin = origin_override(page_url, durable.as_ref()).or_else(|| config.gateway_origin.clone());
        let debug = config.debug || debug_flag(page_url, durable.as_ref());
        let resolver = OriginResolver::new(origin, config.page_origin_url());
        let fetcher = HttpFetcher::new(config.timing.poll_timeout())?;
        Ok(Self::new(ServiceParts {
            config,
            identity,
            resolver,
            connector: Arc::new(WsConnector),
            fetcher: Arc::new(fetcher),
            bus,
            debug,
        }))
    }
}

impl<F: OnlineFetcher> PresenceService<F> {
    pub fn new(parts: ServiceParts<F>) -> Self {
        let deps = RoomDeps {
            identity: parts.identity,
            config: Arc::new(parts.config),
            resolver: Arc::new(parts.resolver),
            connector: parts.connector,
            fetcher: parts.fetcher,
            bus: parts.bus,
            debug: parts.debug,
        };
        let registry = Arc::new(ConnectionRegistry::new(deps.clone()));
        Self { deps, registry }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.deps.identity
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.deps.config
    }

    pub fn gateway_origin(&self) -> &str {
        self.deps.resolver.origin()
    }

    pub fn is_debug(&self) -> bool {
        self.deps.debug
    }

    /// Start consuming presence for `room`. Must be called from within a
    /// tokio runtime.
    pub fn acquire(&self, room: impl Into<Room>) -> PresenceHandle {
        let room = room.into();
        let lease = self.registry.acquire(&room);
        let releaser: Arc<dyn Releaser> = self.registry.clone();
        PresenceHandle {
            room,
            epoch: lease.epoch,
            state: lease.state,
            commands: lease.commands,
            releaser: Some(releaser),
        }
    }

    pub fn ref_count(&self, room: &Room) -> usize {
        self.registry.ref_count(room)
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.registry.rooms()
    }

    /// Start the site-wide visitor counter. It shares this service's
    /// identity and gateway but not its registry.
    pub fn site_online(&self) -> SiteOnline {
        SiteOnline::spawn(&self.deps)
    }

    /// Tear down every room now.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

/// One consumer's reference on a room. Dropping it releases the reference.
pub struct PresenceHandle {
    room: Room,
    epoch: u64,
    state: watch::Receiver<PresenceState>,
    commands: mpsc::UnboundedSender<RoomCommand>,
    releaser: Option<Arc<dyn Releaser>>,
}

impl PresenceHandle {
    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn state(&self) -> PresenceState {
        self.state.borrow().clone()
    }

    pub fn count(&self) -> u64 {
        self.state.borrow().count
    }

    pub fn connecting(&self) -> bool {
        self.state.borrow().connecting
    }

    pub fn connected(&self) -> bool {
        self.state.borrow().connected
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.borrow().leader
    }

    /// A fresh receiver for the room state.
    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.state.clone()
    }

    /// Wait for the next state change. Returns false once the room is gone.
    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }

    pub fn ensure_presence(&self) {
        self.command(RoomCommand::EnsurePresence);
    }

    pub fn reconnect(&self) {
        self.command(RoomCommand::Reconnect);
    }

    fn command(&self, command: RoomCommand) {
        if self.commands.send(command).is_err() {
            warn!(room = %self.room, ?command, "room actor is gone; command dropped");
        }
    }

    pub fn release(self) {}
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            releaser.release(&self.room, self.epoch);
        }
    }
}
