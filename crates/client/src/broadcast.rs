// Cross-tab broadcast bus.
//
// `LocalBus` is a hub of named channels shared by every `PresenceService`
// in one profile (process). Like a browser BroadcastChannel, a post is
// delivered to every other endpoint on the same channel name but never
// back to its sender. Delivery order across senders is not guaranteed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::warn;

use livecount_common::protocol::broadcast::BroadcastMessage;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Envelope {
    sender: u64,
    message: BroadcastMessage,
}

#[derive(Debug, Default)]
struct LocalBusInner {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    next_endpoint: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint to the named channel.
    pub fn join(&self, channel: &str) -> BusEndpoint {
        let mut channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let rx = tx.subscribe();
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        BusEndpoint { id, channel: channel.to_string(), tx, rx }
    }

    /// Number of endpoints currently attached to `channel`.
    pub fn endpoints(&self, channel: &str) -> usize {
        let channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(channel).map_or(0, |tx| tx.receiver_count())
    }
}

/// One participant on a named channel. Dropping it leaves the channel.
#[derive(Debug)]
pub struct BusEndpoint {
    id: u64,
    channel: String,
    tx: broadcast::Sender<Envelope>,
    rx: broadcast::Receiver<Envelope>,
}

impl BusEndpoint {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Best-effort post to every other endpoint.
    pub fn post(&self, message: BroadcastMessage) {
        // Our own receiver keeps the channel open, so this only fails if
        // nobody is listening at all.
        let _ = self.tx.send(Envelope { sender: self.id, message });
    }

    /// Next message from another endpoint. Cancel-safe.
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.sender == self.id => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "broadcast endpoint lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
