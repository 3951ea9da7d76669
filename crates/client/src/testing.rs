// Scripted transport and fetcher doubles for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use url::Url;

use crate::poller::{FetchError, OnlineFetcher};
use crate::socket::{ConnectError, GatewayConnector, SocketEvent, SocketEventSink, SocketHandle};

// ── MockConnector ───────────────────────────────────────────────────

struct MockSocket {
    url: Url,
    events: SocketEventSink,
    outbound: mpsc::UnboundedReceiver<String>,
    sent: Vec<String>,
    closed: bool,
}

impl MockSocket {
    fn drain(&mut self) {
        loop {
            match self.outbound.try_recv() {
                Ok(frame) => self.sent.push(frame),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    return;
                }
            }
        }
    }
}

#[derive(Default)]
struct MockConnectorState {
    sockets: Vec<MockSocket>,
    fail_next: Option<String>,
}

/// Records every `open` and lets the test drive each socket's events.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockConnectorState>>,
}

impl MockConnector {
    fn with_socket<T>(&self, index: usize, f: impl FnOnce(&mut MockSocket) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        let socket = state
            .sockets
            .get_mut(index)
            .unwrap_or_else(|| panic!("no socket #{index} was opened"));
        f(socket)
    }

    /// Number of sockets opened so far.
    pub(crate) fn opened(&self) -> usize {
        self.state.lock().unwrap().sockets.len()
    }

    /// Make the next `open` fail synchronously.
    pub(crate) fn fail_next_open(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }

    pub(crate) fn url(&self, index: usize) -> Url {
        self.with_socket(index, |s| s.url.clone())
    }

    pub(crate) fn generation(&self, index: usize) -> u64 {
        self.with_socket(index, |s| s.events.generation())
    }

    /// Frames the owner wrote to socket `index`.
    pub(crate) fn sent(&self, index: usize) -> Vec<String> {
        self.with_socket(index, |s| {
            s.drain();
            s.sent.clone()
        })
    }

    /// Whether the owner dropped its handle to socket `index`.
    pub(crate) fn closed(&self, index: usize) -> bool {
        self.with_socket(index, |s| {
            s.drain();
            s.closed
        })
    }

    pub(crate) fn emit(&self, index: usize, event: SocketEvent) {
        self.with_socket(index, |s| s.events.emit(event));
    }

    pub(crate) fn emit_text(&self, index: usize, text: &str) {
        self.emit(index, SocketEvent::Message(text.to_string()));
    }

    pub(crate) fn emit_close(&self, index: usize) {
        self.emit(index, SocketEvent::Closed { code: Some(1006), reason: String::new() });
    }
}

impl GatewayConnector for MockConnector {
    fn open(&self, url: &Url, events: SocketEventSink) -> Result<SocketHandle, ConnectError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next.take() {
            return Err(ConnectError::Other(message));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.sockets.push(MockSocket {
            url: url.clone(),
            events,
            outbound: rx,
            sent: Vec::new(),
            closed: false,
        });
        Ok(SocketHandle::new(tx, None))
    }
}

// ── MockFetcher ─────────────────────────────────────────────────────

/// Replays scripted results first, then a fixed count.
pub(crate) struct MockFetcher {
    fallback: u64,
    script: Mutex<VecDeque<Result<u64, FetchError>>>,
    urls: Mutex<Vec<Url>>,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub(crate) fn returning(count: u64) -> Self {
        Self {
            fallback: count,
            script: Mutex::new(VecDeque::new()),
            urls: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, result: Result<u64, FetchError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_url(&self) -> Option<Url> {
        self.urls.lock().unwrap().last().cloned()
    }
}

impl OnlineFetcher for MockFetcher {
    async fn fetch_online(&self, url: &Url) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(self.fallback))
    }
}
