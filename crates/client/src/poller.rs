// Fallback HTTP polling of the aggregate online-count endpoint.
//
// Active only while the socket is degraded. Each activation gets a new
// generation so a response landing after `stop()` can be recognized and
// discarded by the owner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use livecount_common::protocol::gateway::OnlineResponse;
use livecount_common::protocol::ProtocolError;

// ── Fetcher trait ───────────────────────────────────────────────────

/// Fetches an aggregate count. Trait-based for testability.
pub trait OnlineFetcher: Send + Sync + 'static {
    fn fetch_online(&self, url: &Url) -> impl Future<Output = Result<u64, FetchError>> + Send;
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("online fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("online fetch returned a bad body: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("online fetch failed: {0}")]
    Other(String),
}

/// reqwest-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl OnlineFetcher for HttpFetcher {
    async fn fetch_online(&self, url: &Url) -> Result<u64, FetchError> {
        let body = self.client.get(url.clone()).send().await?.error_for_status()?.text().await?;
        Ok(OnlineResponse::decode(&body)?.total())
    }
}

// ── Poller ──────────────────────────────────────────────────────────

/// Poll result tagged with the poller generation that produced it.
pub type PollResult = (u64, u64);

pub struct FallbackPoller {
    interval: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    pub fn new(interval: Duration) -> Self {
        Self { interval, generation: 0, task: None }
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Fetch immediately, then every interval. No-op if already running.
    pub fn start<F: OnlineFetcher>(
        &mut self,
        fetcher: Arc<F>,
        url: Url,
        results: mpsc::UnboundedSender<PollResult>,
    ) {
        if self.task.is_some() {
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match fetcher.fetch_online(&url).await {
                    Ok(count) => {
                        if results.send((generation, count)).is_err() {
                            return;
                        }
                    }
                    Err(error) => debug!(%url, %error, "fallback poll failed; keeping last count"),
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.generation += 1;
        }
    }

    /// Whether a result came from the running activation.
    pub fn accepts(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetcher;
    use tokio::time;

    fn url() -> Url {
        Url::parse("http://gw.test/v1/metrics/online").unwrap()
    }

    #[tokio::test]
    async fn polls_immediately_then_every_interval() {
        time::pause();
        let fetcher = Arc::new(MockFetcher::returning(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = FallbackPoller::new(Duration::from_secs(8));
        poller.start(fetcher.clone(), url(), tx);

        let (generation, count) = rx.recv().await.unwrap();
        assert!(poller.accepts(generation));
        assert_eq!(count, 5);
        assert_eq!(fetcher.calls(), 1);

        time::sleep(Duration::from_millis(8100)).await;
        assert_eq!(fetcher.calls(), 2);
        poller.stop();
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        time::pause();
        let fetcher = Arc::new(MockFetcher::returning(9));
        fetcher.push(Err(FetchError::Other("timeout".into())));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = FallbackPoller::new(Duration::from_secs(8));
        poller.start(fetcher.clone(), url(), tx);

        // First fetch fails silently; the second one reports.
        let (_, count) = rx.recv().await.unwrap();
        assert_eq!(count, 9);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn stop_invalidates_generation() {
        time::pause();
        let fetcher = Arc::new(MockFetcher::returning(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut poller = FallbackPoller::new(Duration::from_secs(8));
        poller.start(fetcher.clone(), url(), tx.clone());
        let (generation, _) = rx.recv().await.unwrap();

        poller.stop();
        assert!(!poller.is_active());
        assert!(!poller.accepts(generation));

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        time::pause();
        let fetcher = Arc::new(MockFetcher::returning(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut poller = FallbackPoller::new(Duration::from_secs(8));
        poller.start(fetcher.clone(), url(), tx.clone());
        poller.start(fetcher.clone(), url(), tx);
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fetcher.calls(), 1);
    }
}
