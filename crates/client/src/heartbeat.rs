// Liveness pings on the open gateway socket.

use std::time::Duration;

use tokio::time::Instant;

use livecount_common::protocol::gateway::heartbeat_interval;

/// Revocable periodic deadline. The owner sends `{"type":"hb"}` each time
/// `deadline()` passes and then calls `on_due`.
#[derive(Debug, Default)]
pub struct HeartbeatScheduler {
    interval: Option<Duration>,
    next_at: Option<Instant>,
}

impl HeartbeatScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start using the interval derived from the gateway TTL in seconds.
    pub fn start_with_ttl(&mut self, ttl: Option<f64>, now: Instant) {
        self.start(heartbeat_interval(ttl), now);
    }

    pub fn start(&mut self, interval: Duration, now: Instant) {
        self.interval = Some(interval);
        self.next_at = Some(now + interval);
    }

    pub fn stop(&mut self) {
        self.interval = None;
        self.next_at = None;
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_at
    }

    pub fn on_due(&mut self, now: Instant) {
        self.next_at = self.interval.map(|interval| now + interval);
    }
}

/// Sleep until `deadline`, or forever if there is none.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_sets_interval() {
        let now = Instant::now();
        let mut hb = HeartbeatScheduler::new();
        hb.start_with_ttl(Some(10.0), now);
        assert_eq!(hb.interval(), Some(Duration::from_millis(9000)));
        assert_eq!(hb.deadline(), Some(now + Duration::from_millis(9000)));
    }

    #[test]
    fn on_due_rearms() {
        let now = Instant::now();
        let mut hb = HeartbeatScheduler::new();
        hb.start_with_ttl(None, now);
        let later = now + Duration::from_secs(15);
        hb.on_due(later);
        assert_eq!(hb.deadline(), Some(later + Duration::from_secs(15)));
    }

    #[test]
    fn stop_clears_deadline() {
        let mut hb = HeartbeatScheduler::new();
        hb.start(Duration::from_secs(5), Instant::now());
        hb.stop();
        assert_eq!(hb.deadline(), None);
        hb.on_due(Instant::now());
        assert_eq!(hb.deadline(), None);
    }
}
