// Per-room leader election between tabs of one profile.
//
// Best-effort and eventually consistent: a tab that has not heard from a
// leader recently waits a randomized delay, re-checks, and promotes
// itself. Two simultaneous leaders resolve by tab id; the one that hears
// a peer with a greater id steps down. There is no lease store.
//
// This type only decides. The room actor owns the deadlines' effects
// (socket, broadcasts) and feeds observations back in.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Timing knobs for the election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionTiming {
    /// Leader heartbeat period; also the follower watchdog period.
    pub beat_interval: Duration,
    /// A leader signal older than this triggers candidacy.
    pub stale_after: Duration,
    /// Staleness bound applied when the candidacy delay fires.
    pub recheck_after: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            beat_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(3),
            recheck_after: Duration::from_millis(2800),
            jitter_min: Duration::from_millis(200),
            jitter_max: Duration::from_millis(350),
        }
    }
}

/// Snapshot of the local election state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Leader,
    Follower,
    /// Candidacy delay is running.
    Candidate,
}

#[derive(Debug)]
pub struct LeaderElection {
    tab_id: String,
    timing: ElectionTiming,
    is_leader: bool,
    last_leader_seen: Option<Instant>,
    election_at: Option<Instant>,
    beat_at: Option<Instant>,
    watchdog_at: Option<Instant>,
}

impl LeaderElection {
    pub fn new(tab_id: impl Into<String>, timing: ElectionTiming) -> Self {
        Self {
            tab_id: tab_id.into(),
            timing,
            is_leader: false,
            last_leader_seen: None,
            election_at: None,
            beat_at: None,
            watchdog_at: None,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn state(&self) -> LeaderState {
        if self.is_leader {
            LeaderState::Leader
        } else if self.election_at.is_some() {
            LeaderState::Candidate
        } else {
            LeaderState::Follower
        }
    }

    pub fn election_deadline(&self) -> Option<Instant> {
        self.election_at
    }

    pub fn beat_deadline(&self) -> Option<Instant> {
        self.beat_at
    }

    pub fn watchdog_deadline(&self) -> Option<Instant> {
        self.watchdog_at
    }

    fn seen_within(&self, now: Instant, window: Duration) -> bool {
        self.last_leader_seen.is_some_and(|seen| now.saturating_duration_since(seen) <= window)
    }

    /// Start a candidacy unless a leader was heard from recently. Returns
    /// whether a candidacy is pending.
    pub fn ensure_presence(&mut self, now: Instant) -> bool {
        if self.is_leader {
            return false;
        }
        self.watchdog_at = Some(now + self.timing.beat_interval);
        if self.seen_within(now, self.timing.stale_after) {
            return false;
        }
        if self.election_at.is_none() {
            self.election_at = Some(now + self.jitter());
        }
        true
    }

    fn jitter(&self) -> Duration {
        let min = self.timing.jitter_min.as_millis() as u64;
        let max = self.timing.jitter_max.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }

    /// The candidacy delay fired. Returns true if this tab just became leader.
    pub fn on_election_due(&mut self, now: Instant) -> bool {
        self.election_at = None;
        if self.is_leader || self.seen_within(now, self.timing.recheck_after) {
            return false;
        }
        self.is_leader = true;
        self.beat_at = Some(now + self.timing.beat_interval);
        self.watchdog_at = None;
        true
    }

    pub fn on_beat_due(&mut self, now: Instant) {
        self.beat_at = self.is_leader.then(|| now + self.timing.beat_interval);
    }

    /// Periodic follower check. Returns true if the leader has gone quiet
    /// and presence should be re-established.
    pub fn on_watchdog_due(&mut self, now: Instant) -> bool {
        if self.is_leader {
            self.watchdog_at = None;
            return false;
        }
        self.watchdog_at = Some(now + self.timing.beat_interval);
        self.election_at.is_none() && !self.seen_within(now, self.timing.stale_after)
    }

    /// Record a heartbeat or state broadcast from a peer tab. Returns true
    /// if this tab is leader and must yield to the peer.
    pub fn observe_peer(&mut self, from: &str, now: Instant) -> bool {
        self.last_leader_seen = Some(now);
        self.is_leader && from > self.tab_id.as_str()
    }

    /// Revert to follower.
    pub fn step_down(&mut self, now: Instant) {
        self.is_leader = false;
        self.beat_at = None;
        self.election_at = None;
        self.watchdog_at = Some(now + self.timing.beat_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_timing() -> ElectionTiming {
        ElectionTiming {
            jitter_min: Duration::from_millis(250),
            jitter_max: Duration::from_millis(250),
            ..Default::default()
        }
    }

    #[test]
    fn lone_tab_becomes_candidate_then_leader() {
        let now = Instant::now();
        let mut election = LeaderElection::new("tab-a", fixed_timing());
        assert!(election.ensure_presence(now));
        assert_eq!(election.state(), LeaderState::Candidate);
        assert_eq!(election.election_deadline(), Some(now + Duration::from_millis(250)));

        let due = now + Duration::from_millis(250);
        assert!(election.on_election_due(due));
        assert!(election.is_leader());
        assert_eq!(election.beat_deadline(), Some(due + Duration::from_secs(2)));
    }

    #[test]
    fn recent_leader_keeps_tab_follower() {
        let now = Instant::now();
        let mut election = LeaderElection::new("tab-z", fixed_timing());
        election.observe_peer("tab-a", now);
        assert!(!election.ensure_presence(now + Duration::from_millis(100)));
        assert_eq!(election.state(), LeaderState::Follower);
    }

    #[test]
    fn leader_heard_during_delay_cancels_promotion() {
        let now = Instant::now();
        let mut election = LeaderElection::new("tab-a", fixed_timing());
        election.ensure_presence(now);
        election.observe_peer("tab-b", now + Duration::from_millis(100));
        assert!(!election.on_election_due(now + Duration::from_millis(250)));
        assert!(!election.is_leader());
    }

    #[test]
    fn greater_peer_id_forces_step_down() {
        let now = Instant::now();
        let mut election = LeaderElection::new("tab-b", fixed_timing());
        election.ensure_presence(now);
        election.on_election_due(now + Duration::from_millis(250));

        assert!(!election.observe_peer("tab-a", now + Duration::from_millis(300)));
        assert!(election.observe_peer("tab-c", now + Duration::from_millis(300)));
        election.step_down(now + Duration::from_millis(300));
        assert!(!election.is_leader());
        assert_eq!(election.beat_deadline(), None);
    }

    #[test]
    fn followers_never_step_down() {
        let mut election = LeaderElection::new("tab-a", fixed_timing());
        assert!(!election.observe_peer("tab-z", Instant::now()));
    }

    #[test]
    fn watchdog_fires_once_leader_is_stale() {
        let now = Instant::now();
        let mut election = LeaderElection::new("tab-a", fixed_timing());
        election.observe_peer("tab-b", now);
        election.ensure_presence(now);

        assert!(!election.on_watchdog_due(now + Duration::from_secs(2)));
        assert!(election.on_watchdog_due(now + Duration::from_secs(4)));
        assert_eq!(election.watchdog_deadline(), Some(now + Duration::from_secs(6)));
    }

    #[test]
    fn jitter_stays_in_range() {
        let now = Instant::now();
        for _ in 0..50 {
            let mut election = LeaderElection::new("t", ElectionTiming::default());
            election.ensure_presence(now);
            let delay = election.election_deadline().unwrap() - now;
            assert!(delay >= Duration::from_millis(200) && delay < Duration::from_millis(350));
        }
    }
}
