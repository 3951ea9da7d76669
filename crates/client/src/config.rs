// Local configuration for the presence client.
//
// Global config: `~/.livecount/config.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::leader::ElectionTiming;
use crate::socket::ReconnectPolicy;

/// Stand-in for the page origin when none is configured.
pub const DEFAULT_PAGE_ORIGIN: &str = "http://localhost";

/// Root directory for livecount state: `~/.livecount/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".livecount"))
}

/// Path to the global config file: `~/.livecount/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Path to the durable key-value store: `~/.livecount/state.toml`.
pub fn global_state_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("state.toml"))
}

// ── Presence config ────────────────────────────────────────────────

/// Client configuration at `~/.livecount/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    /// Default gateway origin (e.g. `https://gw.example.com`). Unset means
    /// the page origin.
    pub gateway_origin: Option<String>,
    /// Origin of the page hosting the presence widgets.
    pub page_origin: String,
    /// Candidate socket paths for room presence, tried in order.
    pub room_paths: Vec<String>,
    /// Candidate socket paths for the site-wide visitor counter.
    pub site_paths: Vec<String>,
    /// Aggregate count endpoint polled when a room socket is degraded.
    pub online_path: String,
    /// Per-room breakdown endpoint polled when the site socket is degraded.
    pub activity_path: String,
    /// Send `updateSid` once after each open.
    pub send_update_sid: bool,
    /// Verbose lifecycle logging.
    pub debug: bool,
    pub timing: TimingConfig,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            gateway_origin: None,
            page_origin: DEFAULT_PAGE_ORIGIN.into(),
            room_paths: vec!["/v1/ws".into()],
            site_paths: vec!["/v1/ws/web".into(), "/web".into()],
            online_path: "/v1/metrics/online".into(),
            activity_path: "/v1/activity/rooms".into(),
            send_update_sid: false,
            debug: false,
            timing: TimingConfig::default(),
        }
    }
}

impl PresenceConfig {
    /// Load from `~/.livecount/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to `~/.livecount/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = global_config_path().ok_or(ConfigError::NoHomeDir)?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// The configured page origin, or `http://localhost` if it doesn't parse.
    pub fn page_origin_url(&self) -> Url {
        Url::parse(&self.page_origin).unwrap_or_else(|_| default_page_origin())
    }
}

pub(crate) fn default_page_origin() -> Url {
    Url::parse(DEFAULT_PAGE_ORIGIN).expect("default page origin is a valid URL")
}

/// Timers and thresholds. All values in milliseconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    /// Consecutive socket failures before fallback polling starts.
    pub failure_threshold: u32,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub leader_beat_ms: u64,
    /// A leader signal older than this is considered gone.
    pub leader_stale_ms: u64,
    /// Staleness bound applied when the election delay fires.
    pub election_recheck_ms: u64,
    pub election_jitter_min_ms: u64,
    pub election_jitter_max_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            backoff_floor_ms: 1000,
            backoff_ceiling_ms: 10_000,
            failure_threshold: 2,
            poll_interval_ms: 8000,
            poll_timeout_ms: 3000,
            leader_beat_ms: 2000,
            leader_stale_ms: 3000,
            election_recheck_ms: 2800,
            election_jitter_min_ms: 200,
            election_jitter_max_ms: 350,
        }
    }
}

impl TimingConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.backoff_floor_ms),
            max_delay: Duration::from_millis(self.backoff_ceiling_ms.max(self.backoff_floor_ms)),
            fallback_after: self.failure_threshold.max(1),
        }
    }

    pub fn election(&self) -> ElectionTiming {
        let jitter_min = self.election_jitter_min_ms.min(self.election_jitter_max_ms);
        ElectionTiming {
            beat_interval: Duration::from_millis(self.leader_beat_ms),
            stale_after: Duration::from_millis(self.leader_stale_ms),
            recheck_after: Duration::from_millis(self.election_recheck_ms),
            jitter_min: Duration::from_millis(jitter_min),
            jitter_max: Duration::from_millis(self.election_jitter_max_ms.max(jitter_min)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("could not determine home directory")]
    NoHomeDir,
}
