// Core domain types shared across livecount crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix of the per-room broadcast channel name.
pub const ROOM_CHANNEL_PREFIX: &str = "live-room:";

/// A presence scope, typically a page path. Used only as a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Room(String);

impl Room {
    /// Build a room key. An empty key falls back to the site root `/`.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        if key.trim().is_empty() {
            Self("/".to_string())
        } else {
            Self(key)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the local broadcast channel carrying this room's coordination.
    pub fn channel_name(&self) -> String {
        format!("{ROOM_CHANNEL_PREFIX}{}", self.0)
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Room {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Room {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
