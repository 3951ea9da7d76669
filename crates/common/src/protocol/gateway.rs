// Gateway wire protocol: socket frames and fallback HTTP payloads.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::ProtocolError;

/// Heartbeat interval used when the gateway advertises no usable TTL.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Lower bound on the derived heartbeat interval.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on the derived heartbeat interval.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Frames received from the gateway on a room socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Sent once after open; the TTL (seconds) drives the heartbeat interval.
    Hello {
        #[serde(default, deserialize_with = "lenient")]
        sid: Option<String>,
        #[serde(default, deserialize_with = "lenient")]
        ttl: Option<f64>,
        #[serde(default)]
        count: Option<u64>,
    },
    /// Periodic authoritative count.
    Sync {
        #[serde(default)]
        count: Option<u64>,
    },
    /// Any other `type`. Ignored by consumers.
    #[serde(other)]
    Unknown,
}

/// Optional field where a value of the wrong type reads as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

impl InboundMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Frames sent to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "hb")]
    Heartbeat,
    #[serde(rename = "updateSid")]
    UpdateSid { session_id: String },
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames received on the site-wide visitor socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SiteMessage {
    #[serde(rename = "VISITOR_ONLINE")]
    VisitorOnline {
        #[serde(default)]
        data: Option<VisitorData>,
    },
    #[serde(rename = "VISITOR_OFFLINE")]
    VisitorOffline {
        #[serde(default)]
        data: Option<VisitorData>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisitorData {
    #[serde(default)]
    pub online: Option<u64>,
}

impl SiteMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Online total carried by a visitor frame, if any.
    pub fn online(&self) -> Option<u64> {
        match self {
            Self::VisitorOnline { data } | Self::VisitorOffline { data } => {
                data.as_ref().and_then(|d| d.online)
            }
            Self::Unknown => None,
        }
    }
}

/// Body of the aggregate online-count endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OnlineResponse {
    /// `{"online": n}`
    Total { online: u64 },
    /// `{"rooms": [...], "room_count": {room: n}}`
    Rooms {
        #[serde(default)]
        rooms: Vec<String>,
        room_count: BTreeMap<String, u64>,
    },
}

impl OnlineResponse {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The aggregate count; the rooms variant sums its breakdown.
    pub fn total(&self) -> u64 {
        match self {
            Self::Total { online } => *online,
            Self::Rooms { room_count, .. } => {
                room_count.values().fold(0u64, |acc, n| acc.saturating_add(*n))
            }
        }
    }
}

/// Heartbeat interval derived from the gateway's advertised TTL (seconds):
/// `min(30s, max(5s, ttl - 1s))`, or 15s when the TTL is absent, zero or not finite.
pub fn heartbeat_interval(ttl: Option<f64>) -> Duration {
    let Some(ttl) = ttl.filter(|t| t.is_finite() && *t != 0.0) else {
        return DEFAULT_HEARTBEAT_INTERVAL;
    };
    let ms = (ttl * 1000.0 - 1000.0)
        .max(MIN_HEARTBEAT_INTERVAL.as_millis() as f64)
        .min(MAX_HEARTBEAT_INTERVAL.as_millis() as f64);
    Duration::from_millis(ms as u64)
}
