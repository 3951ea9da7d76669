// Messages exchanged between tabs of one browser profile on a room's
// broadcast channel. Purely informational; they carry no ownership.

use serde::{Deserialize, Serialize};

use crate::types::Room;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum BroadcastMessage {
    /// Leader liveness beacon.
    #[serde(rename = "hb")]
    Heartbeat { room: Room, from: String, ts: i64 },

    /// The sender's view of the room state.
    #[serde(rename = "state")]
    StateSnapshot {
        room: Room,
        from: String,
        ts: i64,
        count: u64,
        connecting: bool,
        #[serde(default)]
        error: Option<String>,
    },

    /// Ask the current leader to publish its state.
    #[serde(rename = "req-sync")]
    SyncRequest { room: Room, from: String },
}

impl BroadcastMessage {
    pub fn room(&self) -> &Room {
        match self {
            Self::Heartbeat { room, .. }
            | Self::StateSnapshot { room, .. }
            | Self::SyncRequest { room, .. } => room,
        }
    }

    /// Tab id of the sender.
    pub fn from(&self) -> &str {
        match self {
            Self::Heartbeat { from, .. }
            | Self::StateSnapshot { from, .. }
            | Self::SyncRequest { from, .. } => from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_snapshot_wire_shape() {
        let msg = BroadcastMessage::StateSnapshot {
            room: Room::from("/blog/post-1"),
            from: "tab-a".into(),
            ts: 1_700_000_000_000,
            count: 3,
            connecting: false,
            error: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["room"], "/blog/post-1");
        assert_eq!(value["count"], 3);
        assert!(value["error"].is_null());
    }

    #[test]
    fn accessors_cover_every_variant() {
        let room = Room::from("/r");
        let msgs = [
            BroadcastMessage::Heartbeat { room: room.clone(), from: "x".into(), ts: 1 },
            BroadcastMessage::SyncRequest { room: room.clone(), from: "x".into() },
        ];
        for msg in msgs {
            assert_eq!(msg.room(), &room);
            assert_eq!(msg.from(), "x");
        }
    }

    #[test]
    fn sync_request_tag() {
        let json = r#"{"type":"req-sync","room":"/r","from":"t"}"#;
        let msg: BroadcastMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, BroadcastMessage::SyncRequest { room: Room::from("/r"), from: "t".into() });
    }
}
