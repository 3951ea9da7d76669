// Wire protocols: gateway socket frames, fallback endpoints, and the
// cross-tab broadcast bus.

pub mod broadcast;
pub mod gateway;

use thiserror::Error;

/// A frame that could not be decoded or encoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
