// livecount client: per-room live presence shared across the tabs of one
// profile, with a single upstream gateway connection per room.

/// Log a lifecycle event: `info!` when verbose presence logging is on,
/// `debug!` otherwise.
macro_rules! lifecycle {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            ::tracing::info!($($arg)+)
        } else {
            ::tracing::debug!($($arg)+)
        }
    };
}

pub mod broadcast;
pub mod config;
pub mod facade;
pub mod heartbeat;
pub mod identity;
pub mod leader;
pub mod origin;
pub mod poller;
pub mod registry;
mod room;
pub mod site;
pub mod socket;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcast::LocalBus;
pub use config::PresenceConfig;
pub use facade::{PresenceHandle, PresenceService, PresenceState, ServiceParts};
pub use livecount_common::types::Room;
pub use site::SiteOnline;
