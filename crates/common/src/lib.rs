// livecount-common: wire types and shared rules for the livecount workspace

pub mod protocol;
pub mod types;
