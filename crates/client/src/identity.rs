// Session identity: a profile-scoped session id sent to the gateway and a
// tab-scoped id used as the leader-election tie-break key.

use tracing::warn;
use uuid::Uuid;

use crate::store::KeyValueStore;

/// Durable-store key for the profile session id.
pub const PROFILE_SESSION_KEY: &str = "livecount.sid";
/// Session-store key for the tab id.
pub const TAB_ID_KEY: &str = "livecount.tab_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    profile_session_id: String,
    tab_id: String,
}

impl SessionIdentity {
    /// Read or mint both ids. Storage failures degrade to ephemeral ids.
    pub fn resolve(durable: &dyn KeyValueStore, session: &dyn KeyValueStore) -> Self {
        Self {
            profile_session_id: get_or_create(durable, PROFILE_SESSION_KEY),
            tab_id: get_or_create(session, TAB_ID_KEY),
        }
    }

    /// Fresh ids with no persistence.
    pub fn ephemeral() -> Self {
        Self { profile_session_id: new_id(), tab_id: new_id() }
    }

    pub fn from_parts(profile_session_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self { profile_session_id: profile_session_id.into(), tab_id: tab_id.into() }
    }

    pub fn profile_session_id(&self) -> &str {
        &self.profile_session_id
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }
}

fn get_or_create(store: &dyn KeyValueStore, key: &str) -> String {
    match store.get(key) {
        Ok(Some(id)) if !id.is_empty() => id,
        Ok(_) => {
            let id = new_id();
            if let Err(error) = store.set(key, &id) {
                warn!(key, %error, "failed to persist identity; using ephemeral id");
            }
            id
        }
        Err(error) => {
            warn!(key, %error, "identity store unavailable; using ephemeral id");
            new_id()
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StorageError};

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable)
        }
    }

    #[test]
    fn profile_id_is_stable_across_tabs() {
        let durable = MemoryStore::new();
        let a = SessionIdentity::resolve(&durable, &MemoryStore::new());
        let b = SessionIdentity::resolve(&durable, &MemoryStore::new());
        assert_eq!(a.profile_session_id(), b.profile_session_id());
        assert_ne!(a.tab_id(), b.tab_id());
    }

    #[test]
    fn tab_id_survives_reload_within_tab() {
        let durable = MemoryStore::new();
        let session = MemoryStore::new();
        let first = SessionIdentity::resolve(&durable, &session);
        let reloaded = SessionIdentity::resolve(&durable, &session);
        assert_eq!(first, reloaded);
    }

    #[test]
    fn existing_ids_are_reused() {
        let durable = MemoryStore::with_entries([(PROFILE_SESSION_KEY, "profile-1")]);
        let session = MemoryStore::with_entries([(TAB_ID_KEY, "tab-9")]);
        let identity = SessionIdentity::resolve(&durable, &session);
        assert_eq!(identity.profile_session_id(), "profile-1");
        assert_eq!(identity.tab_id(), "tab-9");
    }

    #[test]
    fn broken_storage_degrades_to_ephemeral() {
        let identity = SessionIdentity::resolve(&BrokenStore, &BrokenStore);
        assert!(!identity.profile_session_id().is_empty());
        assert!(!identity.tab_id().is_empty());
    }
}
