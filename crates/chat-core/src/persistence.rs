//! Persisted local state layout.
//!
//! Each namespace is one JSON document under its key. Loading is tolerant:
//! a missing or unreadable namespace starts empty.

use std::{collections::BTreeMap, sync::Arc};

use chat_platform::{KeyValueStore, StoreError};
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::{
    error::SyncError,
    types::{ConversationId, NormalizedMessage, RoomData},
};

pub const LATEST_MESSAGES_KEY: &str = "latestMessages";
pub const ROOM_DATA_KEY: &str = "roomData";
pub const ROOM_MESSAGES_KEY: &str = "roomMessages";
pub const LAST_READ_TIMESTAMPS_KEY: &str = "lastReadTimestamps";
pub const SYNC_TOKEN_KEY: &str = "syncToken";

/// One persisted namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Namespace {
    LatestMessages,
    RoomData,
    RoomMessages,
    LastReadTimestamps,
    SyncToken,
}

impl Namespace {
    pub fn key(self) -> &'static str {
        match self {
            Self::LatestMessages => LATEST_MESSAGES_KEY,
            Self::RoomData => ROOM_DATA_KEY,
            Self::RoomMessages => ROOM_MESSAGES_KEY,
            Self::LastReadTimestamps => LAST_READ_TIMESTAMPS_KEY,
            Self::SyncToken => SYNC_TOKEN_KEY,
        }
    }
}

/// Everything rehydrated at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub latest_messages: BTreeMap<ConversationId, NormalizedMessage>,
    pub room_data: BTreeMap<ConversationId, RoomData>,
    pub room_messages: BTreeMap<ConversationId, Vec<NormalizedMessage>>,
    pub last_read_timestamps: BTreeMap<ConversationId, u64>,
    pub sync_token: Option<String>,
}

/// Reads and writes namespaces against a [`KeyValueStore`].
#[derive(Clone)]
pub struct StatePersister {
    kv: Arc<dyn KeyValueStore>,
}

impl StatePersister {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn load(&self) -> PersistedState {
        PersistedState {
            latest_messages: self.load_json(Namespace::LatestMessages).unwrap_or_default(),
            room_data: self.load_json(Namespace::RoomData).unwrap_or_default(),
            room_messages: self.load_json(Namespace::RoomMessages).unwrap_or_default(),
            last_read_timestamps: self
                .load_json(Namespace::LastReadTimestamps)
                .unwrap_or_default(),
            sync_token: self.load_sync_token(),
        }
    }

    pub fn save_json<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        value: &T,
    ) -> Result<(), SyncError> {
        let encoded = serde_json::to_string(value)?;
        self.kv.set(namespace.key(), &encoded)?;
        Ok(())
    }

    pub fn save_sync_token(&self, token: Option<&str>) -> Result<(), SyncError> {
        match token {
            Some(token) => self.kv.set(SYNC_TOKEN_KEY, token)?,
            None => match self.kv.delete(SYNC_TOKEN_KEY) {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(err) => return Err(err.into()),
            },
        }
        Ok(())
    }

    fn load_sync_token(&self) -> Option<String> {
        match self.kv.get(SYNC_TOKEN_KEY) {
            Ok(token) if !token.trim().is_empty() => Some(token),
            Ok(_) | Err(StoreError::NotFound) => None,
            Err(err) => {
                warn!(error = %err, "failed loading sync token; starting without cursor");
                None
            }
        }
    }

    fn load_json<T: DeserializeOwned>(&self, namespace: Namespace) -> Option<T> {
        let raw = match self.kv.get(namespace.key()) {
            Ok(raw) => raw,
            Err(StoreError::NotFound) => return None,
            Err(err) => {
                warn!(key = namespace.key(), error = %err, "failed reading persisted namespace");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = namespace.key(), error = %err, "ignoring unparseable persisted namespace");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Author, MESSAGE_KIND};
    use chat_platform::InMemoryKeyValueStore;
    use serde_json::json;

    fn persister() -> (InMemoryKeyValueStore, StatePersister) {
        let kv = InMemoryKeyValueStore::default();
        let persister = StatePersister::new(Arc::new(kv.clone()));
        (kv, persister)
    }

    #[test]
    fn empty_store_loads_default_state() {
        let (_, persister) = persister();
        assert_eq!(persister.load(), PersistedState::default());
    }

    #[test]
    fn writes_namespaces_under_stable_keys() {
        let (kv, persister) = persister();
        let message = NormalizedMessage {
            id: "$1".into(),
            conversation_id: "!c:x".into(),
            created_by: "@alice:x".into(),
            created_at: 7,
            content: json!({ "body": "hi" }),
            kind: MESSAGE_KIND.into(),
            author: Author::placeholder("@alice:x"),
        };
        let mut room_messages = BTreeMap::new();
        room_messages.insert("!c:x".to_owned(), vec![message.clone()]);
        let mut watermarks = BTreeMap::new();
        watermarks.insert("!c:x".to_owned(), 5_u64);

        persister
            .save_json(Namespace::RoomMessages, &room_messages)
            .expect("save messages");
        persister
            .save_json(Namespace::LastReadTimestamps, &watermarks)
            .expect("save watermarks");
        persister.save_sync_token(Some("s1_2")).expect("save token");

        let raw = kv.get("roomMessages").expect("raw messages");
        assert!(raw.contains("\"createdAt\":7"), "camelCase layout: {raw}");
        assert_eq!(kv.get("lastReadTimestamps").expect("raw"), "{\"!c:x\":5}");

        let loaded = persister.load();
        assert_eq!(loaded.room_messages, room_messages);
        assert_eq!(loaded.last_read_timestamps, watermarks);
        assert_eq!(loaded.sync_token.as_deref(), Some("s1_2"));
    }

    #[test]
    fn clearing_missing_sync_token_is_ok() {
        let (_, persister) = persister();
        persister.save_sync_token(None).expect("clear without token");
        persister.save_sync_token(Some("t")).expect("set");
        persister.save_sync_token(None).expect("clear");
        assert_eq!(persister.load().sync_token, None);
    }

    #[test]
    fn corrupt_namespace_is_skipped() {
        let (kv, persister) = persister();
        kv.set("roomData", "not json").expect("raw write");
        kv.set("lastReadTimestamps", "{\"!c:x\":9}").expect("raw write");

        let loaded = persister.load();
        assert!(loaded.room_data.is_empty());
        assert_eq!(loaded.last_read_timestamps.get("!c:x"), Some(&9));
    }
}
