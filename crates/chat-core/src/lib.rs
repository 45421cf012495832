//! Chat synchronization and reconciliation core.
//!
//! This crate keeps a local, durable picture of a user's conversations in
//! step with a remote messaging backend: backfill, live merge, unread
//! accounting and session supersession. Backends plug in through
//! [`MessagingBackend`].

/// Messaging backend contract and live subscription handle.
pub mod backend;
/// Broadcast bus for session notifications.
pub mod channel;
/// Stable sync error types and HTTP classification helpers.
pub mod error;
/// Raw event to message normalization.
pub mod normalization;
/// Persisted namespaces and their loader.
pub mod persistence;
/// Cursor-polling adapter over a "messages since id" source.
pub mod polling;
/// Backoff policy used by retry loops.
pub mod retry;
/// Session lifecycle and supersession.
pub mod session;
/// Session lifecycle state machine.
pub mod state_machine;
/// Single-writer local chat store.
pub mod store;
/// Per-conversation message log merge.
pub mod timeline;
/// Shared data types.
pub mod types;
/// Unread count derivation.
pub mod unread;

pub use backend::{BatchSender, LiveSubscription, LiveSyncRequest, MessagingBackend};
pub use channel::{SyncEvent, SyncEventBus, SyncEventStream};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use normalization::{IdentityCache, NormalizedBatch, normalize_batch, normalize_event};
pub use persistence::{Namespace, PersistedState, StatePersister};
pub use polling::{PollSource, PollingBackend};
pub use retry::{Backoff, RetryPolicy};
pub use session::{SessionOutcome, SyncSessionManager};
pub use state_machine::{SessionAction, SessionPhase, SessionStateMachine};
pub use store::{ChatStore, IngestReport, StoreSnapshot};
pub use timeline::{ConversationTimeline, MergeOutcome, TimelineMergeError};
pub use types::{
    Author, ConversationId, Credentials, HistoryPage, LiveBatch, NormalizedMessage, RawEvent,
    ReadReceipt, RoomData, SyncConfig,
};
pub use unread::{SelfIdentity, compute_unread_counts, unread_count};
