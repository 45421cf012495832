//! Shared chat state with a single writer.
//!
//! `ChatStore` is the only component that mutates the message logs,
//! watermarks, unread counts and related maps. Every mutation takes the
//! state lock, applies the change, recomputes unread counts, publishes a new
//! snapshot and persists the touched namespaces before releasing the lock.
//! Nothing awaits while the lock is held.
//!
//! Session work writes through the `*_for` variants, which take the
//! session's cancellation token and check it after acquiring the state lock.
//! Teardown cancels tokens inside [`ChatStore::fence`], so once a session is
//! retired none of its writes can land.
//!
//! Snapshots share structure: an untouched conversation log is the same
//! `Arc` in consecutive snapshots, and a touched one is copied on write.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use chat_platform::KeyValueStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{SyncError, SyncErrorCategory},
    normalization::{IdentityCache, NormalizedBatch, normalize_batch},
    persistence::{Namespace, StatePersister},
    timeline::{ConversationTimeline, MergeOutcome, check_conversation},
    types::{Author, ConversationId, NormalizedMessage, RawEvent, ReadReceipt, RoomData, SyncConfig},
    unread::{SelfIdentity, compute_unread_counts},
};

/// Read-only view of the chat state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub room_messages: BTreeMap<ConversationId, Arc<ConversationTimeline>>,
    pub last_read_timestamps: BTreeMap<ConversationId, u64>,
    pub unread_counts: BTreeMap<ConversationId, u64>,
    pub latest_messages: BTreeMap<ConversationId, NormalizedMessage>,
    pub room_data: BTreeMap<ConversationId, RoomData>,
    pub sync_token: Option<String>,
}

impl StoreSnapshot {
    /// Messages of one conversation in display order.
    pub fn messages(&self, conversation_id: &str) -> &[NormalizedMessage] {
        self.room_messages
            .get(conversation_id)
            .map(|timeline| timeline.items())
            .unwrap_or_default()
    }

    pub fn unread(&self, conversation_id: &str) -> u64 {
        self.unread_counts.get(conversation_id).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> u64 {
        self.unread_counts.values().sum()
    }
}

/// Per-conversation result of ingesting raw events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub conversation_id: ConversationId,
    pub outcome: MergeOutcome,
    pub unresolved_senders: BTreeSet<String>,
}

struct StoreState {
    current: Arc<StoreSnapshot>,
    identities: Arc<IdentityCache>,
}

struct StoreShared {
    state: Mutex<StoreState>,
    snapshot_tx: watch::Sender<Arc<StoreSnapshot>>,
    persister: Option<StatePersister>,
    timeline_max_items: Option<usize>,
    notifications_conversation_id: Option<ConversationId>,
    displayable_kinds: Vec<String>,
    self_identity: SelfIdentity,
}

#[derive(Clone)]
pub struct ChatStore {
    shared: Arc<StoreShared>,
}

impl ChatStore {
    /// In-memory store without persistence.
    pub fn new(config: &SyncConfig, self_identity: SelfIdentity) -> Self {
        Self::build(config, self_identity, None)
    }

    /// Store that writes every mutation to `kv` (best-effort).
    pub fn with_persistence(
        config: &SyncConfig,
        self_identity: SelfIdentity,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::build(config, self_identity, Some(StatePersister::new(kv)))
    }

    fn build(
        config: &SyncConfig,
        self_identity: SelfIdentity,
        persister: Option<StatePersister>,
    ) -> Self {
        let current = Arc::new(StoreSnapshot::default());
        let (snapshot_tx, _) = watch::channel(current.clone());
        Self {
            shared: Arc::new(StoreShared {
                state: Mutex::new(StoreState {
                    current,
                    identities: Arc::new(IdentityCache::default()),
                }),
                snapshot_tx,
                persister,
                timeline_max_items: config.timeline_max_items,
                notifications_conversation_id: config.notifications_conversation_id.clone(),
                displayable_kinds: config.displayable_kinds.clone(),
                self_identity,
            }),
        }
    }

    /// Replace in-memory state with what the durable store holds.
    ///
    /// Must run before the first session starts. Without persistence this is
    /// a no-op.
    pub fn hydrate(&self) -> Result<(), SyncError> {
        let Some(persister) = &self.shared.persister else {
            return Ok(());
        };
        let persisted = persister.load();

        let mut room_messages = BTreeMap::new();
        for (conversation_id, items) in persisted.room_messages {
            match ConversationTimeline::from_items(
                conversation_id.clone(),
                items,
                self.shared.timeline_max_items,
            ) {
                Ok(timeline) => {
                    room_messages.insert(conversation_id, Arc::new(timeline));
                }
                Err(err) => {
                    warn!(%conversation_id, error = %err, "dropping inconsistent persisted log");
                }
            }
        }

        let mut state = self.lock()?;
        let snapshot = Arc::make_mut(&mut state.current);
        snapshot.room_messages = room_messages;
        snapshot.last_read_timestamps = persisted.last_read_timestamps;
        snapshot.latest_messages = persisted.latest_messages;
        snapshot.room_data = persisted.room_data;
        snapshot.sync_token = persisted.sync_token;
        debug!(
            conversations = snapshot.room_messages.len(),
            has_sync_token = snapshot.sync_token.is_some(),
            "store hydrated"
        );
        self.commit(&mut state, &[]);
        Ok(())
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Receiver notified after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn sync_token(&self) -> Option<String> {
        self.snapshot().sync_token.clone()
    }

    pub fn identities(&self) -> Result<Arc<IdentityCache>, SyncError> {
        Ok(self.lock()?.identities.clone())
    }

    /// Normalize raw events and merge them, all under one lock hold.
    pub fn ingest(&self, events: &[RawEvent]) -> Result<Vec<IngestReport>, SyncError> {
        self.ingest_locked(&mut *self.lock()?, events)
    }

    /// [`ingest`](Self::ingest) on behalf of a session; `None` once it is retired.
    pub fn ingest_for(
        &self,
        session: &CancellationToken,
        events: &[RawEvent],
    ) -> Result<Option<Vec<IngestReport>>, SyncError> {
        let Some(mut state) = self.lock_for(session)? else {
            return Ok(None);
        };
        self.ingest_locked(&mut state, events).map(Some)
    }

    fn ingest_locked(
        &self,
        state: &mut StoreState,
        events: &[RawEvent],
    ) -> Result<Vec<IngestReport>, SyncError> {
        let grouped = normalize_batch(events, &state.identities, &self.shared.displayable_kinds);

        let mut reports = Vec::with_capacity(grouped.len());
        let mut changed = false;
        for (conversation_id, batch) in grouped {
            let outcome = self.merge_locked(state, &conversation_id, &batch)?;
            changed |= outcome.changed();
            reports.push(IngestReport {
                conversation_id,
                outcome,
                unresolved_senders: batch.unresolved_senders,
            });
        }

        if changed {
            self.commit(state, &[Namespace::RoomMessages, Namespace::LatestMessages]);
        }
        Ok(reports)
    }

    /// Merge an already-normalized batch into one conversation log.
    ///
    /// A batch carrying messages of another conversation is rejected without
    /// touching the store.
    pub fn merge_batch(
        &self,
        conversation_id: &str,
        batch: &NormalizedBatch,
    ) -> Result<MergeOutcome, SyncError> {
        let mut state = self.lock()?;
        let outcome = self.merge_locked(&mut state, conversation_id, batch)?;
        if outcome.changed() {
            self.commit(&mut state, &[Namespace::RoomMessages, Namespace::LatestMessages]);
        }
        Ok(outcome)
    }

    /// Give tracked conversations a watermark at the epoch when they have none.
    pub fn ensure_watermarks<'a>(
        &self,
        conversation_ids: impl IntoIterator<Item = &'a ConversationId>,
    ) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        let snapshot = Arc::make_mut(&mut state.current);
        let mut inserted = 0_usize;
        for conversation_id in conversation_ids {
            if !snapshot.last_read_timestamps.contains_key(conversation_id) {
                snapshot
                    .last_read_timestamps
                    .insert(conversation_id.clone(), 0);
                inserted += 1;
            }
        }
        if inserted > 0 {
            trace!(inserted, "initialized watermarks");
            self.commit(&mut state, &[Namespace::LastReadTimestamps]);
        }
        Ok(())
    }

    /// Move the watermark of `conversation_id` up to the message `upto_event_id`.
    ///
    /// Returns the new watermark and whether it moved. Watermarks never move
    /// backwards.
    pub fn mark_read(
        &self,
        conversation_id: &str,
        upto_event_id: &str,
    ) -> Result<(u64, bool), SyncError> {
        let mut state = self.lock()?;
        let timeline = state
            .current
            .room_messages
            .get(conversation_id)
            .ok_or_else(|| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "unknown_conversation",
                    format!("no message log for conversation {conversation_id}"),
                )
            })?;
        let created_at = timeline
            .find(upto_event_id)
            .map(|message| message.created_at)
            .ok_or_else(|| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "unknown_event",
                    format!("event {upto_event_id} is not in conversation {conversation_id}"),
                )
            })?;

        let advanced = self.advance_watermark_locked(&mut state, conversation_id, created_at);
        let watermark = state
            .current
            .last_read_timestamps
            .get(conversation_id)
            .copied()
            .unwrap_or(created_at);
        if advanced {
            self.commit(&mut state, &[Namespace::LastReadTimestamps]);
        }
        Ok((watermark, advanced))
    }

    /// Apply read receipts sent by the local user; returns how many moved a watermark.
    pub fn apply_receipts(&self, receipts: &[ReadReceipt]) -> Result<usize, SyncError> {
        Ok(self.apply_receipts_locked(&mut *self.lock()?, receipts))
    }

    pub fn apply_receipts_for(
        &self,
        session: &CancellationToken,
        receipts: &[ReadReceipt],
    ) -> Result<Option<usize>, SyncError> {
        let Some(mut state) = self.lock_for(session)? else {
            return Ok(None);
        };
        Ok(Some(self.apply_receipts_locked(&mut state, receipts)))
    }

    fn apply_receipts_locked(&self, state: &mut StoreState, receipts: &[ReadReceipt]) -> usize {
        let mut advanced = 0;
        for receipt in receipts
            .iter()
            .filter(|receipt| self.shared.self_identity.is_self(&receipt.user_id))
        {
            let read_at = state
                .current
                .room_messages
                .get(&receipt.conversation_id)
                .and_then(|timeline| timeline.find(&receipt.event_id))
                .map(|message| message.created_at)
                .unwrap_or(receipt.timestamp_ms);
            if self.advance_watermark_locked(state, &receipt.conversation_id, read_at) {
                advanced += 1;
            }
        }
        if advanced > 0 {
            self.commit(state, &[Namespace::LastReadTimestamps]);
        }
        advanced
    }

    pub fn set_room_data(&self, conversation_id: &str, room_data: RoomData) -> Result<(), SyncError> {
        self.set_room_data_locked(&mut *self.lock()?, conversation_id, room_data);
        Ok(())
    }

    /// Returns `false` when the session is retired and nothing was written.
    pub fn set_room_data_for(
        &self,
        session: &CancellationToken,
        conversation_id: &str,
        room_data: RoomData,
    ) -> Result<bool, SyncError> {
        let Some(mut state) = self.lock_for(session)? else {
            return Ok(false);
        };
        self.set_room_data_locked(&mut state, conversation_id, room_data);
        Ok(true)
    }

    fn set_room_data_locked(&self, state: &mut StoreState, conversation_id: &str, room_data: RoomData) {
        if state.current.room_data.get(conversation_id) == Some(&room_data) {
            return;
        }
        Arc::make_mut(&mut state.current)
            .room_data
            .insert(conversation_id.to_owned(), room_data);
        self.commit(state, &[Namespace::RoomData]);
    }

    pub fn set_sync_token(&self, token: Option<String>) -> Result<(), SyncError> {
        self.set_sync_token_locked(&mut *self.lock()?, token);
        Ok(())
    }

    /// Returns `false` when the session is retired and the cursor was left alone.
    pub fn set_sync_token_for(
        &self,
        session: &CancellationToken,
        token: Option<String>,
    ) -> Result<bool, SyncError> {
        let Some(mut state) = self.lock_for(session)? else {
            return Ok(false);
        };
        self.set_sync_token_locked(&mut state, token);
        Ok(true)
    }

    fn set_sync_token_locked(&self, state: &mut StoreState, token: Option<String>) {
        if state.current.sync_token == token {
            return;
        }
        Arc::make_mut(&mut state.current).sync_token = token;
        self.commit(state, &[Namespace::SyncToken]);
    }

    /// Add resolved identities and patch placeholder authors already stored.
    pub fn insert_identities(
        &self,
        resolved: impl IntoIterator<Item = (String, Author)>,
    ) -> Result<usize, SyncError> {
        Ok(self.insert_identities_locked(&mut *self.lock()?, resolved))
    }

    pub fn insert_identities_for(
        &self,
        session: &CancellationToken,
        resolved: impl IntoIterator<Item = (String, Author)>,
    ) -> Result<Option<usize>, SyncError> {
        let Some(mut state) = self.lock_for(session)? else {
            return Ok(None);
        };
        Ok(Some(self.insert_identities_locked(&mut state, resolved)))
    }

    fn insert_identities_locked(
        &self,
        state: &mut StoreState,
        resolved: impl IntoIterator<Item = (String, Author)>,
    ) -> usize {
        Arc::make_mut(&mut state.identities).extend(resolved);
        let identities = state.identities.clone();

        let snapshot = Arc::make_mut(&mut state.current);
        let mut patched = 0;
        for timeline in snapshot.room_messages.values_mut() {
            let needs_patch = timeline
                .items()
                .iter()
                .any(|item| !item.author.resolved && identities.contains(&item.created_by));
            if needs_patch {
                patched += Arc::make_mut(timeline).patch_authors(&identities);
            }
        }
        if patched > 0 {
            refresh_latest(snapshot);
            self.commit(state, &[Namespace::RoomMessages, Namespace::LatestMessages]);
        }
        patched
    }

    /// Drop all chat state, e.g. on logout.
    pub fn reset(&self) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        state.current = Arc::new(StoreSnapshot::default());
        state.identities = Arc::new(IdentityCache::default());
        self.commit(
            &mut state,
            &[
                Namespace::LatestMessages,
                Namespace::RoomData,
                Namespace::RoomMessages,
                Namespace::LastReadTimestamps,
                Namespace::SyncToken,
            ],
        );
        Ok(())
    }

    /// Run `f` while holding the state lock.
    ///
    /// Any `*_for` write either completes before `f` runs or sees what `f`
    /// did. Sessions are cancelled through here.
    pub fn fence<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, SyncError> {
        self.shared
            .state
            .lock()
            .map_err(|_| SyncError::poisoned("chat store"))
    }

    fn lock_for(
        &self,
        session: &CancellationToken,
    ) -> Result<Option<MutexGuard<'_, StoreState>>, SyncError> {
        let state = self.lock()?;
        if session.is_cancelled() {
            trace!("dropping write from retired session");
            return Ok(None);
        }
        Ok(Some(state))
    }

    fn merge_locked(
        &self,
        state: &mut StoreState,
        conversation_id: &str,
        batch: &NormalizedBatch,
    ) -> Result<MergeOutcome, SyncError> {
        check_conversation(conversation_id, batch).map_err(|err| {
            SyncError::new(SyncErrorCategory::Config, "merge_rejected", err.to_string())
        })?;
        if batch.messages.is_empty() && !state.current.room_messages.contains_key(conversation_id) {
            return Ok(MergeOutcome::default());
        }

        let snapshot = Arc::make_mut(&mut state.current);
        let timeline = snapshot
            .room_messages
            .entry(conversation_id.to_owned())
            .or_insert_with(|| {
                Arc::new(ConversationTimeline::new(
                    conversation_id,
                    self.shared.timeline_max_items,
                ))
            });
        let outcome = Arc::make_mut(timeline).merge(batch).map_err(|err| {
            SyncError::new(SyncErrorCategory::Internal, "merge_failed", err.to_string())
        })?;

        match timeline.latest().cloned() {
            Some(latest) => {
                snapshot
                    .latest_messages
                    .insert(conversation_id.to_owned(), latest);
            }
            None => {
                snapshot.latest_messages.remove(conversation_id);
            }
        }
        trace!(%conversation_id, ?outcome, "batch merged");
        Ok(outcome)
    }

    fn advance_watermark_locked(
        &self,
        state: &mut StoreState,
        conversation_id: &str,
        read_at: u64,
    ) -> bool {
        let current = state
            .current
            .last_read_timestamps
            .get(conversation_id)
            .copied();
        if current.is_some_and(|current| current >= read_at) {
            return false;
        }
        Arc::make_mut(&mut state.current)
            .last_read_timestamps
            .insert(conversation_id.to_owned(), read_at);
        true
    }

    /// Recompute unread counts, publish, then persist `touched`.
    fn commit(&self, state: &mut StoreState, touched: &[Namespace]) {
        let snapshot = Arc::make_mut(&mut state.current);
        snapshot.unread_counts = compute_unread_counts(
            &snapshot.room_messages,
            &snapshot.last_read_timestamps,
            self.shared.notifications_conversation_id.as_deref(),
            &self.shared.self_identity,
        );
        self.shared.snapshot_tx.send_replace(state.current.clone());

        if let Some(persister) = &self.shared.persister {
            for namespace in touched {
                if let Err(err) = persist_namespace(persister, &state.current, *namespace) {
                    warn!(key = namespace.key(), error = %err, "failed persisting chat state");
                }
            }
        }
    }
}

fn persist_namespace(
    persister: &StatePersister,
    snapshot: &StoreSnapshot,
    namespace: Namespace,
) -> Result<(), SyncError> {
    match namespace {
        Namespace::LatestMessages => persister.save_json(namespace, &snapshot.latest_messages),
        Namespace::RoomData => persister.save_json(namespace, &snapshot.room_data),
        Namespace::RoomMessages => {
            let logs: BTreeMap<&str, &[NormalizedMessage]> = snapshot
                .room_messages
                .iter()
                .map(|(conversation_id, timeline)| (conversation_id.as_str(), timeline.items()))
                .collect();
            persister.save_json(namespace, &logs)
        }
        Namespace::LastReadTimestamps => {
            persister.save_json(namespace, &snapshot.last_read_timestamps)
        }
        Namespace::SyncToken => persister.save_sync_token(snapshot.sync_token.as_deref()),
    }
}

fn refresh_latest(snapshot: &mut StoreSnapshot) {
    snapshot.latest_messages = snapshot
        .room_messages
        .iter()
        .filter_map(|(conversation_id, timeline)| {
            timeline
                .latest()
                .map(|latest| (conversation_id.clone(), latest.clone()))
        })
        .collect();
}
