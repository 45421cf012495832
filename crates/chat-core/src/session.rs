//! Sync session lifecycle.
//!
//! At most one session is current. Starting a new session synchronously
//! retires the previous one: its token is cancelled inside the store fence,
//! its live subscription is stopped and its batch pump is aborted. Every store
//! write of a session goes through a `*_for` method that re-checks the token
//! under the store lock, so work still in flight on another thread is
//! discarded even when it already passed its last await.

use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    backend::{LiveSubscription, LiveSyncRequest, MessagingBackend},
    channel::{SyncEvent, SyncEventBus, SyncEventStream},
    error::{SyncError, SyncErrorCategory},
    state_machine::{SessionAction, SessionPhase, SessionStateMachine},
    store::{ChatStore, IngestReport},
    timeline::ConversationTimeline,
    types::{ConversationId, Credentials, LiveBatch, RawEvent, RoomData, SyncConfig},
};

const SERVER_PAGINATION_LIMIT_CAP: u16 = 100;
const LIVE_BATCH_BUFFER: usize = 64;

/// How a `start_sync` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The session is current and its live subscription is running.
    Live { generation: u64 },
    /// A newer session or a teardown replaced this one before it went live.
    Superseded { generation: u64 },
}

struct ActiveSession {
    machine: SessionStateMachine,
    cancel: CancellationToken,
    subscription: Option<LiveSubscription>,
    pump: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn retire(mut self, store: &ChatStore, events: &SyncEventBus) {
        store.fence(|| self.cancel.cancel());
        if let Some(mut subscription) = self.subscription.take() {
            subscription.stop();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        match self.machine.apply(SessionAction::Stop) {
            Ok(phase_events) => events.emit_all(phase_events),
            Err(err) => warn!(error = %err, "unexpected error stopping session"),
        }
    }
}

struct ManagerShared<B: MessagingBackend> {
    backend: Arc<B>,
    store: ChatStore,
    events: SyncEventBus,
    backfill_limit: u16,
    generation: AtomicU64,
    active: Mutex<Option<ActiveSession>>,
}

impl<B: MessagingBackend> Drop for ManagerShared<B> {
    fn drop(&mut self) {
        let active = match self.active.get_mut() {
            Ok(active) => active.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(active) = active {
            debug!(
                generation = active.machine.generation(),
                "session manager dropped; stopping sync"
            );
            active.retire(&self.store, &self.events);
        }
    }
}

/// Owns the single live synchronization session.
pub struct SyncSessionManager<B: MessagingBackend> {
    shared: Arc<ManagerShared<B>>,
}

impl<B: MessagingBackend> Clone for SyncSessionManager<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: MessagingBackend> SyncSessionManager<B> {
    pub fn new(backend: Arc<B>, store: ChatStore, config: &SyncConfig) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                backend,
                store,
                events: SyncEventBus::default(),
                backfill_limit: ConversationTimeline::bounded_paginate_limit(
                    config.backfill_limit,
                    SERVER_PAGINATION_LIMIT_CAP,
                ),
                generation: AtomicU64::new(0),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &ChatStore {
        &self.shared.store
    }

    pub fn subscribe_events(&self) -> SyncEventStream {
        self.shared.events.subscribe()
    }

    /// Latest generation handed out; bumps on every start and stop.
    pub fn current_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Phase of the current session, if any.
    pub fn current_phase(&self) -> Option<SessionPhase> {
        self.lock_active()
            .as_ref()
            .map(|active| active.machine.phase())
    }

    /// Start a session for `credentials` tracking `conversation_ids`,
    /// superseding any previous session.
    ///
    /// Backfills every tracked conversation (unless a resumable cursor is
    /// stored), then starts the live subscription. A failed historical fetch
    /// only skips that conversation; a failed live start is returned.
    pub async fn start_sync(
        &self,
        credentials: Credentials,
        conversation_ids: BTreeSet<ConversationId>,
    ) -> Result<SessionOutcome, SyncError> {
        let ctx = self.begin_session();
        let generation = ctx.generation;
        info!(
            generation,
            user_id = %credentials.user_id,
            conversations = conversation_ids.len(),
            "starting sync session"
        );

        self.shared.store.ensure_watermarks(&conversation_ids)?;

        if self.shared.store.sync_token().is_some() {
            debug!(generation, "resumable cursor stored; skipping backfill");
        } else {
            self.transition(&ctx, SessionAction::BeginBackfill)?;
            if !self.backfill(&ctx, &credentials, &conversation_ids).await {
                debug!(generation, "session superseded during backfill");
                return Ok(SessionOutcome::Superseded { generation });
            }
        }

        if !ctx.is_current() {
            return Ok(SessionOutcome::Superseded { generation });
        }

        let (batch_tx, batch_rx) = mpsc::channel(LIVE_BATCH_BUFFER);
        let request = LiveSyncRequest {
            conversation_ids,
            since: self.shared.store.sync_token(),
        };
        let subscription = match self
            .shared
            .backend
            .start_live_sync(&credentials, request, batch_tx)
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                if !ctx.is_current() {
                    return Ok(SessionOutcome::Superseded { generation });
                }
                error!(generation, error = %err, "failed starting live sync");
                self.transition(&ctx, SessionAction::Fail)?;
                return Err(err);
            }
        };

        self.install_live(ctx, subscription, batch_rx)
    }

    /// Tear down the current session. Idempotent.
    pub fn stop(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let previous = self.lock_active().take();
        if let Some(previous) = previous {
            info!(generation = previous.machine.generation(), "stopping sync session");
            previous.retire(&self.shared.store, &self.shared.events);
        }
    }

    /// Mark `conversation_id` read up to `upto_event_id`.
    ///
    /// Returns the resulting watermark. When the watermark moved, a read
    /// receipt is sent to the backend in the background.
    pub fn mark_read(&self, conversation_id: &str, upto_event_id: &str) -> Result<u64, SyncError> {
        let (watermark, advanced) = self.shared.store.mark_read(conversation_id, upto_event_id)?;
        if !advanced {
            trace!(%conversation_id, upto_event_id, "watermark unchanged; skipping receipt");
            return Ok(watermark);
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(%conversation_id, "no async runtime; read receipt not sent");
            return Ok(watermark);
        };
        let backend = self.shared.backend.clone();
        let conversation_id = conversation_id.to_owned();
        let event_id = upto_event_id.to_owned();
        runtime.spawn(async move {
            if let Err(err) = backend.send_read_receipt(&conversation_id, &event_id).await {
                warn!(%conversation_id, %event_id, error = %err, "failed sending read receipt");
            }
        });
        Ok(watermark)
    }

    fn begin_session(&self) -> SessionContext<B> {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        let mut active = self.lock_active();
        if let Some(previous) = active.take() {
            debug!(
                superseded = previous.machine.generation(),
                generation, "superseding sync session"
            );
            previous.retire(&self.shared.store, &self.shared.events);
        }
        *active = Some(ActiveSession {
            machine: SessionStateMachine::new(generation),
            cancel: cancel.clone(),
            subscription: None,
            pump: None,
        });

        SessionContext {
            generation,
            cancel,
            backend: self.shared.backend.clone(),
            store: self.shared.store.clone(),
            events: self.shared.events.clone(),
        }
    }

    /// Returns `false` when the session was superseded.
    async fn backfill(
        &self,
        ctx: &SessionContext<B>,
        credentials: &Credentials,
        conversation_ids: &BTreeSet<ConversationId>,
    ) -> bool {
        for conversation_id in conversation_ids {
            if !ctx.is_current() {
                return false;
            }

            let fetched = tokio::select! {
                biased;
                result = self.shared.backend.fetch_historical_events(
                    credentials,
                    conversation_id,
                    self.shared.backfill_limit,
                ) => result,
                _ = ctx.cancel.cancelled() => return false,
            };
            if !ctx.is_current() {
                return false;
            }

            match fetched {
                Ok(page) => {
                    trace!(
                        generation = ctx.generation,
                        %conversation_id,
                        events = page.events.len(),
                        "historical page fetched"
                    );
                    let room_data = RoomData {
                        pagination_token: page.pagination_token.clone(),
                        last_event_id: page.events.last().map(|event| event.id.clone()),
                    };
                    match ctx.store.set_room_data_for(&ctx.cancel, conversation_id, room_data) {
                        Ok(true) => {}
                        Ok(false) => return false,
                        Err(err) => {
                            warn!(%conversation_id, error = %err, "failed recording room data")
                        }
                    }
                    if !ctx.ingest(&page.events) {
                        return false;
                    }
                }
                Err(err) => {
                    if err.category == SyncErrorCategory::Auth {
                        debug!(%conversation_id, error = %err, "no access to conversation; skipping backfill");
                    } else {
                        warn!(%conversation_id, error = %err, "backfill failed; continuing with next conversation");
                    }
                    ctx.events.emit(SyncEvent::BackfillFailed {
                        generation: ctx.generation,
                        conversation_id: conversation_id.clone(),
                        code: err.code,
                    });
                }
            }
        }
        true
    }

    fn install_live(
        &self,
        ctx: SessionContext<B>,
        subscription: LiveSubscription,
        batch_rx: mpsc::Receiver<LiveBatch>,
    ) -> Result<SessionOutcome, SyncError> {
        let generation = ctx.generation;
        let mut active = self.lock_active();
        let Some(session) = active
            .as_mut()
            .filter(|session| session.machine.generation() == generation && ctx.is_current())
        else {
            drop(subscription);
            return Ok(SessionOutcome::Superseded { generation });
        };

        let phase_events = session.machine.apply(SessionAction::StartLive)?;
        session.subscription = Some(subscription);
        session.pump = Some(tokio::spawn(run_live_pump(ctx, batch_rx)));
        self.shared.events.emit_all(phase_events);
        info!(generation, "live sync running");
        Ok(SessionOutcome::Live { generation })
    }

    fn transition(&self, ctx: &SessionContext<B>, action: SessionAction) -> Result<(), SyncError> {
        let mut active = self.lock_active();
        let Some(session) = active
            .as_mut()
            .filter(|session| session.machine.generation() == ctx.generation)
        else {
            return Ok(());
        };
        let phase_events = session.machine.apply(action)?;
        self.shared.events.emit_all(phase_events);
        Ok(())
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        // Teardown must run even after a panic elsewhere.
        match self.shared.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Everything a session's background work needs, without the manager.
struct SessionContext<B: MessagingBackend> {
    generation: u64,
    cancel: CancellationToken,
    backend: Arc<B>,
    store: ChatStore,
    events: SyncEventBus,
}

impl<B: MessagingBackend> SessionContext<B> {
    fn is_current(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Returns `false` when the session was retired before the merge.
    fn ingest(&self, events: &[RawEvent]) -> bool {
        if events.is_empty() {
            return self.is_current();
        }
        match self.store.ingest_for(&self.cancel, events) {
            Ok(Some(reports)) => self.after_merge(reports),
            Ok(None) => {
                trace!(generation = self.generation, "discarding batch of retired session");
                return false;
            }
            Err(err) => warn!(generation = self.generation, error = %err, "failed merging batch"),
        }
        true
    }

    /// Returns `false` when the session was retired part way.
    fn apply_live_batch(&self, batch: LiveBatch) -> bool {
        if !self.ingest(&batch.events) {
            return false;
        }

        if !batch.receipts.is_empty() {
            match self.store.apply_receipts_for(&self.cancel, &batch.receipts) {
                Ok(Some(advanced)) if advanced > 0 => {
                    debug!(generation = self.generation, advanced, "read receipts applied")
                }
                Ok(Some(_)) => {}
                Ok(None) => return false,
                Err(err) => warn!(error = %err, "failed applying read receipts"),
            }
        }

        if let Some(cursor) = batch.next_cursor {
            match self.store.set_sync_token_for(&self.cancel, Some(cursor)) {
                Ok(true) => self.events.emit(SyncEvent::CursorAdvanced {
                    generation: self.generation,
                }),
                Ok(false) => return false,
                Err(err) => warn!(error = %err, "failed recording sync cursor"),
            }
        }
        true
    }

    fn after_merge(&self, reports: Vec<IngestReport>) {
        let mut unresolved = BTreeSet::new();
        for report in reports {
            if report.outcome.changed() {
                self.events.emit(SyncEvent::BatchMerged {
                    generation: self.generation,
                    conversation_id: report.conversation_id,
                    changes: report.outcome.inserted
                        + report.outcome.updated
                        + report.outcome.edited
                        + report.outcome.removed,
                });
            }
            unresolved.extend(report.unresolved_senders);
        }
        if !unresolved.is_empty() {
            self.spawn_identity_resolution(unresolved.into_iter().collect());
        }
    }

    /// Resolve placeholder authors without blocking the merge path.
    fn spawn_identity_resolution(&self, senders: Vec<String>) {
        let backend = self.backend.clone();
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let resolved = match backend.resolve_identities(&senders).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    debug!(senders = senders.len(), error = %err, "identity lookup failed");
                    return;
                }
            };
            if resolved.is_empty() {
                return;
            }
            match store.insert_identities_for(&cancel, resolved) {
                Ok(Some(patched)) => trace!(patched, "placeholder authors resolved"),
                Ok(None) => trace!("session retired; resolved identities dropped"),
                Err(err) => warn!(error = %err, "failed storing resolved identities"),
            }
        });
    }
}

async fn run_live_pump<B: MessagingBackend>(
    ctx: SessionContext<B>,
    mut batches: mpsc::Receiver<LiveBatch>,
) {
    loop {
        let batch = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => {
                    warn!(generation = ctx.generation, "live subscription ended");
                    break;
                }
            },
        };
        if !ctx.apply_live_batch(batch) {
            break;
        }
    }
    debug!(generation = ctx.generation, "live pump exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::BatchSender,
        store::StoreSnapshot,
        types::{Author, HistoryPage, ReadReceipt},
        unread::SelfIdentity,
    };
    use async_trait::async_trait;
    use std::{collections::HashMap, time::Duration};
    use tokio::{sync::Notify, time::timeout};

    const SELF: &str = "@me:x";

    #[derive(Default)]
    struct FakeBackend {
        history: Mutex<HashMap<String, Result<Vec<RawEvent>, SyncError>>>,
        gates: Mutex<HashMap<String, Arc<Notify>>>,
        fetch_started: Notify,
        fetch_calls: Mutex<Vec<String>>,
        live_requests: Mutex<Vec<LiveSyncRequest>>,
        live_senders: Mutex<Vec<BatchSender>>,
        fail_live: Mutex<bool>,
        receipts: Mutex<Vec<(String, String)>>,
        receipt_sent: Notify,
        identities: Mutex<HashMap<String, Author>>,
        on_fetch: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl FakeBackend {
        fn with_history(self, conversation: &str, events: Vec<RawEvent>) -> Self {
            self.history
                .lock()
                .expect("history")
                .insert(conversation.to_owned(), Ok(events));
            self
        }

        fn with_failing_history(self, conversation: &str) -> Self {
            self.history.lock().expect("history").insert(
                conversation.to_owned(),
                Err(SyncError::new(SyncErrorCategory::Network, "fetch_failed", "boom")),
            );
            self
        }

        fn with_gate(self, conversation: &str) -> (Self, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            self.gates
                .lock()
                .expect("gates")
                .insert(conversation.to_owned(), gate.clone());
            (self, gate)
        }

        fn sender(&self, index: usize) -> BatchSender {
            self.live_senders.lock().expect("senders")[index].clone()
        }
    }

    #[async_trait]
    impl MessagingBackend for FakeBackend {
        async fn fetch_historical_events(
            &self,
            _credentials: &Credentials,
            conversation_id: &str,
            limit: u16,
        ) -> Result<HistoryPage, SyncError> {
            self.fetch_calls
                .lock()
                .expect("calls")
                .push(conversation_id.to_owned());
            self.fetch_started.notify_one();

            let gate = self.gates.lock().expect("gates").get(conversation_id).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            // Runs after the response is in; the fetch finishes regardless.
            let hook = self.on_fetch.lock().expect("hook").take();
            if let Some(hook) = hook {
                hook();
            }

            let result = self
                .history
                .lock()
                .expect("history")
                .get(conversation_id)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()));
            result.map(|mut events| {
                events.truncate(usize::from(limit));
                HistoryPage {
                    events,
                    pagination_token: Some(format!("t-{conversation_id}")),
                }
            })
        }

        async fn start_live_sync(
            &self,
            _credentials: &Credentials,
            request: LiveSyncRequest,
            batches: BatchSender,
        ) -> Result<LiveSubscription, SyncError> {
            if *self.fail_live.lock().expect("flag") {
                return Err(SyncError::new(
                    SyncErrorCategory::Auth,
                    "unknown_token",
                    "token rejected",
                ));
            }
            self.live_requests.lock().expect("requests").push(request);
            self.live_senders.lock().expect("senders").push(batches);
            Ok(LiveSubscription::spawn(|stop| async move {
                stop.cancelled().await;
            }))
        }

        async fn send_read_receipt(
            &self,
            conversation_id: &str,
            event_id: &str,
        ) -> Result<(), SyncError> {
            self.receipts
                .lock()
                .expect("receipts")
                .push((conversation_id.to_owned(), event_id.to_owned()));
            self.receipt_sent.notify_one();
            Ok(())
        }

        async fn resolve_identities(
            &self,
            senders: &[String],
        ) -> Result<Vec<(String, Author)>, SyncError> {
            let identities = self.identities.lock().expect("identities");
            Ok(senders
                .iter()
                .filter_map(|sender| {
                    identities
                        .get(sender)
                        .map(|author| (sender.clone(), author.clone()))
                })
                .collect())
        }
    }

    fn manager(backend: FakeBackend) -> (SyncSessionManager<FakeBackend>, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let config = SyncConfig::default();
        let store = ChatStore::new(&config, SelfIdentity::user_id(SELF));
        (
            SyncSessionManager::new(backend.clone(), store, &config),
            backend,
        )
    }

    fn credentials() -> Credentials {
        Credentials::new(SELF, "token")
    }

    fn conversations(ids: &[&str]) -> BTreeSet<ConversationId> {
        ids.iter().map(|id| (*id).to_owned()).collect()
    }

    fn live(events: Vec<RawEvent>) -> LiveBatch {
        LiveBatch {
            events,
            ..LiveBatch::default()
        }
    }

    async fn wait_for(
        store: &ChatStore,
        predicate: impl Fn(&StoreSnapshot) -> bool,
    ) -> Arc<StoreSnapshot> {
        let mut rx = store.subscribe();
        timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if predicate(&snapshot) {
                    return snapshot;
                }
                rx.changed().await.expect("store alive");
            }
        })
        .await
        .expect("condition not reached in time")
    }

    fn ids(snapshot: &StoreSnapshot, conversation: &str) -> Vec<String> {
        snapshot
            .messages(conversation)
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    #[tokio::test]
    async fn backfill_then_live_without_overlap() {
        let (manager, backend) = manager(FakeBackend::default().with_history(
            "!c:x",
            vec![
                RawEvent::text("!c:x", "a", "@bob:x", 1, "one"),
                RawEvent::text("!c:x", "b", "@bob:x", 2, "two"),
                RawEvent::text("!c:x", "c", "@bob:x", 3, "three"),
            ],
        ));

        let outcome = manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");
        assert!(matches!(outcome, SessionOutcome::Live { .. }));
        assert_eq!(manager.current_phase(), Some(SessionPhase::Live));

        backend
            .sender(0)
            .send(live(vec![RawEvent::text("!c:x", "d", "@bob:x", 4, "four")]))
            .await
            .expect("batch delivered");

        let snapshot = wait_for(manager.store(), |s| s.messages("!c:x").len() == 4).await;
        assert_eq!(ids(&snapshot, "!c:x"), vec!["a", "b", "c", "d"]);
        assert_eq!(snapshot.unread("!c:x"), 4);
        assert_eq!(
            snapshot.room_data["!c:x"].last_event_id.as_deref(),
            Some("c")
        );
    }

    #[tokio::test]
    async fn redelivered_live_message_is_stored_once() {
        let (manager, backend) = manager(FakeBackend::default());
        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");

        let sender = backend.sender(0);
        for _ in 0..2 {
            sender
                .send(live(vec![RawEvent::text("!c:x", "d", "@bob:x", 4, "four")]))
                .await
                .expect("batch delivered");
        }
        sender
            .send(live(vec![RawEvent::text("!c:x", "e", "@bob:x", 5, "five")]))
            .await
            .expect("batch delivered");

        let snapshot = wait_for(manager.store(), |s| s.messages("!c:x").len() == 2).await;
        assert_eq!(ids(&snapshot, "!c:x"), vec!["d", "e"]);
    }

    #[tokio::test]
    async fn newer_session_discards_pending_backfill() {
        let (backend, gate) = FakeBackend::default()
            .with_history("!a:x", vec![RawEvent::text("!a:x", "a1", "@bob:x", 1, "old")])
            .with_history("!b:x", vec![RawEvent::text("!b:x", "b1", "@bob:x", 2, "new")])
            .with_history("!c:x", vec![RawEvent::text("!c:x", "c1", "@bob:x", 1, "old")])
            .with_gate("!a:x");
        let (manager, backend) = manager(backend);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .start_sync(credentials(), conversations(&["!a:x", "!c:x"]))
                    .await
            })
        };
        timeout(Duration::from_secs(2), backend.fetch_started.notified())
            .await
            .expect("first backfill started");

        let second = manager
            .start_sync(credentials(), conversations(&["!b:x"]))
            .await
            .expect("second session starts");
        // The first session's history now shows up late.
        gate.notify_one();
        let first = first.await.expect("join").expect("first session result");

        assert!(matches!(first, SessionOutcome::Superseded { .. }));
        assert!(matches!(second, SessionOutcome::Live { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = wait_for(manager.store(), |s| !s.messages("!b:x").is_empty()).await;
        assert!(snapshot.messages("!a:x").is_empty());
        assert!(snapshot.messages("!c:x").is_empty());
        assert!(!snapshot.room_data.contains_key("!a:x"));
        assert_eq!(
            backend.fetch_calls.lock().expect("calls").clone(),
            vec!["!a:x".to_owned(), "!b:x".to_owned()]
        );

        let requests = backend.live_requests.lock().expect("requests").clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].conversation_ids, conversations(&["!b:x"]));
    }

    #[tokio::test]
    async fn backfill_result_arriving_after_teardown_is_discarded() {
        let (manager, backend) = manager(
            FakeBackend::default()
                .with_history("!a:x", vec![RawEvent::text("!a:x", "a1", "@bob:x", 1, "old")])
                .with_history("!c:x", vec![RawEvent::text("!c:x", "c1", "@bob:x", 1, "old")]),
        );
        let teardown = manager.clone();
        *backend.on_fetch.lock().expect("hook") = Some(Box::new(move || teardown.stop()));

        let outcome = manager
            .start_sync(credentials(), conversations(&["!a:x", "!c:x"]))
            .await
            .expect("superseded is not an error");
        assert!(matches!(outcome, SessionOutcome::Superseded { .. }));

        let snapshot = manager.store().snapshot();
        assert!(snapshot.messages("!a:x").is_empty());
        assert!(snapshot.room_data.is_empty());
        assert_eq!(
            backend.fetch_calls.lock().expect("calls").clone(),
            vec!["!a:x".to_owned()]
        );
        assert!(backend.live_requests.lock().expect("requests").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_batch_racing_stop_never_lands_after_stop_returns() {
        let (manager, backend) = manager(FakeBackend::default());
        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");

        // Park the pump right before its store write.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let store = manager.store().clone();
            std::thread::spawn(move || {
                store.fence(|| {
                    locked_tx.send(()).expect("lock held");
                    let _ = release_rx.recv();
                })
            })
        };
        locked_rx.recv().expect("holder running");

        backend
            .sender(0)
            .send(LiveBatch {
                events: vec![RawEvent::text("!c:x", "stale", "@bob:x", 1, "")],
                receipts: Vec::new(),
                next_cursor: Some("OLD".into()),
            })
            .await
            .expect("batch delivered");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopper = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                manager.stop();
                manager.store().snapshot()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx.send(()).expect("release");
        holder.join().expect("holder thread");
        let at_stop = stopper.join().expect("stopper thread");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*manager.store().snapshot(), *at_stop);
        if at_stop.sync_token.is_some() {
            assert_eq!(ids(&at_stop, "!c:x"), vec!["stale"]);
        }
    }

    #[tokio::test]
    async fn superseded_live_subscription_is_ignored() {
        let (manager, backend) = manager(FakeBackend::default());
        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("first session");
        let stale = backend.sender(0);

        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("second session");
        timeout(Duration::from_secs(2), async {
            while !stale.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stale pump stopped");

        backend
            .sender(1)
            .send(live(vec![RawEvent::text("!c:x", "fresh", "@bob:x", 9, "")]))
            .await
            .expect("current batch");
        let snapshot = wait_for(manager.store(), |s| !s.messages("!c:x").is_empty()).await;
        assert_eq!(ids(&snapshot, "!c:x"), vec!["fresh"]);
    }

    #[tokio::test]
    async fn backfill_failure_skips_only_that_conversation() {
        let (manager, _backend) = manager(
            FakeBackend::default()
                .with_failing_history("!a:x")
                .with_history("!b:x", vec![RawEvent::text("!b:x", "b1", "@bob:x", 1, "ok")]),
        );
        let mut events = manager.subscribe_events();

        let outcome = manager
            .start_sync(credentials(), conversations(&["!a:x", "!b:x"]))
            .await
            .expect("session still starts");
        assert!(matches!(outcome, SessionOutcome::Live { .. }));

        let snapshot = manager.store().snapshot();
        assert_eq!(ids(&snapshot, "!b:x"), vec!["b1"]);
        assert!(snapshot.messages("!a:x").is_empty());

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::BackfillFailed {
                conversation_id,
                code,
                ..
            } = event
            {
                assert_eq!(conversation_id, "!a:x");
                assert_eq!(code, "fetch_failed");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn live_start_failure_is_returned() {
        let backend = FakeBackend::default();
        *backend.fail_live.lock().expect("flag") = true;
        let (manager, _backend) = manager(backend);

        let err = manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect_err("live start failure propagates");
        assert_eq!(err.code, "unknown_token");
        assert_eq!(manager.current_phase(), Some(SessionPhase::Failed));
    }

    #[tokio::test]
    async fn stored_cursor_skips_backfill_and_resumes_live() {
        let (manager, backend) = manager(
            FakeBackend::default()
                .with_history("!c:x", vec![RawEvent::text("!c:x", "a", "@bob:x", 1, "")]),
        );
        manager
            .store()
            .set_sync_token(Some("s42".into()))
            .expect("token");

        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");

        assert!(backend.fetch_calls.lock().expect("calls").is_empty());
        let requests = backend.live_requests.lock().expect("requests").clone();
        assert_eq!(requests[0].since.as_deref(), Some("s42"));
    }

    #[tokio::test]
    async fn live_cursor_and_receipts_are_recorded() {
        let (manager, backend) = manager(FakeBackend::default().with_history(
            "!c:x",
            vec![
                RawEvent::text("!c:x", "a", "@bob:x", 1, ""),
                RawEvent::text("!c:x", "b", "@bob:x", 2, ""),
            ],
        ));
        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");

        backend
            .sender(0)
            .send(LiveBatch {
                events: Vec::new(),
                receipts: vec![ReadReceipt {
                    conversation_id: "!c:x".into(),
                    event_id: "a".into(),
                    user_id: SELF.into(),
                    timestamp_ms: 100,
                }],
                next_cursor: Some("s2".into()),
            })
            .await
            .expect("batch delivered");

        let snapshot = wait_for(manager.store(), |s| s.sync_token.is_some()).await;
        assert_eq!(snapshot.sync_token.as_deref(), Some("s2"));
        assert_eq!(snapshot.last_read_timestamps.get("!c:x"), Some(&1));
        assert_eq!(snapshot.unread("!c:x"), 1);
    }

    #[tokio::test]
    async fn mark_read_updates_unread_and_sends_receipt() {
        let history = (1..=5)
            .map(|ts| RawEvent::text("!c:x", format!("$m{ts}"), "@bob:x", ts, ""))
            .collect();
        let (manager, backend) = manager(FakeBackend::default().with_history("!c:x", history));
        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");
        assert_eq!(manager.store().snapshot().unread("!c:x"), 5);

        let watermark = manager.mark_read("!c:x", "$m3").expect("mark read");
        assert_eq!(watermark, 3);
        assert_eq!(manager.store().snapshot().unread("!c:x"), 2);

        timeout(Duration::from_secs(2), backend.receipt_sent.notified())
            .await
            .expect("receipt sent");
        assert_eq!(
            backend.receipts.lock().expect("receipts").clone(),
            vec![("!c:x".to_owned(), "$m3".to_owned())]
        );
    }

    #[tokio::test]
    async fn placeholder_authors_are_resolved_in_background() {
        let backend = FakeBackend::default()
            .with_history("!c:x", vec![RawEvent::text("!c:x", "a", "@bob:x", 1, "")]);
        backend
            .identities
            .lock()
            .expect("identities")
            .insert("@bob:x".into(), Author::resolved("Bob"));
        let (manager, _backend) = manager(backend);

        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");

        let snapshot = wait_for(manager.store(), |s| {
            s.messages("!c:x").first().is_some_and(|m| m.author.resolved)
        })
        .await;
        assert_eq!(snapshot.messages("!c:x")[0].author.name, "Bob");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ends_live_delivery() {
        let (manager, backend) = manager(FakeBackend::default());
        manager.stop();

        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");
        let generation = manager.current_generation();

        manager.stop();
        manager.stop();
        assert_eq!(manager.current_phase(), None);
        assert!(manager.current_generation() > generation);

        let sender = backend.sender(0);
        timeout(Duration::from_secs(2), async {
            while !sender.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pump stopped");
        assert!(manager.store().snapshot().messages("!c:x").is_empty());
    }

    #[tokio::test]
    async fn dropping_the_manager_stops_the_session() {
        let (manager, backend) = manager(FakeBackend::default());
        manager
            .start_sync(credentials(), conversations(&["!c:x"]))
            .await
            .expect("session starts");
        let sender = backend.sender(0);

        drop(manager);
        timeout(Duration::from_secs(2), async {
            while !sender.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("pump stopped after drop");
    }
}
