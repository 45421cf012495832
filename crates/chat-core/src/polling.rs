//! Cursor-polling backend.
//!
//! Adapts a [`PollSource`] that can only answer "messages after id X" into a
//! [`MessagingBackend`]. Every interval each tracked conversation is polled in
//! turn; the cursor of a conversation is the id of the last event delivered
//! for it. The cursor map travels as the batch's resumable cursor.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    backend::{BatchSender, LiveSubscription, LiveSyncRequest, MessagingBackend},
    error::{SyncError, SyncErrorCategory},
    retry::RetryPolicy,
    timeline::ConversationTimeline,
    types::{ConversationId, Credentials, HistoryPage, LiveBatch, RawEvent, SyncConfig},
};

const SERVER_POLL_LIMIT_CAP: u16 = 100;

/// Source of events addressed by "everything after this id".
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    /// Events of `conversation_id` after `since_id` (or the most recent ones
    /// when `None`), oldest first, at most `limit`.
    async fn fetch_since(
        &self,
        credentials: &Credentials,
        conversation_id: &str,
        since_id: Option<&str>,
        limit: u16,
    ) -> Result<Vec<RawEvent>, SyncError>;

    async fn mark_read(&self, conversation_id: &str, event_id: &str) -> Result<(), SyncError>;
}

/// [`MessagingBackend`] that polls a [`PollSource`] on a fixed interval.
pub struct PollingBackend<S: PollSource> {
    source: Arc<S>,
    interval: Duration,
    limit: u16,
    retry: RetryPolicy,
}

impl<S: PollSource> PollingBackend<S> {
    pub fn new(source: Arc<S>, config: &SyncConfig) -> Self {
        Self {
            source,
            interval: config.poll_interval,
            limit: ConversationTimeline::bounded_paginate_limit(
                config.backfill_limit,
                SERVER_POLL_LIMIT_CAP,
            ),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn decode_cursors(since: Option<&str>) -> BTreeMap<ConversationId, String> {
    let Some(since) = since else {
        return BTreeMap::new();
    };
    match serde_json::from_str(since) {
        Ok(cursors) => cursors,
        Err(err) => {
            warn!(error = %err, "ignoring unreadable poll cursor");
            BTreeMap::new()
        }
    }
}

#[async_trait]
impl<S: PollSource> MessagingBackend for PollingBackend<S> {
    async fn fetch_historical_events(
        &self,
        credentials: &Credentials,
        conversation_id: &str,
        limit: u16,
    ) -> Result<HistoryPage, SyncError> {
        let limit = ConversationTimeline::bounded_paginate_limit(limit, SERVER_POLL_LIMIT_CAP);
        let events = self
            .source
            .fetch_since(credentials, conversation_id, None, limit)
            .await?;
        Ok(HistoryPage {
            events,
            pagination_token: None,
        })
    }

    async fn start_live_sync(
        &self,
        credentials: &Credentials,
        request: LiveSyncRequest,
        batches: BatchSender,
    ) -> Result<LiveSubscription, SyncError> {
        if request.conversation_ids.is_empty() {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "no_conversations",
                "polling needs an explicit conversation list",
            ));
        }

        let poller = Poller {
            source: self.source.clone(),
            credentials: credentials.clone(),
            conversations: request.conversation_ids.into_iter().collect(),
            cursors: decode_cursors(request.since.as_deref()),
            interval: self.interval,
            limit: self.limit,
            retry: self.retry,
        };
        debug!(
            conversations = poller.conversations.len(),
            resumed = !poller.cursors.is_empty(),
            "starting poll loop"
        );
        Ok(LiveSubscription::spawn(|stop| poller.run(batches, stop)))
    }

    async fn send_read_receipt(
        &self,
        conversation_id: &str,
        event_id: &str,
    ) -> Result<(), SyncError> {
        self.source.mark_read(conversation_id, event_id).await
    }
}

struct Poller<S: PollSource> {
    source: Arc<S>,
    credentials: Credentials,
    conversations: Vec<ConversationId>,
    cursors: BTreeMap<ConversationId, String>,
    interval: Duration,
    limit: u16,
    retry: RetryPolicy,
}

impl<S: PollSource> Poller<S> {
    async fn run(mut self, batches: BatchSender, stop: CancellationToken) {
        let mut backoff = self.retry.backoff();
        loop {
            let round = tokio::select! {
                _ = stop.cancelled() => break,
                round = self.poll_round() => round,
            };

            let (batch, failure) = round;
            if let Some(batch) = batch
                && batches.send(batch).await.is_err()
            {
                debug!("batch receiver dropped; stopping poll loop");
                break;
            }

            let delay = match failure {
                Some(err) => {
                    let delay = backoff.next_delay(err.retry_after_ms);
                    warn!(
                        error = %err,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "poll failed; backing off"
                    );
                    delay
                }
                None => {
                    backoff.reset();
                    self.interval
                }
            };

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("poll loop exited");
    }

    /// Poll every conversation once. Returns the batch to deliver, if any,
    /// and the last recoverable failure of the round.
    async fn poll_round(&mut self) -> (Option<LiveBatch>, Option<SyncError>) {
        let mut events = Vec::new();
        let mut failure = None;
        let mut advanced = false;

        for conversation_id in &self.conversations {
            let since = self.cursors.get(conversation_id).map(String::as_str);
            match self
                .source
                .fetch_since(&self.credentials, conversation_id, since, self.limit)
                .await
            {
                Ok(fetched) => {
                    if let Some(last) = fetched.last() {
                        trace!(%conversation_id, count = fetched.len(), "polled new events");
                        self.cursors
                            .insert(conversation_id.clone(), last.id.clone());
                        advanced = true;
                    }
                    events.extend(fetched);
                }
                Err(err) if err.category == SyncErrorCategory::Auth => {
                    debug!(%conversation_id, error = %err, "no access to conversation; skipping");
                }
                Err(err) => failure = Some(err),
            }
        }

        if !advanced {
            return (None, failure);
        }
        let next_cursor = match serde_json::to_string(&self.cursors) {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                warn!(error = %err, "failed encoding poll cursor");
                None
            }
        };
        let batch = LiveBatch {
            events,
            receipts: Vec::new(),
            next_cursor,
        };
        (Some(batch), failure)
    }
}
