//! Contract with the external messaging backend.

use std::{collections::BTreeSet, future::Future};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::SyncError,
    types::{Author, ConversationId, Credentials, HistoryPage, LiveBatch},
};

/// Sender half handed to a live subscription.
pub type BatchSender = mpsc::Sender<LiveBatch>;

/// Parameters for starting a live subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSyncRequest {
    /// Conversations to deliver; empty means every conversation.
    pub conversation_ids: BTreeSet<ConversationId>,
    /// Resumable cursor from an earlier run.
    pub since: Option<String>,
}

impl LiveSyncRequest {
    pub fn tracks(&self, conversation_id: &str) -> bool {
        self.conversation_ids.is_empty() || self.conversation_ids.contains(conversation_id)
    }
}

/// Stop handle of a running live subscription.
///
/// Stopping cancels the subscription's token and aborts its task, so no
/// further batch is produced once `stop` returns. Dropping the handle stops
/// the subscription too.
#[derive(Debug)]
pub struct LiveSubscription {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LiveSubscription {
    /// Spawn `run` with a fresh stop token.
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(stop.child_token()));
        Self {
            stop,
            task: Some(task),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop without waiting; safe to call repeatedly.
    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Request a stop and wait for the loop to wind down on its own.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
pub trait MessagingBackend: Send + Sync + 'static {
    /// Fetch up to `limit` recent events of one conversation, oldest first.
    async fn fetch_historical_events(
        &self,
        credentials: &Credentials,
        conversation_id: &str,
        limit: u16,
    ) -> Result<HistoryPage, SyncError>;

    /// Start delivering live batches into `batches` until stopped.
    async fn start_live_sync(
        &self,
        credentials: &Credentials,
        request: LiveSyncRequest,
        batches: BatchSender,
    ) -> Result<LiveSubscription, SyncError>;

    /// Acknowledge that the local user read up to `event_id`.
    async fn send_read_receipt(
        &self,
        conversation_id: &str,
        event_id: &str,
    ) -> Result<(), SyncError>;

    /// Look up display info for senders. Unknown senders are omitted.
    async fn resolve_identities(
        &self,
        _senders: &[String],
    ) -> Result<Vec<(String, Author)>, SyncError> {
        Ok(Vec::new())
    }
}
