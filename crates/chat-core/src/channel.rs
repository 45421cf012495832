use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{state_machine::SessionPhase, types::ConversationId};

/// Broadcast stream of session notifications.
pub type SyncEventStream = broadcast::Receiver<SyncEvent>;

/// Notification emitted by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// Session lifecycle transition.
    PhaseChanged {
        generation: u64,
        phase: SessionPhase,
    },
    /// Historical fetch for one conversation failed and was skipped.
    BackfillFailed {
        generation: u64,
        conversation_id: ConversationId,
        code: String,
    },
    /// A batch changed a conversation log.
    BatchMerged {
        generation: u64,
        conversation_id: ConversationId,
        changes: usize,
    },
    /// The resumable sync cursor was persisted.
    CursorAdvanced { generation: u64 },
}

/// Fan-out bus for [`SyncEvent`]s.
#[derive(Clone, Debug)]
pub struct SyncEventBus {
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted events.
    pub fn subscribe(&self) -> SyncEventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = SyncEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let bus = SyncEventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(SyncEvent::CursorAdvanced { generation: 3 });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let bus = SyncEventBus::new(1);
        bus.emit_all([
            SyncEvent::CursorAdvanced { generation: 1 },
            SyncEvent::CursorAdvanced { generation: 2 },
        ]);
    }
}
