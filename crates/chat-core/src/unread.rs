//! Unread-count derivation.
//!
//! Counts are a pure function of the message logs and the watermarks and are
//! never mutated directly.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{timeline::ConversationTimeline, types::ConversationId, types::NormalizedMessage};

/// Predicate deciding whether a sender identity is the local user.
#[derive(Clone)]
pub struct SelfIdentity(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl SelfIdentity {
    pub fn new(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Exact match against one backend user id.
    pub fn user_id(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self::new(move |sender| sender == user_id)
    }

    /// Nobody is self; every message counts.
    pub fn nobody() -> Self {
        Self::new(|_| false)
    }

    pub fn is_self(&self, sender: &str) -> bool {
        (self.0)(sender)
    }
}

impl fmt::Debug for SelfIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SelfIdentity(..)")
    }
}

/// Messages newer than `watermark` that count as unread.
pub fn unread_count(
    messages: &[NormalizedMessage],
    watermark: u64,
    is_notifications: bool,
    self_identity: &SelfIdentity,
) -> u64 {
    messages
        .iter()
        .filter(|message| message.created_at > watermark)
        .filter(|message| is_notifications || !self_identity.is_self(&message.created_by))
        .count() as u64
}

/// Recompute counts for every conversation that has both a log and a watermark.
pub fn compute_unread_counts<T>(
    logs: &BTreeMap<ConversationId, T>,
    watermarks: &BTreeMap<ConversationId, u64>,
    notifications_conversation_id: Option<&str>,
    self_identity: &SelfIdentity,
) -> BTreeMap<ConversationId, u64>
where
    T: AsRef<ConversationTimeline>,
{
    logs.iter()
        .filter_map(|(conversation_id, timeline)| {
            let watermark = *watermarks.get(conversation_id)?;
            let is_notifications = notifications_conversation_id == Some(conversation_id.as_str());
            let count = unread_count(
                timeline.as_ref().items(),
                watermark,
                is_notifications,
                self_identity,
            );
            Some((conversation_id.clone(), count))
        })
        .collect()
}

impl AsRef<ConversationTimeline> for ConversationTimeline {
    fn as_ref(&self) -> &ConversationTimeline {
        self
    }
}
