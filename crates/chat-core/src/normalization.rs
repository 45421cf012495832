use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::types::{Author, ConversationId, MESSAGE_KIND, NormalizedMessage, REDACTION_KIND, RawEvent};

const RELATES_TO: &str = "m.relates_to";
const NEW_CONTENT: &str = "m.new_content";
const REPLACE_REL: &str = "m.replace";

/// Sender identity to display info, shared across conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityCache {
    entries: HashMap<String, Author>,
}

impl IdentityCache {
    pub fn get(&self, sender: &str) -> Option<&Author> {
        self.entries.get(sender)
    }

    pub fn insert(&mut self, sender: impl Into<String>, author: Author) {
        self.entries.insert(sender.into(), author);
    }

    pub fn contains(&self, sender: &str) -> bool {
        self.entries.contains_key(sender)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Extend<(String, Author)> for IdentityCache {
    fn extend<T: IntoIterator<Item = (String, Author)>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}

/// Replacement content for an already-stored message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEdit {
    pub target_id: String,
    pub new_content: Value,
}

/// Normalized changes for one conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    /// Messages in arrival order.
    pub messages: Vec<NormalizedMessage>,
    pub edits: Vec<MessageEdit>,
    /// Ids removed from the log.
    pub redactions: Vec<String>,
    /// Senders that only got a placeholder author.
    pub unresolved_senders: BTreeSet<String>,
}

impl NormalizedBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.edits.is_empty() && self.redactions.is_empty()
    }
}

/// Map one raw event to a message, or `None` for non-displayable kinds.
///
/// Edits and redactions are not messages and also yield `None`; use
/// [`normalize_batch`] to keep them.
pub fn normalize_event(
    event: &RawEvent,
    identities: &IdentityCache,
    displayable_kinds: &[String],
) -> Option<NormalizedMessage> {
    if event.redacted || edit_target(event).is_some() {
        return None;
    }
    if !displayable_kinds.iter().any(|kind| kind == &event.kind) {
        return None;
    }

    let author = identities
        .get(&event.sender)
        .cloned()
        .unwrap_or_else(|| Author::placeholder(event.sender.clone()));

    Some(NormalizedMessage {
        id: event.id.clone(),
        conversation_id: event.conversation_id.clone(),
        created_by: event.sender.clone(),
        created_at: event.timestamp_ms,
        content: event.payload.clone(),
        kind: event.kind.clone(),
        author,
    })
}

/// Normalize a batch of raw events, grouped per conversation.
pub fn normalize_batch(
    events: &[RawEvent],
    identities: &IdentityCache,
    displayable_kinds: &[String],
) -> BTreeMap<ConversationId, NormalizedBatch> {
    let mut grouped: BTreeMap<ConversationId, NormalizedBatch> = BTreeMap::new();

    for event in events {
        let batch = grouped.entry(event.conversation_id.clone()).or_default();

        if event.redacted {
            batch.redactions.push(event.id.clone());
            continue;
        }
        if event.kind == REDACTION_KIND {
            if let Some(target) = &event.redacts {
                batch.redactions.push(target.clone());
            }
            continue;
        }
        if event.kind == MESSAGE_KIND
            && let Some(target_id) = edit_target(event)
        {
            batch.edits.push(MessageEdit {
                target_id: target_id.to_owned(),
                new_content: edited_content(&event.payload),
            });
            continue;
        }

        if let Some(message) = normalize_event(event, identities, displayable_kinds) {
            if !message.author.resolved {
                batch.unresolved_senders.insert(message.created_by.clone());
            }
            batch.messages.push(message);
        }
    }

    grouped.retain(|_, batch| !batch.is_empty());
    grouped
}

fn edit_target(event: &RawEvent) -> Option<&str> {
    let relates_to = event.payload.get(RELATES_TO)?;
    if relates_to.get("rel_type").and_then(Value::as_str) != Some(REPLACE_REL) {
        return None;
    }
    relates_to.get("event_id").and_then(Value::as_str)
}

fn edited_content(payload: &Value) -> Value {
    if let Some(new_content) = payload.get(NEW_CONTENT).filter(|value| value.is_object()) {
        return new_content.clone();
    }

    let mut content = payload.clone();
    if let Some(map) = content.as_object_mut() {
        map.remove(RELATES_TO);
    }
    content
}
