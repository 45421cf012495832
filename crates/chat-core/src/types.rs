use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier of one conversation (room).
pub type ConversationId = String;

/// Event kind of a displayable chat message.
pub const MESSAGE_KIND: &str = "m.room.message";
/// Event kind of a redaction.
pub const REDACTION_KIND: &str = "m.room.redaction";

const DEFAULT_BACKFILL_LIMIT: u16 = 50;
const DEFAULT_POLL_INTERVAL_MS: u64 = 4_000;

/// Access credentials for the messaging backend.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Backend identity of the local user, e.g. `@alice:example.org`.
    pub user_id: String,
    /// Bearer token for the backend.
    pub access_token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Externally-sourced event record, immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    /// Event identifier, unique within a conversation.
    pub id: String,
    pub conversation_id: ConversationId,
    /// Sender identity string.
    pub sender: String,
    /// Server-assigned timestamp in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    /// Event type discriminator, e.g. `m.room.message`.
    pub kind: String,
    /// Opaque event content.
    pub payload: Value,
    /// Set when the backend reports the event as redacted.
    #[serde(default)]
    pub redacted: bool,
    /// Target event of a redaction event.
    #[serde(default)]
    pub redacts: Option<String>,
}

impl RawEvent {
    /// Build a plain text message event.
    pub fn text(
        conversation_id: impl Into<ConversationId>,
        id: impl Into<String>,
        sender: impl Into<String>,
        timestamp_ms: u64,
        body: &str,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender: sender.into(),
            timestamp_ms,
            kind: MESSAGE_KIND.to_owned(),
            payload: serde_json::json!({ "msgtype": "m.text", "body": body }),
            redacted: false,
            redacts: None,
        }
    }

    /// Parse a client-event envelope (`event_id`, `sender`, `origin_server_ts`,
    /// `type`, `content`, `unsigned`, `redacts`).
    ///
    /// Returns `None` when any identifying field is missing.
    pub fn from_client_event(conversation_id: &str, envelope: &Value) -> Option<Self> {
        let id = envelope.get("event_id")?.as_str()?.to_owned();
        let sender = envelope.get("sender")?.as_str()?.to_owned();
        let kind = envelope.get("type")?.as_str()?.to_owned();
        let timestamp_ms = envelope
            .get("origin_server_ts")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let payload = envelope.get("content").cloned().unwrap_or(Value::Null);
        let redacted = envelope
            .get("unsigned")
            .and_then(|unsigned| unsigned.get("redacted_because"))
            .is_some_and(|because| !because.is_null());
        // Room v11 moved `redacts` into content.
        let redacts = envelope
            .get("redacts")
            .or_else(|| payload.get("redacts"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        Some(Self {
            id,
            conversation_id: conversation_id.to_owned(),
            sender,
            timestamp_ms,
            kind,
            payload,
            redacted,
            redacts,
        })
    }
}

/// Display information for a message author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    /// `false` for the fallback built from the raw sender string.
    #[serde(default)]
    pub resolved: bool,
}

impl Author {
    /// Fallback author carrying only the raw sender string.
    pub fn placeholder(sender: impl Into<String>) -> Self {
        Self {
            name: sender.into(),
            handle: None,
            picture: None,
            resolved: false,
        }
    }

    /// Author resolved from an identity lookup.
    pub fn resolved(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
            picture: None,
            resolved: true,
        }
    }
}

/// Canonical message shape stored in the message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub created_by: String,
    /// Milliseconds since Unix epoch.
    pub created_at: u64,
    pub content: Value,
    pub kind: String,
    pub author: Author,
}

impl NormalizedMessage {
    /// Text body of the content, when present.
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }
}

/// Read acknowledgement reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub event_id: String,
    pub user_id: String,
    pub timestamp_ms: u64,
}

/// One delivery from a live subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveBatch {
    /// Events for any number of conversations.
    pub events: Vec<RawEvent>,
    pub receipts: Vec<ReadReceipt>,
    /// Resumable cursor positioned after this batch.
    pub next_cursor: Option<String>,
}

/// One page of historical events, in chronological order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub events: Vec<RawEvent>,
    /// Opaque backend token for fetching the page before this one.
    pub pagination_token: Option<String>,
}

/// Per-conversation backend session state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomData {
    #[serde(default)]
    pub pagination_token: Option<String>,
    #[serde(default)]
    pub last_event_id: Option<String>,
}

/// Tuning values for the sync core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Historical events fetched per conversation during backfill.
    pub backfill_limit: u16,
    /// Optional per-conversation log cap; oldest messages are dropped first.
    /// `None` keeps every message until an explicit reset.
    pub timeline_max_items: Option<usize>,
    /// Conversation where self-authored messages also count as unread.
    pub notifications_conversation_id: Option<ConversationId>,
    /// Event kinds kept by the normalizer.
    pub displayable_kinds: Vec<String>,
    /// Interval used by polling backends.
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            timeline_max_items: None,
            notifications_conversation_id: None,
            displayable_kinds: vec![MESSAGE_KIND.to_owned()],
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_client_event_envelope() {
        let envelope = json!({
            "event_id": "$abc",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_731_000_000_u64,
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "hi" },
        });

        let event = RawEvent::from_client_event("!room:example.org", &envelope)
            .expect("envelope should parse");
        assert_eq!(event.id, "$abc");
        assert_eq!(event.conversation_id, "!room:example.org");
        assert_eq!(event.timestamp_ms, 1_731_000_000);
        assert_eq!(event.payload["body"], "hi");
        assert!(!event.redacted);
        assert_eq!(event.redacts, None);
    }

    #[test]
    fn detects_redaction_markers() {
        let redacted = json!({
            "event_id": "$gone",
            "sender": "@alice:example.org",
            "origin_server_ts": 5,
            "type": "m.room.message",
            "content": {},
            "unsigned": { "redacted_because": { "event_id": "$r" } },
        });
        let event = RawEvent::from_client_event("!r:x", &redacted).expect("parse");
        assert!(event.redacted);

        let redaction = json!({
            "event_id": "$r",
            "sender": "@alice:example.org",
            "origin_server_ts": 6,
            "type": "m.room.redaction",
            "content": { "redacts": "$gone" },
        });
        let event = RawEvent::from_client_event("!r:x", &redaction).expect("parse");
        assert_eq!(event.redacts.as_deref(), Some("$gone"));
    }

    #[test]
    fn rejects_envelope_without_event_id() {
        let envelope = json!({ "sender": "@a:x", "type": "m.room.message" });
        assert_eq!(RawEvent::from_client_event("!r:x", &envelope), None);
    }

    #[test]
    fn credentials_debug_hides_token() {
        let creds = Credentials::new("@alice:example.org", "syt_secret");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("@alice:example.org"));
        assert!(!rendered.contains("syt_secret"));
    }
}
