use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use chat_core::{
    Author, BatchSender, ConversationId, ConversationTimeline, Credentials, HistoryPage,
    LiveBatch, LiveSubscription, LiveSyncRequest, MessagingBackend, RawEvent, ReadReceipt,
    RetryPolicy, SyncError, SyncErrorCategory, classify_http_status,
};
use matrix_sdk::{
    Client, ClientBuildError, HttpError, Room,
    config::SyncSettings,
    deserialized_responses::TimelineEvent,
    room::MessagesOptions,
    ruma::{
        OwnedEventId, OwnedRoomId, OwnedUserId, UInt,
        api::client::{
            error::{ErrorKind, RetryAfter},
            receipt::create_receipt::v3::ReceiptType,
        },
        events::receipt::ReceiptThread,
    },
    sync::JoinedRoomUpdate,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const DEFAULT_DEVICE_DISPLAY_NAME: &str = "Circles Chat Sync";
const SERVER_PAGINATION_LIMIT_CAP: u16 = 100;
const LIVE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const RECEIPT_EVENT_TYPE: &str = "m.receipt";
const READ_RECEIPT_KEY: &str = "m.read";

#[derive(Debug, Clone)]
pub struct MatrixBackendConfig {
    pub homeserver: String,
    pub data_dir: PathBuf,
    pub store_passphrase: Option<String>,
}

impl MatrixBackendConfig {
    pub fn new(
        homeserver: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        store_passphrase: Option<String>,
    ) -> Self {
        Self {
            homeserver: homeserver.into(),
            data_dir: data_dir.into(),
            store_passphrase,
        }
    }
}

/// [`MessagingBackend`] over a logged-in Matrix client.
#[derive(Debug, Clone)]
pub struct MatrixMessagingBackend {
    client: Client,
    retry: RetryPolicy,
}

impl MatrixMessagingBackend {
    pub async fn new(config: MatrixBackendConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .homeserver_url(&config.homeserver)
            .sqlite_store(&config.data_dir, config.store_passphrase.as_deref())
            .build()
            .await
            .map_err(map_client_build_error)?;

        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Log in and return the credentials of the new session.
    pub async fn login_password(
        &self,
        user_id_or_localpart: &str,
        password: &str,
        device_display_name: Option<&str>,
    ) -> Result<Credentials, SyncError> {
        let response = self
            .client
            .matrix_auth()
            .login_username(user_id_or_localpart, password)
            .initial_device_display_name(
                device_display_name.unwrap_or(DEFAULT_DEVICE_DISPLAY_NAME),
            )
            .send()
            .await
            .map_err(map_matrix_error)?;

        info!(user_id = %response.user_id, device_id = %response.device_id, "logged in");
        Ok(Credentials::new(
            response.user_id.to_string(),
            response.access_token,
        ))
    }

    /// Joined rooms known to the local store, sorted.
    pub fn joined_room_ids(&self) -> Vec<ConversationId> {
        let mut rooms: Vec<ConversationId> = self
            .client
            .joined_rooms()
            .into_iter()
            .map(|room| room.room_id().to_string())
            .collect();
        rooms.sort();
        rooms
    }

    /// Joined rooms, running one initial sync when the local store knows none.
    pub async fn discover_joined_rooms(&self) -> Result<Vec<ConversationId>, SyncError> {
        if self.client.joined_rooms().is_empty() {
            debug!("no joined rooms cached; running initial sync");
            self.client
                .sync_once(SyncSettings::default().timeout(Duration::ZERO))
                .await
                .map_err(map_matrix_error)?;
        }
        Ok(self.joined_room_ids())
    }

    fn require_session(&self, credentials: &Credentials) -> Result<(), SyncError> {
        match self.client.user_id() {
            Some(user_id) if user_id.as_str() == credentials.user_id => Ok(()),
            Some(user_id) => Err(SyncError::new(
                SyncErrorCategory::Auth,
                "session_mismatch",
                format!(
                    "client is logged in as '{user_id}', not '{}'",
                    credentials.user_id
                ),
            )),
            None => Err(SyncError::new(
                SyncErrorCategory::Auth,
                "auth_required",
                "client is not logged in",
            )),
        }
    }

    fn lookup_room(&self, room_id: &str) -> Result<Room, SyncError> {
        let room_id = parse_room_id(room_id)?;
        self.client.get_room(&room_id).ok_or_else(|| {
            SyncError::new(
                SyncErrorCategory::Auth,
                "room_not_joined",
                format!("room not joined: {room_id}"),
            )
        })
    }
}

#[async_trait]
impl MessagingBackend for MatrixMessagingBackend {
    async fn fetch_historical_events(
        &self,
        credentials: &Credentials,
        conversation_id: &str,
        limit: u16,
    ) -> Result<HistoryPage, SyncError> {
        self.require_session(credentials)?;
        let room = self.lookup_room(conversation_id)?;
        let limit = ConversationTimeline::bounded_paginate_limit(limit, SERVER_PAGINATION_LIMIT_CAP);
        let messages = room
            .messages(messages_options(None, limit)?)
            .await
            .map_err(map_matrix_error)?;

        // Backward pagination returns newest first.
        let events: Vec<RawEvent> = messages
            .chunk
            .iter()
            .rev()
            .filter_map(|event| raw_event_from_timeline(conversation_id, event))
            .collect();
        trace!(%conversation_id, events = events.len(), "fetched room history");

        Ok(HistoryPage {
            events,
            pagination_token: messages.end,
        })
    }

    async fn start_live_sync(
        &self,
        credentials: &Credentials,
        request: LiveSyncRequest,
        batches: BatchSender,
    ) -> Result<LiveSubscription, SyncError> {
        self.require_session(credentials)?;
        let client = self.client.clone();
        let retry = self.retry;
        debug!(
            rooms = request.conversation_ids.len(),
            resumed = request.since.is_some(),
            "starting matrix sync loop"
        );
        Ok(LiveSubscription::spawn(move |stop| {
            run_sync_loop(client, request, batches, retry, stop)
        }))
    }

    async fn send_read_receipt(
        &self,
        conversation_id: &str,
        event_id: &str,
    ) -> Result<(), SyncError> {
        let room = self.lookup_room(conversation_id)?;
        let event_id = parse_event_id(event_id)?;
        room.send_single_receipt(ReceiptType::Read, ReceiptThread::Unthreaded, event_id)
            .await
            .map_err(map_matrix_error)
    }

    async fn resolve_identities(
        &self,
        senders: &[String],
    ) -> Result<Vec<(String, Author)>, SyncError> {
        let rooms = self.client.joined_rooms();
        let mut resolved = Vec::new();
        for sender in senders {
            let Ok(user_id) = parse_user_id(sender) else {
                continue;
            };
            for room in &rooms {
                match room.get_member_no_sync(&user_id).await {
                    Ok(Some(member)) => {
                        resolved.push((
                            sender.clone(),
                            Author {
                                name: member.name().to_owned(),
                                handle: Some(user_id.to_string()),
                                picture: member.avatar_url().map(ToString::to_string),
                                resolved: true,
                            },
                        ));
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(%sender, room_id = %room.room_id(), error = %err, "member lookup failed")
                    }
                }
            }
        }
        Ok(resolved)
    }
}

async fn run_sync_loop(
    client: Client,
    request: LiveSyncRequest,
    batches: BatchSender,
    retry: RetryPolicy,
    stop: CancellationToken,
) {
    let mut backoff = retry.backoff();
    let mut sync_settings = SyncSettings::default().timeout(LIVE_SYNC_TIMEOUT);
    if let Some(since) = request.since.as_deref() {
        sync_settings = sync_settings.token(since);
    }

    loop {
        let sync_result = tokio::select! {
            _ = stop.cancelled() => break,
            sync_result = client.sync_once(sync_settings.clone()) => sync_result,
        };

        match sync_result {
            Ok(response) => {
                backoff.reset();
                let mut batch = LiveBatch {
                    next_cursor: Some(response.next_batch.clone()),
                    ..LiveBatch::default()
                };
                for (room_id, update) in &response.rooms.joined {
                    if request.tracks(room_id.as_str()) {
                        collect_room_update(room_id.as_str(), update, &mut batch);
                    }
                }
                sync_settings = sync_settings.token(response.next_batch);

                trace!(
                    events = batch.events.len(),
                    receipts = batch.receipts.len(),
                    "sync batch ready"
                );
                if batches.send(batch).await.is_err() {
                    debug!("batch receiver dropped; stopping sync loop");
                    break;
                }
            }
            Err(err) => {
                let mapped = map_matrix_error(err);
                if !mapped.is_recoverable() {
                    error!(error = %mapped, "sync failed permanently");
                    break;
                }

                let delay = backoff.next_delay(mapped.retry_after_ms);
                warn!(
                    error = %mapped,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "sync failed; retrying"
                );
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!("matrix sync loop exited");
}

fn collect_room_update(room_id: &str, update: &JoinedRoomUpdate, batch: &mut LiveBatch) {
    batch.events.extend(
        update
            .timeline
            .events
            .iter()
            .filter_map(|event| raw_event_from_timeline(room_id, event)),
    );
    for raw in &update.ephemeral {
        match serde_json::from_str::<Value>(raw.json().get()) {
            Ok(event) => batch.receipts.extend(receipts_from_ephemeral(room_id, &event)),
            Err(err) => debug!(%room_id, error = %err, "skipping unreadable ephemeral event"),
        }
    }
}

fn raw_event_from_timeline(room_id: &str, event: &TimelineEvent) -> Option<RawEvent> {
    raw_event_from_json(room_id, event.raw().json().get())
}

fn raw_event_from_json(room_id: &str, json: &str) -> Option<RawEvent> {
    let envelope: Value = serde_json::from_str(json).ok()?;
    RawEvent::from_client_event(room_id, &envelope)
}

/// Unthreaded `m.read` receipts carried by an `m.receipt` ephemeral event.
fn receipts_from_ephemeral(room_id: &str, event: &Value) -> Vec<ReadReceipt> {
    if event.get("type").and_then(Value::as_str) != Some(RECEIPT_EVENT_TYPE) {
        return Vec::new();
    }
    let Some(content) = event.get("content").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut receipts = Vec::new();
    for (event_id, by_type) in content {
        let Some(readers) = by_type.get(READ_RECEIPT_KEY).and_then(Value::as_object) else {
            continue;
        };
        for (user_id, receipt) in readers {
            let threaded = receipt
                .get("thread_id")
                .and_then(Value::as_str)
                .is_some_and(|thread| thread != "main");
            if threaded {
                continue;
            }
            receipts.push(ReadReceipt {
                conversation_id: room_id.to_owned(),
                event_id: event_id.clone(),
                user_id: user_id.clone(),
                timestamp_ms: receipt.get("ts").and_then(Value::as_u64).unwrap_or(0),
            });
        }
    }
    receipts
}

fn parse_room_id(value: &str) -> Result<OwnedRoomId, SyncError> {
    value.parse::<OwnedRoomId>().map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_room_id",
            format!("invalid room id '{value}': {err}"),
        )
    })
}

fn parse_event_id(value: &str) -> Result<OwnedEventId, SyncError> {
    value.parse::<OwnedEventId>().map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_event_id",
            format!("invalid event id '{value}': {err}"),
        )
    })
}

fn parse_user_id(value: &str) -> Result<OwnedUserId, SyncError> {
    value.parse::<OwnedUserId>().map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_user_id",
            format!("invalid user id '{value}': {err}"),
        )
    })
}

fn messages_options(from_token: Option<&str>, limit: u16) -> Result<MessagesOptions, SyncError> {
    let mut options = MessagesOptions::backward();
    options.from = from_token.map(ToOwned::to_owned);
    options.limit = UInt::new(u64::from(limit)).ok_or_else(|| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_pagination_limit",
            format!("invalid pagination limit: {limit}"),
        )
    })?;
    Ok(options)
}

fn map_matrix_http_error(err: HttpError) -> SyncError {
    if let Some(client_err) = err.as_client_api_error() {
        let status = client_err.status_code.as_u16();
        let mut mapped = SyncError::new(
            classify_http_status(status),
            "matrix_http_error",
            client_err.to_string(),
        );

        if let Some(ErrorKind::LimitExceeded { retry_after }) = client_err.error_kind()
            && let Some(RetryAfter::Delay(delay)) = retry_after
        {
            mapped = mapped.with_retry_after(*delay);
        }

        mapped
    } else {
        SyncError::new(
            SyncErrorCategory::Network,
            "matrix_http_error",
            err.to_string(),
        )
    }
}

fn map_matrix_error(err: matrix_sdk::Error) -> SyncError {
    use matrix_sdk::Error;

    match err {
        Error::Http(http_err) => map_matrix_http_error(*http_err),
        Error::AuthenticationRequired => {
            SyncError::new(SyncErrorCategory::Auth, "auth_required", err.to_string())
        }
        Error::StateStore(_) | Error::EventCacheStore(_) | Error::Io(_) => {
            SyncError::new(SyncErrorCategory::Storage, "storage_error", err.to_string())
        }
        Error::SerdeJson(_) => SyncError::new(
            SyncErrorCategory::Serialization,
            "serde_json_error",
            err.to_string(),
        ),
        _ => SyncError::new(SyncErrorCategory::Internal, "matrix_error", err.to_string()),
    }
}

fn map_client_build_error(err: ClientBuildError) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Config,
        "client_build_error",
        err.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::env;

    #[test]
    fn rejects_invalid_room_id() {
        let err = parse_room_id("not-a-room").expect_err("invalid room id must fail");
        assert_eq!(err.code, "invalid_room_id");
    }

    #[test]
    fn rejects_invalid_event_id() {
        let err = parse_event_id("bad").expect_err("invalid event id must fail");
        assert_eq!(err.code, "invalid_event_id");
    }

    #[test]
    fn rejects_invalid_user_id() {
        let err = parse_user_id("alice").expect_err("invalid user id must fail");
        assert_eq!(err.code, "invalid_user_id");
    }

    #[test]
    fn history_options_paginate_backwards() {
        let options = messages_options(Some("t1"), 50).expect("valid options");
        assert_eq!(options.from.as_deref(), Some("t1"));
        assert_eq!(options.limit, UInt::from(50_u32));
    }

    #[test]
    fn timeline_json_becomes_raw_event() {
        let json = json!({
            "event_id": "$1",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_700_000_000_000_u64,
            "type": "m.room.message",
            "content": { "msgtype": "m.text", "body": "hi" }
        })
        .to_string();

        let event = raw_event_from_json("!room:example.org", &json).expect("parsed");
        assert_eq!(event.id, "$1");
        assert_eq!(event.conversation_id, "!room:example.org");
        assert_eq!(event.timestamp_ms, 1_700_000_000_000);
        assert!(!event.redacted);

        assert!(raw_event_from_json("!room:example.org", "{\"type\":\"m.room.message\"}").is_none());
    }

    #[test]
    fn extracts_unthreaded_read_receipts() {
        let event = json!({
            "type": "m.receipt",
            "content": {
                "$a": {
                    "m.read": {
                        "@me:example.org": { "ts": 10 },
                        "@bob:example.org": { "ts": 11, "thread_id": "$thread" }
                    }
                },
                "$b": {
                    "m.read.private": { "@me:example.org": { "ts": 12 } },
                    "m.read": { "@carol:example.org": { "ts": 13, "thread_id": "main" } }
                }
            }
        });

        let receipts = receipts_from_ephemeral("!r:example.org", &event);
        assert_eq!(
            receipts,
            vec![
                ReadReceipt {
                    conversation_id: "!r:example.org".into(),
                    event_id: "$a".into(),
                    user_id: "@me:example.org".into(),
                    timestamp_ms: 10,
                },
                ReadReceipt {
                    conversation_id: "!r:example.org".into(),
                    event_id: "$b".into(),
                    user_id: "@carol:example.org".into(),
                    timestamp_ms: 13,
                },
            ]
        );
    }

    #[test]
    fn ignores_non_receipt_ephemeral_events() {
        let typing = json!({ "type": "m.typing", "content": { "user_ids": ["@a:x"] } });
        assert!(receipts_from_ephemeral("!r:x", &typing).is_empty());
    }

    #[test]
    fn recoverable_errors_are_limited_to_network_and_rate_limit() {
        let network = SyncError::new(SyncErrorCategory::Network, "n", "network");
        let rate = SyncError::new(SyncErrorCategory::RateLimited, "r", "rate");
        let auth = SyncError::new(SyncErrorCategory::Auth, "a", "auth");

        assert!(network.is_recoverable());
        assert!(rate.is_recoverable());
        assert!(!auth.is_recoverable());
    }

    #[test]
    fn sync_loop_retry_hint_uses_error_retry_after() {
        let err = SyncError::new(SyncErrorCategory::RateLimited, "rate", "wait")
            .with_retry_after(Duration::from_secs(7));
        let mut backoff = RetryPolicy::default().backoff();
        assert_eq!(backoff.next_delay(err.retry_after_ms), Duration::from_secs(7));
    }

    #[tokio::test]
    #[ignore = "runs against live homeserver, requires env vars"]
    async fn live_login_backfill_and_sync_smoke() {
        let homeserver = env::var("CIRCLES_HOMESERVER").expect("CIRCLES_HOMESERVER must be set");
        let user = env::var("CIRCLES_USER").expect("CIRCLES_USER must be set");
        let password = env::var("CIRCLES_PASSWORD").expect("CIRCLES_PASSWORD must be set");

        let unique = format!(
            ".circles-live-test-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_secs()
        );
        let backend = MatrixMessagingBackend::new(MatrixBackendConfig::new(homeserver, unique, None))
            .await
            .expect("backend init");
        let credentials = backend
            .login_password(&user, &password, Some("Circles CI Smoke"))
            .await
            .expect("login");

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let subscription = backend
            .start_live_sync(&credentials, LiveSyncRequest::default(), tx)
            .await
            .expect("live sync starts");
        let batch = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("first sync within timeout")
            .expect("sync loop alive");
        assert!(batch.next_cursor.is_some());
        subscription.shutdown().await;

        if let Some(room_id) = backend.joined_room_ids().first() {
            backend
                .fetch_historical_events(&credentials, room_id, 20)
                .await
                .expect("history fetch");
        }
    }
}
