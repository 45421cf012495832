use std::time::Duration;

use chat_platform::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::SessionPhase;

/// Broad error category used for logging and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Invalid input, unknown conversation/event, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the messaging backend.
    RateLimited,
    /// Local durable storage failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload shared by the core and backend adapters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new sync error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-phase-transition error.
    pub fn invalid_state(current: SessionPhase, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in phase {current:?}"),
        )
    }

    /// Errors worth retrying after a backoff.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Network | SyncErrorCategory::RateLimited
        )
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::new(
            SyncErrorCategory::Internal,
            "poisoned_lock",
            format!("{what} lock poisoned"),
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        let code = match err {
            StoreError::NotFound => "store_not_found",
            StoreError::Unavailable(_) => "store_unavailable",
            StoreError::Backend(_) => "store_backend",
        };
        Self::new(SyncErrorCategory::Storage, code, err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(
            SyncErrorCategory::Serialization,
            "serialization_failed",
            err.to_string(),
        )
    }
}

/// Map HTTP status codes to sync error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        408 | 429 => SyncErrorCategory::RateLimited,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::Network,
        _ => SyncErrorCategory::Internal,
    }
}
