//! Environment-backed runtime configuration for `chat-sync`.

use std::{
    env,
    error::Error,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use chat_core::{ConversationId, SyncConfig};
use url::Url;

const DEFAULT_DATA_DIR_ROOT: &str = "./.circles-chat-store";
const DEFAULT_BACKFILL_LIMIT: u16 = 50;
const DEFAULT_POLL_INTERVAL_MS: u64 = 4_000;

/// Runtime configuration used by the sync client.
#[derive(Clone, PartialEq)]
pub struct AppConfig {
    pub homeserver: Url,
    pub user: String,
    pub password: String,
    /// Tracked conversations; empty means every joined room.
    pub rooms: Vec<ConversationId>,
    pub notifications_room: Option<ConversationId>,
    pub data_dir_root: PathBuf,
    pub backfill_limit: u16,
    /// Optional per-conversation log cap; unset keeps every message.
    pub timeline_max_items: Option<usize>,
    pub poll_interval: Duration,
}

impl AppConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let homeserver_raw = required_trimmed_env("CIRCLES_HOMESERVER", &mut lookup)?;
        let homeserver =
            Url::parse(&homeserver_raw).map_err(|err| ConfigError::InvalidValue {
                key: "CIRCLES_HOMESERVER",
                value: homeserver_raw.clone(),
                reason: err.to_string(),
            })?;
        let user = required_trimmed_env("CIRCLES_USER", &mut lookup)?;
        let password = lookup("CIRCLES_PASSWORD")
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::Missing {
                key: "CIRCLES_PASSWORD",
            })?;

        let rooms = optional_trimmed_env("CIRCLES_ROOMS", &mut lookup)
            .map(|value| parse_room_list(&value))
            .unwrap_or_default();
        let notifications_room = optional_trimmed_env("CIRCLES_NOTIFICATIONS_ROOM", &mut lookup);
        let data_dir_root = optional_trimmed_env("CIRCLES_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR_ROOT));

        let backfill_limit = parse_optional_u16_with_default(
            "CIRCLES_BACKFILL_LIMIT",
            DEFAULT_BACKFILL_LIMIT,
            &mut lookup,
        )?;
        let timeline_max_items = parse_optional_usize("CIRCLES_TIMELINE_MAX_ITEMS", &mut lookup)?;
        let poll_interval_ms = parse_optional_u64_with_default(
            "CIRCLES_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
            &mut lookup,
        )?;

        if backfill_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CIRCLES_BACKFILL_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if timeline_max_items == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "CIRCLES_TIMELINE_MAX_ITEMS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            homeserver,
            user,
            password,
            rooms,
            notifications_room,
            data_dir_root,
            backfill_limit,
            timeline_max_items,
            poll_interval: Duration::from_millis(poll_interval_ms),
        })
    }

    /// Core tuning derived from this configuration.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            backfill_limit: self.backfill_limit,
            timeline_max_items: self.timeline_max_items,
            notifications_conversation_id: self.notifications_room.clone(),
            poll_interval: self.poll_interval,
            ..SyncConfig::default()
        }
    }

    /// Per-account directory; one account never sees another's state.
    pub fn account_dir(&self) -> PathBuf {
        account_dir_under(&self.data_dir_root, self.homeserver.as_str(), &self.user)
    }

    /// Matrix SDK store location.
    pub fn matrix_store_dir(&self) -> PathBuf {
        self.account_dir().join("matrix")
    }

    /// Chat store location, shared by all accounts.
    pub fn chat_store_root(&self) -> PathBuf {
        self.data_dir_root.join("chat")
    }

    /// Key prefix isolating this account inside the chat store.
    pub fn account_scope(&self) -> String {
        format!(
            "{}-{}",
            slugify_component(self.homeserver.as_str(), 64),
            slugify_component(&self.user, 64)
        )
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("homeserver", &self.homeserver.as_str())
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("rooms", &self.rooms)
            .field("notifications_room", &self.notifications_room)
            .field("data_dir_root", &self.data_dir_root)
            .field("backfill_limit", &self.backfill_limit)
            .field("timeline_max_items", &self.timeline_max_items)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or empty.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "missing required {key}"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn parse_room_list(value: &str) -> Vec<ConversationId> {
    let mut rooms: Vec<ConversationId> = value
        .split(',')
        .map(str::trim)
        .filter(|room| !room.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    rooms.sort();
    rooms.dedup();
    rooms
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<u16>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_usize<F>(key: &'static str, lookup: &mut F) -> Result<Option<usize>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<usize>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u16_with_default<F>(
    key: &'static str,
    default: u16,
    lookup: &mut F,
) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional_u16(key, lookup)?.unwrap_or(default))
}

fn parse_optional_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional_u64(key, lookup)?.unwrap_or(default))
}

fn account_dir_under(data_dir_root: &Path, homeserver: &str, user_id: &str) -> PathBuf {
    let homeserver_slug = slugify_component(homeserver, 64);
    let user_slug = slugify_component(user_id, 64);
    data_dir_root
        .join(format!("hs-{homeserver_slug}"))
        .join(format!("user-{user_slug}"))
}

/// Lowercase ASCII slug; runs of other characters collapse into one `_`.
fn slugify_component(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_len));
    let mut last_was_sep = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
        if out.len() >= max_len {
            break;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_owned()
    } else {
        trimmed.to_owned()
    }
}
