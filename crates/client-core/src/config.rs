//! Client configuration, with an environment-backed loader.

use std::{env, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 10_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 120_000;
const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_TIMELINE_MAX_ITEMS: usize = 1_000;
const DEFAULT_FILTER_PURPOSE: &str = "default";

/// Runtime configuration of one client instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// Fully qualified user id of the account, for example `@alice:example.org`.
    pub user_id: String,
    /// Guest sessions skip the sync bootstrap and may only send a few event types.
    pub is_guest: bool,
    /// Server-side wait bound of one `/sync` long-poll.
    pub sync_timeout_ms: u64,
    /// First backoff delay after a failed sync.
    pub retry_base_delay_ms: u64,
    /// Upper bound of the sync backoff delay.
    pub retry_max_delay_ms: u64,
    /// Fixed cadence of keepalive probes while waiting to retry.
    pub keepalive_interval_ms: u64,
    /// Timeline cap used by every room and thread timeline.
    pub timeline_max_items: usize,
    /// When `false`, thread events are kept in the room timeline only.
    pub thread_support: bool,
    /// Honour predecessor override state events when walking room upgrades.
    pub use_dynamic_predecessor: bool,
    /// Key under which the sync filter id is cached per user.
    pub filter_purpose: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            is_guest: false,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            timeline_max_items: DEFAULT_TIMELINE_MAX_ITEMS,
            thread_support: true,
            use_dynamic_predecessor: false,
            filter_purpose: DEFAULT_FILTER_PURPOSE.to_owned(),
        }
    }
}

impl ClientConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from `ROOMSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut vars = EnvReader { lookup };

        let config = Self {
            user_id: vars.text("ROOMSYNC_USER").unwrap_or_default(),
            is_guest: vars.flag("ROOMSYNC_GUEST", false)?,
            sync_timeout_ms: vars.parse_or("ROOMSYNC_SYNC_TIMEOUT_MS", DEFAULT_SYNC_TIMEOUT_MS)?,
            retry_base_delay_ms: vars
                .positive("ROOMSYNC_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?,
            retry_max_delay_ms: vars
                .parse_or("ROOMSYNC_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS)?,
            keepalive_interval_ms: vars
                .positive("ROOMSYNC_KEEPALIVE_INTERVAL_MS", DEFAULT_KEEPALIVE_INTERVAL_MS)?,
            timeline_max_items: vars
                .positive("ROOMSYNC_TIMELINE_MAX_ITEMS", DEFAULT_TIMELINE_MAX_ITEMS)?,
            thread_support: vars.flag("ROOMSYNC_THREAD_SUPPORT", true)?,
            use_dynamic_predecessor: vars.flag("ROOMSYNC_DYNAMIC_PREDECESSOR", false)?,
            filter_purpose: vars
                .text("ROOMSYNC_FILTER_PURPOSE")
                .unwrap_or_else(|| DEFAULT_FILTER_PURPOSE.to_owned()),
        };

        if config.retry_max_delay_ms < config.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "ROOMSYNC_RETRY_MAX_DELAY_MS",
                value: config.retry_max_delay_ms.to_string(),
                reason: "must not be below the base delay".to_owned(),
            });
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: FnMut(&str) -> Option<String>,
{
    /// Trimmed value; blank counts as unset.
    fn text(&mut self, key: &'static str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn parse_or<T>(&mut self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.text(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
                key,
                reason: err.to_string(),
                value,
            }),
        }
    }

    fn positive<T>(&mut self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialEq + Default + fmt::Display,
        T::Err: fmt::Display,
    {
        let value = self.parse_or(key, default)?;
        if value == T::default() {
            return Err(ConfigError::InvalidValue {
                key,
                value: value.to_string(),
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(value)
    }

    fn flag(&mut self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(value) = self.text(key) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key,
                value,
                reason: "expected a boolean".to_owned(),
            }),
        }
    }
}
