//! Runtime configuration for the sync core.
//!
//! A single `SyncConfig` carries the backoff tuning, retention limits,
//! registration-ID prefix, remote endpoint and the user/facility scope.
//! Every field has a default so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};

use crate::activity::DEFAULT_ACTIVITY_LIMIT;
use crate::error::{Error, Result};
use crate::history::DEFAULT_SYNC_HISTORY_LIMIT;
use crate::sync::BackoffConfig;
use crate::util::{has_http_scheme, trimmed_non_empty};

const DEFAULT_REGISTRATION_PREFIX: &str = "GHS";
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_USER_ID: &str = "local";

/// Facility used when the scope names none
pub const DEFAULT_FACILITY_ID: &str = "default";

/// Top-level sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub backoff: BackoffConfig,
    /// Activity entries kept locally per facility
    pub activity_limit: usize,
    /// Sync-history records kept locally
    pub history_limit: usize,
    pub registration_prefix: String,
    pub remote: RemoteConfig,
    pub scope: SyncScope,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            activity_limit: DEFAULT_ACTIVITY_LIMIT,
            history_limit: DEFAULT_SYNC_HISTORY_LIMIT,
            registration_prefix: DEFAULT_REGISTRATION_PREFIX.to_string(),
            remote: RemoteConfig::default(),
            scope: SyncScope::default(),
        }
    }
}

/// Where the authoritative store lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
        }
    }
}

/// User and facility the local caches are kept for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncScope {
    pub user_id: String,
    pub facility_id: Option<String>,
}

impl Default for SyncScope {
    fn default() -> Self {
        Self {
            user_id: DEFAULT_USER_ID.to_string(),
            facility_id: None,
        }
    }
}

impl SyncScope {
    pub fn new(user_id: impl Into<String>, facility_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            facility_id,
        }
    }

    /// Facility id, falling back to [`DEFAULT_FACILITY_ID`].
    pub fn facility(&self) -> &str {
        self.facility_id.as_deref().unwrap_or(DEFAULT_FACILITY_ID)
    }
}

impl SyncConfig {
    /// Normalize and check every field, returning the cleaned config.
    pub fn validate(mut self) -> Result<Self> {
        self.remote.base_url = match trimmed_non_empty(self.remote.base_url.take()) {
            Some(url) if has_http_scheme(&url) => Some(url.trim_end_matches('/').to_string()),
            Some(_) => {
                return Err(Error::InvalidInput(
                    "remote.base_url must include http:// or https://".to_string(),
                ))
            }
            None => None,
        };
        self.remote.auth_token = trimmed_non_empty(self.remote.auth_token.take());
        if self.remote.timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "remote.timeout_secs must be positive".to_string(),
            ));
        }

        let prefix = self.registration_prefix.trim();
        if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
            return Err(Error::InvalidInput(format!(
                "invalid registration_prefix '{}'",
                self.registration_prefix
            )));
        }
        self.registration_prefix = prefix.to_ascii_uppercase();

        if self.activity_limit == 0 || self.history_limit == 0 {
            return Err(Error::InvalidInput(
                "retention limits must be positive".to_string(),
            ));
        }

        let backoff = &self.backoff;
        if backoff.base_delay_ms == 0 || backoff.max_delay_ms < backoff.base_delay_ms {
            return Err(Error::InvalidInput(
                "backoff.max_delay_ms must be at least backoff.base_delay_ms (> 0)".to_string(),
            ));
        }
        if !backoff.backoff_multiplier.is_finite() || backoff.backoff_multiplier < 1.0 {
            return Err(Error::InvalidInput(
                "backoff.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        self.scope.user_id = trimmed_non_empty(Some(self.scope.user_id))
            .unwrap_or_else(|| DEFAULT_USER_ID.to_string());
        self.scope.facility_id = trimmed_non_empty(self.scope.facility_id.take());

        Ok(self)
    }
}

/// Parse and validate a JSON config payload.
pub fn parse_sync_config(payload: &str) -> Result<SyncConfig> {
    let config: SyncConfig = serde_json::from_str(payload)?;
    config.validate()
}
