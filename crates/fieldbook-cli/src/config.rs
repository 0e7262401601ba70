//! CLI configuration file plus environment overrides.

use std::env;
use std::path::{Path, PathBuf};

use fieldbook_core::SyncConfig;

const CONFIG_FILE_NAME: &str = "config.json";

pub const API_BASE_URL_ENV: &str = "FIELDBOOK_API_BASE_URL";
pub const AUTH_TOKEN_ENV: &str = "FIELDBOOK_AUTH_TOKEN";
pub const USER_ID_ENV: &str = "FIELDBOOK_USER_ID";
pub const FACILITY_ID_ENV: &str = "FIELDBOOK_FACILITY_ID";

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fieldbook").join(CONFIG_FILE_NAME))
}

/// Values taken from the environment, applied over the file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub api_base_url: Option<String>,
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
    pub facility_id: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            api_base_url: env::var(API_BASE_URL_ENV).ok(),
            auth_token: env::var(AUTH_TOKEN_ENV).ok(),
            user_id: env::var(USER_ID_ENV).ok(),
            facility_id: env::var(FACILITY_ID_ENV).ok(),
        }
    }

    fn apply(self, config: &mut SyncConfig) {
        if let Some(url) = non_empty(self.api_base_url) {
            config.remote.base_url = Some(url);
        }
        if let Some(token) = non_empty(self.auth_token) {
            config.remote.auth_token = Some(token);
        }
        if let Some(user_id) = non_empty(self.user_id) {
            config.scope.user_id = user_id;
        }
        if let Some(facility_id) = non_empty(self.facility_id) {
            config.scope.facility_id = Some(facility_id);
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Read the config file (missing file means defaults) without validating.
pub fn load_from_path(path: &Path) -> Result<SyncConfig, String> {
    if !path.exists() {
        return Ok(SyncConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
    serde_json::from_str::<SyncConfig>(&raw)
        .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))
}

/// Load the file, apply environment overrides, then validate.
pub fn resolve_config(
    explicit_path: Option<&Path>,
    overrides: EnvOverrides,
) -> Result<SyncConfig, String> {
    let mut config = match explicit_path {
        Some(path) => load_from_path(path)?,
        None => match default_config_path() {
            Some(path) => load_from_path(&path)?,
            None => SyncConfig::default(),
        },
    };
    overrides.apply(&mut config);
    config.validate().map_err(|error| error.to_string())
}
