use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] fieldbook_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid field assignment '{0}', expected key=value")]
    InvalidField(String),
    #[error("Invalid conflict ID: {0}")]
    InvalidConflictId(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Set remote.base_url in the config file or FIELDBOOK_API_BASE_URL."
    )]
    SyncNotConfigured,
}
