use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use fieldbook_core::db::SqliteStore;
use fieldbook_core::models::{
    ActivityLogEntry, ConflictRecord, Fields, MergeSide, SyncHistoryRecord,
};
use fieldbook_core::sync::{connectivity, ConnectivityHandle};
use fieldbook_core::{HttpRemote, RemoteCollaborator, SyncConfig, SyncOrchestrator};
use serde::Serialize;

use crate::error::CliError;
use crate::remote::UnconfiguredRemote;

pub type CliSync = SyncOrchestrator<dyn RemoteCollaborator>;

/// Everything a command needs before it opens the store
#[derive(Debug, Clone)]
pub struct CliContext {
    pub db_path: PathBuf,
    pub config: SyncConfig,
    pub offline: bool,
}

/// An opened sync core plus the connectivity it was started with
pub struct Session {
    pub sync: CliSync,
    pub remote_configured: bool,
    _network: ConnectivityHandle,
}

pub fn open_session(context: &CliContext) -> Result<Session, CliError> {
    let store = Arc::new(SqliteStore::open(&context.db_path)?);
    let http = HttpRemote::from_config(&context.config.remote)?;
    let remote_configured = http.is_some();
    let remote: Arc<dyn RemoteCollaborator> = match http {
        Some(http) => Arc::new(http),
        None => Arc::new(UnconfiguredRemote),
    };

    let online = remote_configured && !context.offline;
    let (network, signal) = connectivity(online);
    let sync = SyncOrchestrator::new(&context.config, store, remote, signal)?;
    tracing::debug!(db_path = %context.db_path.display(), online, "Opened sync core");

    Ok(Session {
        sync,
        remote_configured,
        _network: network,
    })
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("FIELDBOOK_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map_or_else(|| PathBuf::from("."), |dir| dir.join("fieldbook"))
        .join("fieldbook.db")
}

/// Parse `key=value`; the value is read as JSON when it parses, text otherwise.
pub fn parse_field_assignment(raw: &str) -> Result<(String, serde_json::Value), CliError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| CliError::InvalidField(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::InvalidField(raw.to_string()));
    }

    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn parse_fields(assignments: &[String]) -> Result<Fields, CliError> {
    let mut fields = Fields::new();
    for raw in assignments {
        let (key, value) = parse_field_assignment(raw)?;
        fields.insert(key, value);
    }
    Ok(fields)
}

/// Parse `field=local|remote` pairs for a merge resolution.
pub fn parse_merge_choices(pairs: &[String]) -> Result<BTreeMap<String, MergeSide>, CliError> {
    let mut choices = BTreeMap::new();
    for raw in pairs {
        let (field, side) = raw
            .split_once('=')
            .ok_or_else(|| CliError::InvalidArgument(format!("Invalid merge choice '{raw}'")))?;
        let side = side
            .parse::<MergeSide>()
            .map_err(|error| CliError::InvalidArgument(format!("{field}: {error}")))?;
        choices.insert(field.trim().to_string(), side);
    }
    Ok(choices)
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "(unset)".to_string(),
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub fields: Vec<String>,
    pub local_timestamp: Option<i64>,
    pub remote_timestamp: i64,
    pub detected_at_iso: String,
    pub resolved: bool,
    pub resolution: Option<String>,
}

pub fn conflict_to_item(record: &ConflictRecord) -> ConflictItem {
    ConflictItem {
        id: record.id.to_string(),
        entity_type: record.entity_type.clone(),
        entity_id: record.entity_id.clone(),
        operation: record.operation.to_string(),
        fields: record.diffed_fields().map(ToString::to_string).collect(),
        local_timestamp: record.local_timestamp,
        remote_timestamp: record.remote_timestamp,
        detected_at_iso: format_sync_timestamp(record.detected_at),
        resolved: record.resolved,
        resolution: record.resolution.clone(),
    }
}

pub fn format_conflict_lines(records: &[ConflictRecord]) -> Vec<String> {
    let mut lines = Vec::new();
    for record in records {
        let state = record
            .resolution
            .as_deref()
            .map_or_else(|| "open".to_string(), |policy| format!("resolved: {policy}"));
        lines.push(format!(
            "{}  {} {}  {}  [{}]",
            record.id,
            record.entity_type,
            record.entity_id,
            format_sync_timestamp(record.detected_at),
            state
        ));
        for diff in &record.diffs {
            lines.push(format!(
                "    {}: local={} remote={}",
                diff.field,
                format_value(&diff.local_value),
                format_value(&diff.remote_value)
            ));
        }
    }
    lines
}

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    pub id: String,
    pub status: String,
    pub synced_count: usize,
    pub failed_count: usize,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub started_at_iso: String,
    pub completed_at: Option<i64>,
}

pub fn history_to_item(record: &SyncHistoryRecord) -> HistoryItem {
    HistoryItem {
        id: record.id.to_string(),
        status: record.status.as_str().to_string(),
        synced_count: record.synced_count,
        failed_count: record.failed_count,
        error_message: record.error_message.clone(),
        started_at: record.started_at,
        started_at_iso: format_sync_timestamp(record.started_at),
        completed_at: record.completed_at,
    }
}

pub fn format_history_lines(records: &[SyncHistoryRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let mut line = format!(
                "{}  {:<7}  synced {}  failed {}",
                format_sync_timestamp(record.started_at),
                record.status.as_str(),
                record.synced_count,
                record.failed_count
            );
            if let Some(error) = &record.error_message {
                line.push_str("  ");
                line.push_str(error);
            }
            line
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ActivityItem {
    pub facility_id: String,
    pub user_id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub description: Option<String>,
    pub created_at: i64,
    pub relative_time: String,
}

pub fn activity_to_item(entry: &ActivityLogEntry, now_ms: i64) -> ActivityItem {
    ActivityItem {
        facility_id: entry.facility_id.clone(),
        user_id: entry.user_id.clone(),
        action: entry.action.to_string(),
        entity_type: entry.entity_type.clone(),
        entity_id: entry.entity_id.clone(),
        description: entry.description.clone(),
        created_at: entry.created_at,
        relative_time: format_relative_time(entry.created_at, now_ms),
    }
}

pub fn format_activity_lines(entries: &[ActivityLogEntry], now_ms: i64) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let target = entry.entity_id.as_deref().unwrap_or("-");
            let mut line = format!(
                "{:>8}  {:<16} {} {}  by {}",
                format_relative_time(entry.created_at, now_ms),
                entry.action.as_str(),
                entry.entity_type,
                target,
                entry.user_id
            );
            if let Some(description) = &entry.description {
                line.push_str("  ");
                line.push_str(description);
            }
            line
        })
        .collect()
}
