use fieldbook_core::{SyncState, SyncStatus};

use crate::commands::common::{format_sync_timestamp, open_session, CliContext};
use crate::error::CliError;

pub async fn run_status(context: &CliContext, as_json: bool) -> Result<(), CliError> {
    let session = open_session(context)?;
    let status = session.sync.status().await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let indicator = match status.indicator() {
        SyncState::Offline => "offline",
        SyncState::Syncing => "syncing",
        SyncState::Synced => "synced",
        SyncState::Error => "error",
    };

    let mut lines = vec![
        format!("State:     {indicator} ({})", status.phase.as_str()),
        format!("Pending:   {}", status.stats.pending),
        format!("Conflicts: {}", status.stats.conflicts_open),
        format!(
            "Totals:    {} synced, {} failed, {} spurious conflicts",
            status.stats.synced, status.stats.failed, status.stats.spurious_conflicts
        ),
    ];

    if status.retry.retry_count > 0 {
        lines.push(format!("Retries:   {}", status.retry.retry_count));
    }
    if let Some(error) = &status.retry.last_error {
        lines.push(format!("Error:     {error}"));
    }
    if let Some(at) = status.stats.last_synced_at {
        lines.push(format!("Last sync: {}", format_sync_timestamp(at)));
    }
    lines
}
