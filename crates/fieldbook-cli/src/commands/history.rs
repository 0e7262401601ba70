use crate::commands::common::{
    format_history_lines, history_to_item, open_session, CliContext, HistoryItem,
};
use crate::error::CliError;

pub async fn run_history(
    context: &CliContext,
    limit: usize,
    refresh: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let session = open_session(context)?;
    if refresh {
        if !session.remote_configured {
            return Err(CliError::SyncNotConfigured);
        }
        if let Err(error) = session.sync.refresh_history().await {
            tracing::warn!(error = %error, "Failed to refresh sync history, showing local copy");
        }
    }

    let records = session.sync.sync_history(limit).await;

    if as_json {
        let json_items = records
            .iter()
            .map(history_to_item)
            .collect::<Vec<HistoryItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No sync history yet.");
        return Ok(());
    }

    for line in format_history_lines(&records) {
        println!("{line}");
    }
    Ok(())
}
