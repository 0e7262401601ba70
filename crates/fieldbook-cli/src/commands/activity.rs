use crate::commands::common::{
    activity_to_item, format_activity_lines, open_session, ActivityItem, CliContext,
};
use crate::error::CliError;

pub async fn run_activity(
    context: &CliContext,
    facility: Option<&str>,
    limit: usize,
    refresh: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let session = open_session(context)?;
    if refresh {
        if !session.remote_configured {
            return Err(CliError::SyncNotConfigured);
        }
        if let Err(error) = session.sync.refresh_activity(facility).await {
            tracing::warn!(error = %error, "Failed to refresh activity, showing local copy");
        }
    }

    let entries = session.sync.activity(facility, limit).await?;
    let now_ms = chrono::Utc::now().timestamp_millis();

    if as_json {
        let json_items = entries
            .iter()
            .map(|entry| activity_to_item(entry, now_ms))
            .collect::<Vec<ActivityItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No activity recorded.");
        return Ok(());
    }

    for line in format_activity_lines(&entries, now_ms) {
        println!("{line}");
    }
    Ok(())
}
