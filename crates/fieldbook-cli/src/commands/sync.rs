use fieldbook_core::CycleOutcome;

use crate::commands::common::{open_session, CliContext};
use crate::error::CliError;

pub async fn run_sync(context: &CliContext) -> Result<(), CliError> {
    let session = open_session(context)?;
    if !session.remote_configured {
        return Err(CliError::SyncNotConfigured);
    }

    let outcome = session.sync.sync_now().await;
    println!("{}", describe_outcome(&outcome));
    outcome.into_result()?;
    Ok(())
}

pub fn describe_outcome(outcome: &CycleOutcome) -> String {
    match outcome {
        CycleOutcome::Success { synced, conflicts } if *conflicts > 0 => format!(
            "Sync completed: {synced} pushed, {conflicts} conflict(s) need review (run `fieldbook conflicts list`)"
        ),
        CycleOutcome::Success { synced, .. } => format!("Sync completed: {synced} pushed"),
        CycleOutcome::PartialFailure {
            synced,
            failed,
            retry_count,
            next_retry_at,
        } => {
            let retry = next_retry_at.map_or_else(String::new, |at| {
                format!(", next retry at {}", at.format("%Y-%m-%d %H:%M:%S UTC"))
            });
            format!("Sync incomplete: {synced} pushed, {failed} pending (attempt {retry_count}{retry})")
        }
        CycleOutcome::Fatal(attempts) => format!(
            "Sync stopped after {attempts} failed attempts; run `fieldbook sync` again once the remote is reachable"
        ),
        CycleOutcome::Offline => "Offline: writes stay queued".to_string(),
        CycleOutcome::AlreadySyncing => "A sync is already running".to_string(),
    }
}
