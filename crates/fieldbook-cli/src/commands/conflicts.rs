use fieldbook_core::models::{ConflictId, ResolutionPolicy};

use crate::cli::KeepSide;
use crate::commands::common::{
    conflict_to_item, format_conflict_lines, open_session, parse_merge_choices, CliContext,
    ConflictItem,
};
use crate::error::CliError;

pub async fn run_conflicts_list(
    context: &CliContext,
    include_resolved: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let session = open_session(context)?;
    let conflicts = session.sync.conflicts(include_resolved).await;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn resolve_policy(keep: Option<KeepSide>, merge: &[String]) -> Result<ResolutionPolicy, CliError> {
    match keep {
        Some(KeepSide::Local) => Ok(ResolutionPolicy::KeepLocal),
        Some(KeepSide::Remote) => Ok(ResolutionPolicy::KeepRemote),
        None if merge.is_empty() => Err(CliError::InvalidArgument(
            "Pass --keep local|remote or at least one --merge field=side".to_string(),
        )),
        None => Ok(ResolutionPolicy::Merge(parse_merge_choices(merge)?)),
    }
}

pub async fn run_conflicts_resolve(
    context: &CliContext,
    id: &str,
    keep: Option<KeepSide>,
    merge: &[String],
) -> Result<(), CliError> {
    let conflict_id = id
        .trim()
        .parse::<ConflictId>()
        .map_err(|_| CliError::InvalidConflictId(id.to_string()))?;
    let policy = resolve_policy(keep, merge)?;

    let session = open_session(context)?;
    let resolution = session.sync.resolve_conflict(conflict_id, policy).await?;

    if resolution.requeue.is_some() {
        println!(
            "Resolved {} with '{}'; write queued for next sync",
            resolution.conflict_id, resolution.policy
        );
    } else {
        println!(
            "Resolved {} with '{}'; remote copy kept",
            resolution.conflict_id, resolution.policy
        );
    }
    Ok(())
}
