use crate::commands::common::{open_session, CliContext};
use crate::error::CliError;

/// Allocate and print the next registration ID.
///
/// The ID is recorded as issued, so a later `record create` gets the one after it.
pub async fn run_next_id(
    context: &CliContext,
    prefix: Option<&str>,
    year: Option<i32>,
) -> Result<(), CliError> {
    let prefix = prefix
        .map(|prefix| prefix.trim().to_ascii_uppercase())
        .filter(|prefix| !prefix.is_empty());
    let session = open_session(context)?;
    let registration_id = session
        .sync
        .allocate_registration_id(prefix.as_deref(), &[], year)
        .await?;
    println!("{registration_id}");
    Ok(())
}
