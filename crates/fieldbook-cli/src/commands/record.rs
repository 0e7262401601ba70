use fieldbook_core::models::{EntityMutation, Fields, RecordAction};
use fieldbook_core::registration::REGISTRATION_FIELD;
use serde_json::json;
use uuid::Uuid;

use crate::commands::common::{open_session, parse_fields, CliContext, CliSync};
use crate::error::CliError;

const DELETED_AT_FIELD: &str = "deleted_at";

pub async fn run_record_create(
    context: &CliContext,
    entity_type: &str,
    assignments: &[String],
    year: Option<i32>,
) -> Result<(), CliError> {
    let mut fields = parse_fields(assignments)?;
    if fields.contains_key(REGISTRATION_FIELD) {
        return Err(CliError::InvalidArgument(format!(
            "{REGISTRATION_FIELD} is assigned automatically"
        )));
    }

    let session = open_session(context)?;
    let registration_id = session
        .sync
        .allocate_registration_id(None, &[], year)
        .await?;
    fields.insert(
        REGISTRATION_FIELD.to_string(),
        json!(registration_id.to_string()),
    );

    let entity_id = Uuid::now_v7().to_string();
    let mutation = EntityMutation::create(entity_type, entity_id.clone(), fields);
    queue_with_activity(&session.sync, mutation, RecordAction::Create, None).await?;

    println!("{entity_id} {registration_id}");
    Ok(())
}

pub async fn run_record_update(
    context: &CliContext,
    entity_id: &str,
    entity_type: &str,
    base_updated_at: i64,
    assignments: &[String],
) -> Result<(), CliError> {
    let fields = parse_fields(assignments)?;
    if fields.is_empty() {
        return Err(CliError::InvalidArgument(
            "At least one --field is required".to_string(),
        ));
    }

    let session = open_session(context)?;
    let mutation = EntityMutation::update(entity_type, entity_id, base_updated_at, fields);
    queue_with_activity(&session.sync, mutation, RecordAction::Update, None).await?;

    println!("Queued update for {entity_id}");
    Ok(())
}

pub async fn run_record_delete(
    context: &CliContext,
    entity_id: &str,
    entity_type: &str,
    base_updated_at: i64,
) -> Result<(), CliError> {
    let mut fields = Fields::new();
    fields.insert(
        DELETED_AT_FIELD.to_string(),
        json!(chrono::Utc::now().timestamp_millis()),
    );
    let mutation = EntityMutation {
        operation: RecordAction::SoftDelete,
        ..EntityMutation::update(entity_type, entity_id, base_updated_at, fields)
    };

    let session = open_session(context)?;
    queue_with_activity(
        &session.sync,
        mutation,
        RecordAction::SoftDelete,
        Some("Record deleted"),
    )
    .await?;

    println!("Queued delete for {entity_id}");
    Ok(())
}

async fn queue_with_activity(
    sync: &CliSync,
    mutation: EntityMutation,
    action: RecordAction,
    description: Option<&str>,
) -> Result<(), CliError> {
    let mut entry = sync
        .activity_entry(action, &mutation.entity_type)
        .with_entity_id(mutation.entity_id.clone())
        .with_data(None, Some(json!(mutation.fields)));
    if let Some(description) = description {
        entry = entry.with_description(description);
    }

    let queued = sync.enqueue_entity(mutation).await?;
    tracing::debug!(mutation_id = %queued.id, action = %action, "Record write queued");
    sync.log_activity(entry).await?;
    Ok(())
}
