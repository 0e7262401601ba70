//! Fieldbook CLI - record field data offline and sync it when a connection is available.

mod cli;
mod commands;
mod config;
mod error;
mod remote;


use clap::Parser;

use crate::cli::{Cli, Commands, ConflictsCommand, RecordCommand};
use crate::commands::activity::run_activity;
use crate::commands::common::{resolve_db_path, CliContext};
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::history::run_history;
use crate::commands::next_id::run_next_id;
use crate::commands::record::{run_record_create, run_record_delete, run_record_update};
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::config::{resolve_config, EnvOverrides};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "fieldbook=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref(), EnvOverrides::from_env())
        .map_err(CliError::Config)?;
    let context = CliContext {
        db_path: resolve_db_path(cli.db_path),
        config,
        offline: cli.offline,
    };

    match cli.command {
        Commands::Record(RecordCommand::Create {
            entity_type,
            fields,
            year,
        }) => run_record_create(&context, &entity_type, &fields.assignments, year).await?,
        Commands::Record(RecordCommand::Update {
            id,
            entity_type,
            base,
            fields,
        }) => run_record_update(&context, &id, &entity_type, base, &fields.assignments).await?,
        Commands::Record(RecordCommand::Delete {
            id,
            entity_type,
            base,
        }) => run_record_delete(&context, &id, &entity_type, base).await?,
        Commands::Sync => run_sync(&context).await?,
        Commands::Status { json } => run_status(&context, json).await?,
        Commands::Conflicts(ConflictsCommand::List { all, json }) => {
            run_conflicts_list(&context, all, json).await?;
        }
        Commands::Conflicts(ConflictsCommand::Resolve { id, keep, merge }) => {
            run_conflicts_resolve(&context, &id, keep, &merge).await?;
        }
        Commands::History {
            limit,
            refresh,
            json,
        } => run_history(&context, limit, refresh, json).await?,
        Commands::Activity {
            facility,
            limit,
            refresh,
            json,
        } => run_activity(&context, facility.as_deref(), limit, refresh, json).await?,
        Commands::NextId { prefix, year } => {
            run_next_id(&context, prefix.as_deref(), year).await?;
        }
    }

    Ok(())
}
