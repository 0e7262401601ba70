use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "fieldbook")]
#[command(about = "Offline-first field records with queued sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the JSON config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Treat the device as offline; writes are queued but nothing is pushed
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, update or delete records
    #[command(subcommand)]
    Record(RecordCommand),
    /// Push queued writes now
    Sync,
    /// Show sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve sync conflicts
    #[command(subcommand)]
    Conflicts(ConflictsCommand),
    /// Show recent sync cycles
    History {
        /// Number of records to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Pull the server's history first
        #[arg(long)]
        refresh: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the facility activity log
    Activity {
        /// Facility to show (defaults to the configured one)
        #[arg(long)]
        facility: Option<String>,
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Pull the server's activity first
        #[arg(long)]
        refresh: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Preview the next registration ID
    NextId {
        /// Registration prefix (defaults to the configured one)
        #[arg(long)]
        prefix: Option<String>,
        /// Registration year (defaults to the current year)
        #[arg(long)]
        year: Option<i32>,
    },
}

#[derive(Subcommand)]
pub enum RecordCommand {
    /// Create a record with a fresh registration ID
    Create {
        /// Entity type, e.g. patient
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: String,
        #[command(flatten)]
        fields: FieldArgs,
        /// Registration year (defaults to the current year)
        #[arg(long)]
        year: Option<i32>,
    },
    /// Update fields of an existing record
    Update {
        /// Entity ID
        id: String,
        /// Entity type, e.g. patient
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: String,
        /// Remote `updated_at` (Unix ms) this edit is based on
        #[arg(long, value_name = "TIMESTAMP")]
        base: i64,
        #[command(flatten)]
        fields: FieldArgs,
    },
    /// Soft-delete a record
    Delete {
        /// Entity ID
        id: String,
        /// Entity type, e.g. patient
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: String,
        /// Remote `updated_at` (Unix ms) this delete is based on
        #[arg(long, value_name = "TIMESTAMP")]
        base: i64,
    },
}

#[derive(Args)]
pub struct FieldArgs {
    /// Field assignment; values parse as JSON, falling back to text
    #[arg(long = "field", value_name = "KEY=VALUE")]
    pub assignments: Vec<String>,
}

#[derive(Subcommand)]
pub enum ConflictsCommand {
    /// List conflicts
    List {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a conflict
    Resolve {
        /// Conflict ID
        id: String,
        /// Keep one side entirely
        #[arg(long, value_enum, conflicts_with = "merge", required_unless_present = "merge")]
        keep: Option<KeepSide>,
        /// Per-field choice, e.g. --merge name=local
        #[arg(long, value_name = "FIELD=SIDE")]
        merge: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Remote,
}
