//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::activity::RecordAction;
use super::mutation::Fields;

/// A unique identifier for a conflict record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// One field whose local and remote values disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub local_value: serde_json::Value,
    pub remote_value: serde_json::Value,
}

/// Which side wins a merged field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeSide {
    Local,
    Remote,
}

impl FromStr for MergeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("expected 'local' or 'remote', got '{other}'")),
        }
    }
}

/// How a caller wants a conflict settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "choices", rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Force local values and re-send them on top of the remote version
    KeepLocal,
    /// Drop the local write and adopt the remote copy
    KeepRemote,
    /// Pick a side for every diffed field
    Merge(BTreeMap<String, MergeSide>),
}

impl ResolutionPolicy {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::KeepLocal => "local",
            Self::KeepRemote => "remote",
            Self::Merge(_) => "merge",
        }
    }
}

/// Divergence between the local and remote copies of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub entity_id: String,
    pub entity_type: String,
    /// Operation of the rejected local write
    pub operation: RecordAction,
    pub local_version: Fields,
    pub remote_version: Fields,
    /// Timestamp the local write was based on (Unix ms)
    pub local_timestamp: Option<i64>,
    /// Remote `updated_at` at detection time (Unix ms)
    pub remote_timestamp: i64,
    /// Detection time (Unix ms)
    pub detected_at: i64,
    pub resolved: bool,
    pub diffs: Vec<FieldDiff>,
    /// Name of the policy that resolved this record
    #[serde(default)]
    pub resolution: Option<String>,
    /// Resolution time (Unix ms)
    #[serde(default)]
    pub resolved_at: Option<i64>,
}

impl ConflictRecord {
    /// Fields a merge must assign before the record can be resolved.
    pub fn diffed_fields(&self) -> impl Iterator<Item = &str> {
        self.diffs.iter().map(|diff| diff.field.as_str())
    }
}
