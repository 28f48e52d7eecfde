use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::experiment::ExperimentName;
use crate::domain::lifecycle::LifecycleState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationVersion {
    pub experiment: ExperimentName,
    pub version: u32,
    pub payload: Value,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub description: Option<String>,
    pub lifecycle_state: Option<LifecycleState>,
    pub is_rollback: bool,
    pub rolled_back_from: Option<u32>,
}

/// Optional details supplied alongside a new payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionRequest {
    pub actor: Option<String>,
    pub description: Option<String>,
    pub lifecycle_state: Option<LifecycleState>,
}

impl VersionRequest {
    pub fn by(actor: impl Into<String>) -> Self {
        Self { actor: Some(actor.into()), ..Self::default() }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_lifecycle_state(mut self, state: LifecycleState) -> Self {
        self.lifecycle_state = Some(state);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub kind: ChangeKind,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub experiment: ExperimentName,
    pub from_version: u32,
    pub to_version: u32,
    pub changes: Vec<DiffEntry>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        self.changes.iter().fold(DiffSummary::default(), |mut summary, entry| {
            match entry.kind {
                ChangeKind::Added => summary.added += 1,
                ChangeKind::Removed => summary.removed += 1,
                ChangeKind::Modified => summary.modified += 1,
            }
            summary
        })
    }
}
