use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::experiment::ExperimentName;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    PendingApproval,
    Approved,
    Running,
    Ramping,
    Paused,
    RolledBack,
    Archived,
    Rejected,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 9] = [
        Self::Draft,
        Self::PendingApproval,
        Self::Approved,
        Self::Running,
        Self::Ramping,
        Self::Paused,
        Self::RolledBack,
        Self::Archived,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Ramping => "ramping",
            Self::Paused => "paused",
            Self::RolledBack => "rolled_back",
            Self::Archived => "archived",
            Self::Rejected => "rejected",
        }
    }

    /// Archived is the only state with no way out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown lifecycle state `{0}`")]
pub struct UnknownLifecycleState(pub String);

impl FromStr for LifecycleState {
    type Err = UnknownLifecycleState;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key: String = value
            .trim()
            .chars()
            .filter(|ch| *ch != '_' && *ch != '-')
            .map(|ch| ch.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "draft" => Ok(Self::Draft),
            "pendingapproval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "running" => Ok(Self::Running),
            "ramping" => Ok(Self::Ramping),
            "paused" => Ok(Self::Paused),
            "rolledback" => Ok(Self::RolledBack),
            "archived" => Ok(Self::Archived),
            "rejected" => Ok(Self::Rejected),
            _ => Err(UnknownLifecycleState(value.to_owned())),
        }
    }
}

/// One committed edge in an experiment's history. Never mutated once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub experiment: ExperimentName,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub occurred_at: DateTime<Utc>,
    pub actor: Option<String>,
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Caller-supplied details for a transition request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub actor: Option<String>,
    pub reason: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl TransitionRequest {
    pub fn by(actor: impl Into<String>) -> Self {
        Self { actor: Some(actor.into()), ..Self::default() }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
