use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::experiment::ExperimentName;
use crate::domain::lifecycle::LifecycleState;

/// Metadata key a role-based gate reads the actor's role from.
pub const ROLE_METADATA_KEY: &str = "role";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalContext {
    pub experiment: ExperimentName,
    pub current_state: LifecycleState,
    pub target_state: LifecycleState,
    pub actor: Option<String>,
    pub reason: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ApprovalContext {
    pub fn new(
        experiment: impl Into<ExperimentName>,
        current_state: LifecycleState,
        target_state: LifecycleState,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            current_state,
            target_state,
            actor: None,
            reason: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn actor_role(&self) -> Option<&str> {
        self.metadata.get(ROLE_METADATA_KEY).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub gate: String,
    pub approved: bool,
    pub reason: Option<String>,
    pub approver: Option<String>,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ApprovalResult {
    pub fn approve(gate: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            approved: true,
            reason: Some(reason.into()),
            approver: None,
            decided_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn deny(gate: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { approved: false, ..Self::approve(gate, reason) }
    }

    pub fn with_approver(mut self, approver: impl Into<String>) -> Self {
        self.approver = Some(approver.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        !self.approved && self.metadata.get("status").is_some_and(|status| status == "pending")
    }
}

/// A human decision captured ahead of a manual gate evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualDecision {
    pub approved: bool,
    pub approver: String,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Append-only record of one gate verdict, as handed to the persistence backplane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub experiment: ExperimentName,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub actor: Option<String>,
    pub result: ApprovalResult,
}
