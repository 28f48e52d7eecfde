//! Contract for an external store that can act as the system of record for governance
//! data. The in-memory managers are authoritative when no backplane is attached.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approval::ApprovalRecord;
use crate::domain::experiment::ExperimentName;
use crate::domain::lifecycle::{LifecycleState, StateTransition};
use crate::domain::policy::PolicyEvaluationRecord;
use crate::errors::GovernanceError;

/// Persisted lifecycle state guarded by an opaque concurrency token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub state: LifecycleState,
    pub token: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackplaneError {
    #[error("stale concurrency token for `{experiment}`")]
    Conflict { experiment: ExperimentName },
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<BackplaneError> for GovernanceError {
    fn from(value: BackplaneError) -> Self {
        match value {
            BackplaneError::Conflict { experiment } => Self::ConcurrencyConflict { experiment },
            BackplaneError::Storage(message) => Self::Backplane(message),
        }
    }
}

#[async_trait]
pub trait GovernanceBackplane: Send + Sync {
    async fn load_state(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Option<PersistedState>, BackplaneError>;

    /// Saves `state` only if the stored token still equals `expected_token` (`None` means
    /// the experiment must not have a stored state yet). Returns the new token.
    async fn save_state(
        &self,
        experiment: &ExperimentName,
        state: LifecycleState,
        expected_token: Option<&str>,
    ) -> Result<String, BackplaneError>;

    async fn append_transition(&self, transition: &StateTransition)
        -> Result<(), BackplaneError>;

    async fn list_transitions(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<StateTransition>, BackplaneError>;

    async fn append_approval(&self, record: &ApprovalRecord) -> Result<(), BackplaneError>;

    async fn list_approvals(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<ApprovalRecord>, BackplaneError>;

    async fn append_policy_evaluation(
        &self,
        record: &PolicyEvaluationRecord,
    ) -> Result<(), BackplaneError>;

    async fn list_policy_evaluations(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<PolicyEvaluationRecord>, BackplaneError>;
}
