use thiserror::Error;

use crate::domain::approval::ApprovalResult;
use crate::domain::experiment::ExperimentName;
use crate::domain::lifecycle::LifecycleState;
use crate::domain::policy::PolicyEvaluationResult;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GovernanceError {
    #[error(
        "invalid transition for `{experiment}` from {from} to {to} (allowed: [{}])",
        format_states(.allowed)
    )]
    InvalidTransition {
        experiment: ExperimentName,
        from: LifecycleState,
        to: LifecycleState,
        allowed: Vec<LifecycleState>,
    },
    #[error("version {version} not found for `{experiment}`")]
    VersionNotFound { experiment: ExperimentName, version: u32 },
    #[error("concurrent update detected for `{experiment}`; reload its state and retry")]
    ConcurrencyConflict { experiment: ExperimentName },
    #[error("approval gate `{gate}` failed: {message}")]
    GateEvaluation { gate: String, message: String },
    #[error(
        "critical policies block `{experiment}`: {}",
        format_violations(.violations)
    )]
    PolicyBlocked { experiment: ExperimentName, violations: Vec<PolicyEvaluationResult> },
    #[error("approval withheld for `{experiment}` by gates: {}", format_denials(.results))]
    ApprovalDenied { experiment: ExperimentName, results: Vec<ApprovalResult> },
    #[error("governance operation cancelled")]
    Cancelled,
    #[error("persistence backplane failure: {0}")]
    Backplane(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Conflict { .. } => {
                "The experiment changed while the request was in flight. Reload its state and retry."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl GovernanceError {
    /// Whether a caller may reasonably retry the same request after reloading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::Backplane(_))
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let message = self.to_string();
        match self {
            Self::InvalidTransition { .. }
            | Self::VersionNotFound { .. }
            | Self::PolicyBlocked { .. }
            | Self::ApprovalDenied { .. } => InterfaceError::BadRequest { message, correlation_id },
            Self::ConcurrencyConflict { .. } => InterfaceError::Conflict { message, correlation_id },
            Self::Backplane(_) | Self::Cancelled => {
                InterfaceError::ServiceUnavailable { message, correlation_id }
            }
            Self::GateEvaluation { .. } => InterfaceError::Internal { message, correlation_id },
        }
    }
}

fn format_states(states: &[LifecycleState]) -> String {
    states.iter().map(LifecycleState::as_str).collect::<Vec<_>>().join(", ")
}

fn format_violations(violations: &[PolicyEvaluationResult]) -> String {
    violations
        .iter()
        .map(|result| match &result.reason {
            Some(reason) => format!("{} ({reason})", result.policy),
            None => result.policy.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_denials(results: &[ApprovalResult]) -> String {
    results
        .iter()
        .filter(|result| !result.approved)
        .map(|result| result.gate.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
