use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approval::{ApprovalContext, ApprovalResult, ManualDecision};
use crate::domain::experiment::ExperimentName;
use crate::domain::lifecycle::LifecycleState;
use crate::errors::GovernanceError;
use crate::locking::lock;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct GateError(pub String);

/// Verdict returned by an external system (ticket tracker, change board, ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalVerdict {
    pub approved: bool,
    pub approver: Option<String>,
    pub reason: Option<String>,
    pub reference: Option<String>,
}

#[async_trait]
pub trait ExternalApprover: Send + Sync {
    async fn decide(&self, context: &ApprovalContext) -> Result<ExternalVerdict, GateError>;
}

/// Human decisions recorded ahead of evaluation, keyed by experiment and target state.
#[derive(Debug, Default)]
pub struct ManualApprovalStore {
    decisions: Mutex<HashMap<(ExperimentName, LifecycleState), ManualDecision>>,
}

impl ManualApprovalStore {
    pub fn record_decision(
        &self,
        experiment: &ExperimentName,
        target: LifecycleState,
        approved: bool,
        approver: impl Into<String>,
        reason: Option<String>,
    ) -> ManualDecision {
        let decision =
            ManualDecision { approved, approver: approver.into(), reason, decided_at: Utc::now() };
        lock(&self.decisions).insert((experiment.clone(), target), decision.clone());
        decision
    }

    pub fn decision(
        &self,
        experiment: &ExperimentName,
        target: LifecycleState,
    ) -> Option<ManualDecision> {
        lock(&self.decisions).get(&(experiment.clone(), target)).cloned()
    }

    pub fn clear(&self, experiment: &ExperimentName, target: LifecycleState) -> bool {
        lock(&self.decisions).remove(&(experiment.clone(), target)).is_some()
    }
}

#[derive(Clone)]
pub enum GateKind {
    Automatic,
    Manual(Arc<ManualApprovalStore>),
    RoleBased { allowed_roles: Vec<String> },
    Custom(Arc<dyn ExternalApprover>),
}

impl GateKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual(_) => "manual",
            Self::RoleBased { .. } => "role_based",
            Self::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoleBased { allowed_roles } => {
                f.debug_struct("RoleBased").field("allowed_roles", allowed_roles).finish()
            }
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApprovalGate {
    name: String,
    kind: GateKind,
}

impl ApprovalGate {
    pub fn builder(name: impl Into<String>) -> GateBuilder {
        GateBuilder { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &GateKind {
        &self.kind
    }

    /// A delegate failure is surfaced as `GateEvaluation`; it never counts as approval.
    pub async fn evaluate(
        &self,
        context: &ApprovalContext,
    ) -> Result<ApprovalResult, GovernanceError> {
        let result = match &self.kind {
            GateKind::Automatic => {
                ApprovalResult::approve(&self.name, "automatically approved")
                    .with_approver("system")
            }
            GateKind::Manual(store) => {
                match store.decision(&context.experiment, context.target_state) {
                    Some(decision) => {
                        let reason = decision.reason.clone().unwrap_or_else(|| {
                            if decision.approved {
                                "manually approved".to_owned()
                            } else {
                                "manually rejected".to_owned()
                            }
                        });
                        let result = if decision.approved {
                            ApprovalResult::approve(&self.name, reason)
                        } else {
                            ApprovalResult::deny(&self.name, reason)
                        };
                        result
                            .with_approver(decision.approver)
                            .with_metadata("decided_at", decision.decided_at.to_rfc3339())
                    }
                    None => ApprovalResult::deny(
                        &self.name,
                        format!(
                            "awaiting manual approval for `{}` to {}",
                            context.experiment, context.target_state
                        ),
                    )
                    .with_metadata("status", "pending"),
                }
            }
            GateKind::RoleBased { allowed_roles } => match context.actor_role() {
                Some(role) if role_allowed(allowed_roles, role) => ApprovalResult::approve(
                    &self.name,
                    format!("role `{role}` may approve this transition"),
                )
                .with_approver(context.actor.clone().unwrap_or_else(|| role.to_owned())),
                Some(role) => ApprovalResult::deny(
                    &self.name,
                    format!("role `{role}` is not in [{}]", allowed_roles.join(", ")),
                ),
                None => ApprovalResult::deny(&self.name, "actor role is missing from metadata"),
            },
            GateKind::Custom(delegate) => {
                let verdict = delegate.decide(context).await.map_err(|error| {
                    GovernanceError::GateEvaluation {
                        gate: self.name.clone(),
                        message: error.to_string(),
                    }
                })?;
                let reason = verdict.reason.unwrap_or_else(|| {
                    if verdict.approved {
                        "approved by external system".to_owned()
                    } else {
                        "rejected by external system".to_owned()
                    }
                });
                let mut result = if verdict.approved {
                    ApprovalResult::approve(&self.name, reason)
                } else {
                    ApprovalResult::deny(&self.name, reason)
                };
                if let Some(approver) = verdict.approver {
                    result = result.with_approver(approver);
                }
                if let Some(reference) = verdict.reference {
                    result = result.with_metadata("reference", reference);
                }
                result
            }
        };

        Ok(result.with_metadata("gate_kind", self.kind.label()))
    }
}

/// Picks the gate variant at configuration time.
#[derive(Clone, Debug)]
pub struct GateBuilder {
    name: String,
}

impl GateBuilder {
    pub fn automatic(self) -> ApprovalGate {
        ApprovalGate { name: self.name, kind: GateKind::Automatic }
    }

    pub fn manual(self, store: Arc<ManualApprovalStore>) -> ApprovalGate {
        ApprovalGate { name: self.name, kind: GateKind::Manual(store) }
    }

    pub fn role_based<I, S>(self, allowed_roles: I) -> ApprovalGate
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed_roles = allowed_roles.into_iter().map(Into::into).collect();
        ApprovalGate { name: self.name, kind: GateKind::RoleBased { allowed_roles } }
    }

    pub fn custom(self, delegate: Arc<dyn ExternalApprover>) -> ApprovalGate {
        ApprovalGate { name: self.name, kind: GateKind::Custom(delegate) }
    }
}

fn role_allowed(allowed_roles: &[String], role: &str) -> bool {
    let role = role.trim().to_ascii_lowercase();
    allowed_roles.iter().any(|allowed| {
        let allowed = allowed.trim().to_ascii_lowercase();
        allowed == "*" || allowed == role
    })
}
