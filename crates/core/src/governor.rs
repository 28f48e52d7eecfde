//! Single entry point that runs a requested lifecycle change through policies and
//! approval gates before committing it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::approvals::ApprovalManager;
use crate::domain::approval::{ApprovalContext, ApprovalResult};
use crate::domain::experiment::ExperimentName;
use crate::domain::lifecycle::{LifecycleState, StateTransition, TransitionRequest};
use crate::domain::policy::{PolicyContext, PolicyEvaluationResult, TelemetryValue};
use crate::errors::GovernanceError;
use crate::lifecycle::LifecycleManager;
use crate::policies::PolicyEvaluator;
use crate::versions::VersionManager;

#[derive(Clone, Debug, PartialEq)]
pub struct GovernanceRequest {
    pub experiment: ExperimentName,
    pub target: LifecycleState,
    pub transition: TransitionRequest,
    pub telemetry: BTreeMap<String, TelemetryValue>,
}

impl GovernanceRequest {
    pub fn new(experiment: impl Into<ExperimentName>, target: LifecycleState) -> Self {
        Self {
            experiment: experiment.into(),
            target,
            transition: TransitionRequest::default(),
            telemetry: BTreeMap::new(),
        }
    }

    pub fn with_transition(mut self, transition: TransitionRequest) -> Self {
        self.transition = transition;
        self
    }

    pub fn with_signal(mut self, key: impl Into<String>, value: TelemetryValue) -> Self {
        self.telemetry.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernanceOutcome {
    pub transition: StateTransition,
    pub policy_results: Vec<PolicyEvaluationResult>,
    pub approval_results: Vec<ApprovalResult>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub experiment: ExperimentName,
    pub state: LifecycleState,
    pub allowed_transitions: Vec<LifecycleState>,
    pub transitions_recorded: usize,
    pub latest_version: Option<u32>,
}

pub struct Governor {
    lifecycle: Arc<LifecycleManager>,
    approvals: Arc<ApprovalManager>,
    policies: Arc<PolicyEvaluator>,
    versions: Arc<VersionManager>,
}

impl Governor {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        approvals: Arc<ApprovalManager>,
        policies: Arc<PolicyEvaluator>,
        versions: Arc<VersionManager>,
    ) -> Self {
        Self { lifecycle, approvals, policies, versions }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn approvals(&self) -> &ApprovalManager {
        &self.approvals
    }

    pub fn policies(&self) -> &PolicyEvaluator {
        &self.policies
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn snapshot(&self, experiment: &ExperimentName) -> ExperimentSnapshot {
        ExperimentSnapshot {
            experiment: experiment.clone(),
            state: self.lifecycle.get_state(experiment),
            allowed_transitions: self.lifecycle.allowed_transitions(experiment),
            transitions_recorded: self.lifecycle.get_history(experiment).len(),
            latest_version: self.versions.get_latest_version(experiment).map(|v| v.version),
        }
    }

    /// Validates the edge, evaluates policies, then approvals, then commits. Any failure
    /// or cancellation before the commit leaves the lifecycle untouched. The commit only
    /// goes through if the experiment is still in the state the gates were evaluated for;
    /// otherwise it fails with `ConcurrencyConflict`.
    pub async fn request_transition(
        &self,
        request: GovernanceRequest,
        cancel: &CancellationToken,
    ) -> Result<GovernanceOutcome, GovernanceError> {
        let GovernanceRequest { experiment, target, transition, telemetry } = request;
        let current = self.lifecycle.get_state(&experiment);
        if !self.lifecycle.table().permits(current, target) {
            return Err(GovernanceError::InvalidTransition {
                experiment,
                from: current,
                to: target,
                allowed: self.lifecycle.table().allowed(current).to_vec(),
            });
        }

        let policy_context = PolicyContext {
            experiment: experiment.clone(),
            current_state: Some(current),
            target_state: Some(target),
            telemetry,
            evaluated_at: Utc::now(),
        };
        let policy_results = self.policies.evaluate_all(&policy_context, cancel).await?;
        if policy_results.iter().any(PolicyEvaluationResult::blocks) {
            let violations: Vec<_> =
                policy_results.into_iter().filter(|result| !result.compliant).collect();
            info!(
                event_name = "governor.transition.policy_blocked",
                experiment = %experiment,
                from = %current,
                to = %target,
                violations = violations.len(),
                "transition blocked by critical policy"
            );
            return Err(GovernanceError::PolicyBlocked { experiment, violations });
        }

        let approval_context = ApprovalContext {
            experiment: experiment.clone(),
            current_state: current,
            target_state: target,
            actor: transition.actor.clone(),
            reason: transition.reason.clone(),
            metadata: transition.metadata.clone(),
        };
        let approval_results = self.approvals.evaluate(&approval_context, cancel).await?;
        if approval_results.iter().any(|result| !result.approved) {
            info!(
                event_name = "governor.transition.approval_denied",
                experiment = %experiment,
                from = %current,
                to = %target,
                "transition withheld by approval gates"
            );
            return Err(GovernanceError::ApprovalDenied { experiment, results: approval_results });
        }

        if cancel.is_cancelled() {
            debug!(
                event_name = "governor.transition.cancelled",
                experiment = %experiment,
                "cancelled before commit"
            );
            return Err(GovernanceError::Cancelled);
        }

        let transition = self
            .lifecycle
            .transition_from(&experiment, current, target, transition, cancel)
            .await?;
        Ok(GovernanceOutcome { transition, policy_results, approval_results })
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new(
            Arc::new(LifecycleManager::default()),
            Arc::new(ApprovalManager::default()),
            Arc::new(PolicyEvaluator::default()),
            Arc::new(VersionManager::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::{GovernanceRequest, Governor};
    use crate::approvals::{
        ApprovalGate, ApprovalManager, ExternalApprover, ExternalVerdict, GateError,
        ManualApprovalStore,
    };
    use crate::domain::approval::ApprovalContext;
    use crate::domain::experiment::ExperimentName;
    use crate::domain::lifecycle::{LifecycleState, TransitionRequest};
    use crate::domain::policy::{TelemetryValue, ERROR_RATE};
    use crate::domain::version::VersionRequest;
    use crate::errors::GovernanceError;
    use crate::lifecycle::LifecycleManager;
    use crate::policies::{ErrorRatePolicy, PolicyEvaluator, TrafficLimitPolicy};
    use crate::versions::VersionManager;

    fn governor(store: Arc<ManualApprovalStore>) -> Governor {
        let approvals = ApprovalManager::new();
        approvals.register_gate(
            Some(LifecycleState::PendingApproval),
            LifecycleState::Approved,
            ApprovalGate::builder("experiment-owner").manual(store),
        );
        approvals.register_gate(
            None,
            LifecycleState::Running,
            ApprovalGate::builder("launch-leads").role_based(["lead"]),
        );

        let policies = PolicyEvaluator::new();
        policies.register_policy(Arc::new(ErrorRatePolicy::new(0.05)));
        policies
            .register_policy(Arc::new(TrafficLimitPolicy::new(10.0, Duration::from_secs(60))));

        Governor::new(
            Arc::new(LifecycleManager::default()),
            Arc::new(approvals),
            Arc::new(policies),
            Arc::new(VersionManager::default()),
        )
    }

    fn lead() -> TransitionRequest {
        TransitionRequest::by("grace").with_metadata("role", "Lead")
    }

    #[tokio::test]
    async fn governed_path_to_running() {
        let store = Arc::new(ManualApprovalStore::default());
        let governor = governor(store.clone());
        let name = ExperimentName::from("checkout-test");
        let cancel = CancellationToken::new();

        governor
            .request_transition(
                GovernanceRequest::new("checkout-test", LifecycleState::PendingApproval),
                &cancel,
            )
            .await
            .expect("no gates on submission");

        let denied = governor
            .request_transition(
                GovernanceRequest::new("checkout-test", LifecycleState::Approved),
                &cancel,
            )
            .await
            .expect_err("owner has not decided");
        assert!(matches!(denied, GovernanceError::ApprovalDenied { ref results, .. }
            if results.len() == 1 && results[0].is_pending()));
        assert_eq!(governor.lifecycle().get_state(&name), LifecycleState::PendingApproval);

        store.record_decision(&name, LifecycleState::Approved, true, "owner", None);
        governor
            .request_transition(
                GovernanceRequest::new("checkout-test", LifecycleState::Approved),
                &cancel,
            )
            .await
            .expect("owner approved");

        let outcome = governor
            .request_transition(
                GovernanceRequest::new("checkout-test", LifecycleState::Running)
                    .with_transition(lead())
                    .with_signal(ERROR_RATE, TelemetryValue::Number(0.01)),
                &cancel,
            )
            .await
            .expect("lead launches healthy experiment");
        assert_eq!(outcome.transition.to, LifecycleState::Running);
        assert_eq!(outcome.transition.actor.as_deref(), Some("grace"));
        assert_eq!(outcome.policy_results.len(), 2);
        assert_eq!(outcome.approval_results.len(), 1);

        let snapshot = governor.snapshot(&name);
        assert_eq!(snapshot.state, LifecycleState::Running);
        assert_eq!(snapshot.transitions_recorded, 3);
        assert!(snapshot.allowed_transitions.contains(&LifecycleState::Paused));
    }

    #[tokio::test]
    async fn invalid_edge_is_rejected_before_evaluation() {
        let governor = governor(Arc::new(ManualApprovalStore::default()));
        let error = governor
            .request_transition(
                GovernanceRequest::new("checkout-test", LifecycleState::Running)
                    .with_transition(lead()),
                &CancellationToken::new(),
            )
            .await
            .expect_err("draft cannot run");
        assert!(matches!(error, GovernanceError::InvalidTransition { ref allowed, .. }
            if allowed == &vec![LifecycleState::PendingApproval, LifecycleState::Archived]));
    }

    #[tokio::test]
    async fn critical_policy_blocks_commit() {
        let store = Arc::new(ManualApprovalStore::default());
        let governor = governor(store.clone());
        let name = ExperimentName::from("checkout-test");
        let cancel = CancellationToken::new();
        store.record_decision(&name, LifecycleState::Approved, true, "owner", None);
        for target in [LifecycleState::PendingApproval, LifecycleState::Approved] {
            governor
                .request_transition(GovernanceRequest::new("checkout-test", target), &cancel)
                .await
                .expect("setup transition");
        }

        let error = governor
            .request_transition(
                GovernanceRequest::new("checkout-test", LifecycleState::Running)
                    .with_transition(lead())
                    .with_signal(ERROR_RATE, TelemetryValue::Number(0.4)),
                &cancel,
            )
            .await
            .expect_err("error rate too high");
        assert!(matches!(error, GovernanceError::PolicyBlocked { ref violations, .. }
            if violations.len() == 1 && violations[0].policy == "error-rate"));
        assert_eq!(governor.lifecycle().get_state(&name), LifecycleState::Approved);
    }

    #[tokio::test]
    async fn cancelled_request_commits_nothing() {
        let governor = governor(Arc::new(ManualApprovalStore::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = governor
            .request_transition(
                GovernanceRequest::new("checkout-test", LifecycleState::PendingApproval),
                &cancel,
            )
            .await
            .expect_err("cancelled");
        assert_eq!(error, GovernanceError::Cancelled);
        let history = governor.lifecycle().get_history(&ExperimentName::from("checkout-test"));
        assert!(history.is_empty());
    }

    /// Moves the experiment to `to` while it is being asked for a verdict.
    struct ShiftingApprover {
        lifecycle: Arc<LifecycleManager>,
        to: LifecycleState,
    }

    #[async_trait]
    impl ExternalApprover for ShiftingApprover {
        async fn decide(&self, context: &ApprovalContext) -> Result<ExternalVerdict, GateError> {
            self.lifecycle
                .transition(&context.experiment, self.to, TransitionRequest::by("operator"))
                .await
                .map_err(|error| GateError(error.to_string()))?;
            Ok(ExternalVerdict { approved: true, approver: None, reason: None, reference: None })
        }
    }

    #[tokio::test]
    async fn state_change_during_evaluation_is_a_conflict() {
        let lifecycle = Arc::new(LifecycleManager::default());
        let name = ExperimentName::from("checkout-test");
        for target in
            [LifecycleState::PendingApproval, LifecycleState::Approved, LifecycleState::Running]
        {
            lifecycle.transition(&name, target, TransitionRequest::default()).await.expect("setup");
        }

        let approvals = ApprovalManager::new();
        approvals.register_gate(
            Some(LifecycleState::Running),
            LifecycleState::Paused,
            ApprovalGate::builder("running-pause").custom(Arc::new(ShiftingApprover {
                lifecycle: lifecycle.clone(),
                to: LifecycleState::Ramping,
            })),
        );
        approvals.register_gate(
            Some(LifecycleState::Ramping),
            LifecycleState::Paused,
            ApprovalGate::builder("ramping-pause-owner")
                .manual(Arc::new(ManualApprovalStore::default())),
        );
        let governor = Governor::new(
            lifecycle.clone(),
            Arc::new(approvals),
            Arc::new(PolicyEvaluator::new()),
            Arc::new(VersionManager::default()),
        );

        let error = governor
            .request_transition(
                GovernanceRequest::new("checkout-test", LifecycleState::Paused),
                &CancellationToken::new(),
            )
            .await
            .expect_err("gates were evaluated for running, not ramping");

        assert_eq!(error, GovernanceError::ConcurrencyConflict { experiment: name.clone() });
        assert_eq!(lifecycle.get_state(&name), LifecycleState::Ramping);
        let last = lifecycle.get_history(&name).pop().expect("history");
        assert_eq!((last.from, last.to), (LifecycleState::Running, LifecycleState::Ramping));
    }

    #[tokio::test]
    async fn snapshot_reports_latest_version() {
        let governor = Governor::default();
        let name = ExperimentName::from("banner-test");
        governor
            .versions()
            .create_version(&name, json!({"color": "red"}), VersionRequest::default())
            .await;

        let snapshot = governor.snapshot(&name);
        assert_eq!(snapshot.state, LifecycleState::Draft);
        assert_eq!(snapshot.latest_version, Some(1));
        assert_eq!(snapshot.transitions_recorded, 0);
    }
}
