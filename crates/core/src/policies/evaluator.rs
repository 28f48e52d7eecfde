use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditDispatcher, AuditEvent, AuditEventType};
use crate::backplane::GovernanceBackplane;
use crate::domain::policy::{
    PolicyContext, PolicyEvaluationRecord, PolicyEvaluationResult, Severity,
};
use crate::errors::GovernanceError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("telemetry signal `{signal}` is invalid: {message}")]
    InvalidSignal { signal: String, message: String },
    #[error("policy dependency unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    fn severity(&self) -> Severity;

    async fn evaluate(
        &self,
        context: &PolicyContext,
    ) -> Result<PolicyEvaluationResult, PolicyError>;
}

#[derive(Default)]
pub struct PolicyEvaluator {
    policies: RwLock<Vec<Arc<dyn Policy>>>,
    audit: Option<AuditDispatcher>,
    backplane: Option<Arc<dyn GovernanceBackplane>>,
}

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_audit(mut self, audit: AuditDispatcher) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_backplane(mut self, backplane: Arc<dyn GovernanceBackplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    pub fn register_policy(&self, policy: Arc<dyn Policy>) {
        debug!(
            event_name = "policies.registered",
            policy = policy.name(),
            severity = %policy.severity(),
            "policy registered"
        );
        match self.policies.write() {
            Ok(mut policies) => policies.push(policy),
            Err(poisoned) => poisoned.into_inner().push(policy),
        }
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|policy| policy.name().to_owned()).collect()
    }

    /// Evaluates every registered policy. A policy that fails becomes an Error-severity
    /// violation so it cannot hide the verdicts of the others; only cancellation fails
    /// the call, and then nothing is recorded.
    pub async fn evaluate_all(
        &self,
        context: &PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolicyEvaluationResult>, GovernanceError> {
        let policies = self.snapshot();
        let mut results = Vec::with_capacity(policies.len());

        for policy in &policies {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GovernanceError::Cancelled),
                outcome = policy.evaluate(context) => outcome,
            };
            let result = match outcome {
                Ok(result) => result,
                Err(error) => {
                    warn!(
                        event_name = "policies.evaluation_failed",
                        experiment = %context.experiment,
                        policy = policy.name(),
                        error = %error,
                        "policy evaluation failed; recording as error-severity violation"
                    );
                    PolicyEvaluationResult::violation(
                        policy.name(),
                        Severity::Error,
                        format!("policy evaluation failed: {error}"),
                    )
                }
            };
            results.push(result);
        }

        self.record(context, &results, cancel).await;
        Ok(results)
    }

    pub async fn violations(
        &self,
        context: &PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolicyEvaluationResult>, GovernanceError> {
        let results = self.evaluate_all(context, cancel).await?;
        Ok(results.into_iter().filter(|result| !result.compliant).collect())
    }

    /// False iff at least one Critical-severity result is non-compliant.
    pub async fn are_critical_policies_compliant(
        &self,
        context: &PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<bool, GovernanceError> {
        let results = self.evaluate_all(context, cancel).await?;
        Ok(!results.iter().any(PolicyEvaluationResult::blocks))
    }

    fn snapshot(&self) -> Vec<Arc<dyn Policy>> {
        match self.policies.read() {
            Ok(policies) => policies.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn record(
        &self,
        context: &PolicyContext,
        results: &[PolicyEvaluationResult],
        cancel: &CancellationToken,
    ) {
        if let Some(backplane) = &self.backplane {
            for result in results {
                let record = PolicyEvaluationRecord {
                    experiment: context.experiment.clone(),
                    current_state: context.current_state,
                    target_state: context.target_state,
                    evaluated_at: context.evaluated_at,
                    result: result.clone(),
                };
                if let Err(error) = backplane.append_policy_evaluation(&record).await {
                    warn!(
                        event_name = "policies.record.persist_failed",
                        experiment = %context.experiment,
                        policy = %result.policy,
                        error = %error,
                        "policy evaluation record could not be appended"
                    );
                }
            }
        }

        let Some(audit) = &self.audit else {
            return;
        };
        for result in results.iter().filter(|result| !result.compliant) {
            let mut event =
                AuditEvent::new(AuditEventType::PolicyViolation, context.experiment.clone(), None)
                    .with_detail("policy", result.policy.clone())
                    .with_detail("severity", result.severity.as_str());
            if let Some(reason) = &result.reason {
                event = event.with_detail("reason", reason.clone());
            }
            if let Some(target) = context.target_state {
                event = event.with_detail("target_state", target.as_str());
            }
            audit.dispatch(event, cancel).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::{Policy, PolicyError, PolicyEvaluator};
    use crate::audit::{AuditDispatcher, AuditEventType, AuditPolicy, InMemoryAuditSink};
    use crate::domain::policy::{PolicyContext, PolicyEvaluationResult, Severity};
    use crate::errors::GovernanceError;

    struct FixedPolicy {
        name: &'static str,
        severity: Severity,
        compliant: bool,
    }

    #[async_trait]
    impl Policy for FixedPolicy {
        fn name(&self) -> &str {
            self.name
        }

        fn severity(&self) -> Severity {
            self.severity
        }

        async fn evaluate(
            &self,
            _context: &PolicyContext,
        ) -> Result<PolicyEvaluationResult, PolicyError> {
            if self.compliant {
                Ok(PolicyEvaluationResult::compliant(self.name, self.severity))
            } else {
                Ok(PolicyEvaluationResult::violation(self.name, self.severity, "tripped"))
            }
        }
    }

    struct BrokenPolicy;

    #[async_trait]
    impl Policy for BrokenPolicy {
        fn name(&self) -> &str {
            "broken"
        }

        fn severity(&self) -> Severity {
            Severity::Critical
        }

        async fn evaluate(
            &self,
            _context: &PolicyContext,
        ) -> Result<PolicyEvaluationResult, PolicyError> {
            Err(PolicyError::Unavailable("metrics backend timed out".to_owned()))
        }
    }

    fn fixed(name: &'static str, severity: Severity, compliant: bool) -> Arc<dyn Policy> {
        Arc::new(FixedPolicy { name, severity, compliant })
    }

    #[tokio::test]
    async fn non_critical_violations_never_block() {
        let evaluator = PolicyEvaluator::new();
        evaluator.register_policy(fixed("info", Severity::Info, false));
        evaluator.register_policy(fixed("warning", Severity::Warning, false));
        evaluator.register_policy(fixed("error", Severity::Error, false));
        evaluator.register_policy(fixed("critical-ok", Severity::Critical, true));
        let cancel = CancellationToken::new();
        let context = PolicyContext::new("checkout-test");

        assert!(evaluator.are_critical_policies_compliant(&context, &cancel).await.expect("ok"));
        assert_eq!(evaluator.violations(&context, &cancel).await.expect("ok").len(), 3);
    }

    #[tokio::test]
    async fn critical_violation_blocks() {
        let evaluator = PolicyEvaluator::new();
        evaluator.register_policy(fixed("warning", Severity::Warning, true));
        evaluator.register_policy(fixed("critical", Severity::Critical, false));

        let compliant = evaluator
            .are_critical_policies_compliant(
                &PolicyContext::new("checkout-test"),
                &CancellationToken::new(),
            )
            .await
            .expect("ok");
        assert!(!compliant);
    }

    #[tokio::test]
    async fn failing_policy_is_isolated_as_error_result() {
        let evaluator = PolicyEvaluator::new();
        evaluator.register_policy(Arc::new(BrokenPolicy));
        evaluator.register_policy(fixed("after", Severity::Warning, true));
        let cancel = CancellationToken::new();
        let context = PolicyContext::new("checkout-test");

        let results = evaluator.evaluate_all(&context, &cancel).await.expect("isolated");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].policy, "broken");
        assert_eq!(results[0].severity, Severity::Error);
        assert!(!results[0].compliant);
        assert!(results[0].reason.as_deref().is_some_and(|reason| reason.contains("timed out")));
        assert!(results[1].compliant);

        // A broken Critical policy degrades to Error severity and does not block.
        assert!(evaluator.are_critical_policies_compliant(&context, &cancel).await.expect("ok"));
    }

    #[tokio::test]
    async fn no_policies_means_compliant() {
        let evaluator = PolicyEvaluator::new();
        let results = evaluator
            .evaluate_all(&PolicyContext::new("empty"), &CancellationToken::new())
            .await
            .expect("ok");
        assert!(results.is_empty());
        assert!(evaluator.policy_names().is_empty());
    }

    #[tokio::test]
    async fn cancelled_evaluation_records_nothing() {
        let sink = InMemoryAuditSink::default();
        let evaluator = PolicyEvaluator::new()
            .with_audit(AuditDispatcher::new(Arc::new(sink.clone()), AuditPolicy::default()));
        evaluator.register_policy(fixed("critical", Severity::Critical, false));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = evaluator
            .evaluate_all(&PolicyContext::new("checkout-test"), &cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(error, GovernanceError::Cancelled);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn violations_are_audited() {
        let sink = InMemoryAuditSink::default();
        let evaluator = PolicyEvaluator::new()
            .with_audit(AuditDispatcher::new(Arc::new(sink.clone()), AuditPolicy::default()));
        evaluator.register_policy(fixed("fine", Severity::Critical, true));
        evaluator.register_policy(fixed("noisy", Severity::Warning, false));

        evaluator
            .evaluate_all(&PolicyContext::new("checkout-test"), &CancellationToken::new())
            .await
            .expect("ok");

        let events = sink.events_of(AuditEventType::PolicyViolation);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details.get("policy").map(String::as_str), Some("noisy"));
        assert_eq!(events[0].details.get("severity").map(String::as_str), Some("warning"));
    }
}
