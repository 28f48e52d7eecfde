use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::approvals::gate::ApprovalGate;
use crate::audit::{AuditDispatcher, AuditEvent, AuditEventType};
use crate::backplane::GovernanceBackplane;
use crate::domain::approval::{ApprovalContext, ApprovalRecord, ApprovalResult};
use crate::domain::lifecycle::LifecycleState;
use crate::errors::GovernanceError;

#[derive(Clone, Debug)]
struct GateRegistration {
    from: Option<LifecycleState>,
    to: LifecycleState,
    gate: ApprovalGate,
}

impl GateRegistration {
    fn applies_to(&self, context: &ApprovalContext) -> bool {
        self.to == context.target_state
            && self.from.map_or(true, |from| from == context.current_state)
    }
}

#[derive(Default)]
pub struct ApprovalManager {
    gates: RwLock<Vec<GateRegistration>>,
    audit: Option<AuditDispatcher>,
    backplane: Option<Arc<dyn GovernanceBackplane>>,
}

impl ApprovalManager {
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

    /// `from = None` applies the gate to every edge that ends in `to`.
    pub fn register_gate(
        &self,
        from: Option<LifecycleState>,
        to: LifecycleState,
        gate: ApprovalGate,
    ) {
        debug!(
            event_name = "approvals.gate.registered",
            gate = gate.name(),
            kind = gate.kind().label(),
            from = from.map(|state| state.as_str()).unwrap_or("any"),
            to = %to,
            "approval gate registered"
        );
        self.write_gates().push(GateRegistration { from, to, gate });
    }

    pub fn gate_count(&self) -> usize {
        self.read_gates().len()
    }

    pub fn gates_for(&self, from: LifecycleState, to: LifecycleState) -> Vec<ApprovalGate> {
        let probe = ApprovalContext::new("", from, to);
        self.applicable(&probe)
    }

    /// Evaluates every applicable gate in registration order. Cancellation returns
    /// `Cancelled` and records nothing; a failing gate aborts the whole evaluation.
    pub async fn evaluate(
        &self,
        context: &ApprovalContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApprovalResult>, GovernanceError> {
        let gates = self.applicable(context);
        let mut results = Vec::with_capacity(gates.len());

        for gate in &gates {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GovernanceError::Cancelled),
                result = gate.evaluate(context) => result?,
            };
            debug!(
                event_name = "approvals.gate.evaluated",
                experiment = %context.experiment,
                gate = gate.name(),
                approved = result.approved,
                "approval gate evaluated"
            );
            results.push(result);
        }

        self.record(context, &results, cancel).await;
        Ok(results)
    }

    /// True when every applicable gate approves; vacuously true without gates.
    pub async fn is_approved(
        &self,
        context: &ApprovalContext,
        cancel: &CancellationToken,
    ) -> Result<bool, GovernanceError> {
        let results = self.evaluate(context, cancel).await?;
        Ok(results.iter().all(|result| result.approved))
    }

    fn applicable(&self, context: &ApprovalContext) -> Vec<ApprovalGate> {
        self.read_gates()
            .iter()
            .filter(|registration| registration.applies_to(context))
            .map(|registration| registration.gate.clone())
            .collect()
    }

    async fn record(
        &self,
        context: &ApprovalContext,
        results: &[ApprovalResult],
        cancel: &CancellationToken,
    ) {
        if results.is_empty() {
            return;
        }

        if let Some(backplane) = &self.backplane {
            for result in results {
                let record = ApprovalRecord {
                    experiment: context.experiment.clone(),
                    from: context.current_state,
                    to: context.target_state,
                    actor: context.actor.clone(),
                    result: result.clone(),
                };
                if let Err(error) = backplane.append_approval(&record).await {
                    warn!(
                        event_name = "approvals.record.persist_failed",
                        experiment = %context.experiment,
                        gate = %result.gate,
                        error = %error,
                        "approval record could not be appended"
                    );
                }
            }
        }

        if let Some(audit) = &self.audit {
            let approved = results.iter().all(|result| result.approved);
            let denied: Vec<&str> = results
                .iter()
                .filter(|result| !result.approved)
                .map(|result| result.gate.as_str())
                .collect();
            let event = AuditEvent::new(
                AuditEventType::ApprovalEvaluated,
                context.experiment.clone(),
                context.actor.clone(),
            )
            .with_detail("from", context.current_state.as_str())
            .with_detail("to", context.target_state.as_str())
            .with_detail("approved", approved.to_string())
            .with_detail("gates", results.len().to_string())
            .with_detail("denied_by", denied.join(","));
            audit.dispatch(event, cancel).await;
        }
    }

    fn read_gates(&self) -> std::sync::RwLockReadGuard<'_, Vec<GateRegistration>> {
        match self.gates.read() {
            Ok(gates) => gates,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_gates(&self) -> std::sync::RwLockWriteGuard<'_, Vec<GateRegistration>> {
        match self.gates.write() {
            Ok(gates) => gates,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
