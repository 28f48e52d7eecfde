use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use labgate_core::approvals::ApprovalManager;
use labgate_core::domain::approval::ROLE_METADATA_KEY;
use labgate_core::domain::experiment::ExperimentName;
use labgate_core::domain::lifecycle::{LifecycleState, TransitionRequest};
use labgate_core::domain::policy::{
    TelemetryValue, ERROR_RATE, RUNNING_DURATION, TRAFFIC_PERCENT,
};
use labgate_core::governor::{GovernanceOutcome, GovernanceRequest, Governor};
use labgate_core::lifecycle::ExperimentStateLookup;
use labgate_core::policies::PolicyEvaluator;
use labgate_core::versions::{VersionManager, VersionStore};
use tokio_util::sync::CancellationToken;

use crate::commands::{
    audit_dispatcher, build_runtime, governance_failure, load_config, load_lifecycle,
    open_backplane, CommandResult,
};

#[derive(Debug, Clone, Args)]
pub struct TransitionArgs {
    /// Experiment to move.
    pub experiment: String,
    /// Target lifecycle state, e.g. `pending_approval` or `Running`.
    pub target: String,
    #[arg(long)]
    pub actor: Option<String>,
    #[arg(long)]
    pub reason: Option<String>,
    #[arg(long, help = "Role of the actor, read by role-based approval gates")]
    pub role: Option<String>,
    #[arg(long, help = "Current traffic allocation in percent")]
    pub traffic_pct: Option<f64>,
    #[arg(long, help = "Observed error rate as a fraction (0.0-1.0)")]
    pub error_rate: Option<f64>,
    #[arg(long, help = "Seconds the experiment has been running")]
    pub running_secs: Option<u64>,
}

impl TransitionArgs {
    pub fn new(experiment: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            target: target.into(),
            actor: None,
            reason: None,
            role: None,
            traffic_pct: None,
            error_rate: None,
            running_secs: None,
        }
    }

    fn request(&self, target: LifecycleState) -> GovernanceRequest {
        let mut transition = TransitionRequest {
            actor: self.actor.clone(),
            reason: self.reason.clone(),
            ..TransitionRequest::default()
        };
        if let Some(role) = &self.role {
            transition = transition.with_metadata(ROLE_METADATA_KEY, role.clone());
        }

        let mut request = GovernanceRequest::new(self.experiment.as_str(), target)
            .with_transition(transition);
        if let Some(percent) = self.traffic_pct {
            request = request.with_signal(TRAFFIC_PERCENT, TelemetryValue::Number(percent));
        }
        if let Some(rate) = self.error_rate {
            request = request.with_signal(ERROR_RATE, TelemetryValue::Number(rate));
        }
        if let Some(secs) = self.running_secs {
            request = request
                .with_signal(RUNNING_DURATION, TelemetryValue::Duration(Duration::from_secs(secs)));
        }
        request
    }
}

pub fn run(args: TransitionArgs) -> CommandResult {
    let target = match args.target.parse::<LifecycleState>() {
        Ok(target) => target,
        Err(error) => {
            return CommandResult::failure("transition", "invalid_argument", error.to_string(), 1)
        }
    };
    let config = match load_config() {
        Ok(config) => config,
        Err(failure) => return CommandResult::from_failure("transition", failure),
    };
    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(failure) => return CommandResult::from_failure("transition", failure),
    };

    let result = runtime.block_on(async {
        let backplane = open_backplane(&config).await?;
        let audit = audit_dispatcher(&config);

        // Conflict prevention reads the recorded state of its peers, so load them too.
        let mut experiments = vec![ExperimentName::from(args.experiment.as_str())];
        experiments.extend(
            config.policies.conflict_prevention.experiments.iter().map(ExperimentName::new),
        );
        let lifecycle = load_lifecycle(backplane.clone(), audit.clone(), &experiments).await?;

        let policies =
            PolicyEvaluator::new().with_audit(audit.clone()).with_backplane(backplane.clone());
        let lookup: Arc<dyn ExperimentStateLookup> = lifecycle.clone();
        for policy in config.builtin_policies(lookup) {
            policies.register_policy(policy);
        }
        let approvals =
            ApprovalManager::new().with_audit(audit.clone()).with_backplane(backplane.clone());
        for (from, to, gate) in config.approval_gates() {
            approvals.register_gate(from, to, gate);
        }
        let governor = Governor::new(
            lifecycle,
            Arc::new(approvals),
            Arc::new(policies),
            Arc::new(VersionManager::new(VersionStore::default(), audit)),
        );

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });

        let outcome = governor.request_transition(args.request(target), &cancel).await;
        interrupt.abort();
        backplane.pool().close().await;
        outcome.map_err(|error| governance_failure(&error))
    });

    match result {
        Ok(outcome) => success(&outcome),
        Err(failure) => CommandResult::from_failure("transition", failure),
    }
}

fn success(outcome: &GovernanceOutcome) -> CommandResult {
    let transition = &outcome.transition;
    let warnings = outcome.policy_results.iter().filter(|result| !result.compliant).count();
    let mut message =
        format!("moved `{}` from {} to {}", transition.experiment, transition.from, transition.to);
    if warnings > 0 {
        message.push_str(&format!(" with {warnings} non-blocking policy violation(s)"));
    }
    CommandResult::success_with_data("transition", message, outcome)
}
