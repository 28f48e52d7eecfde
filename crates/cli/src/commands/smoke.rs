use std::sync::Arc;
use std::time::Instant;

use labgate_core::approvals::ApprovalManager;
use labgate_core::config::GovernanceConfig;
use labgate_core::domain::experiment::ExperimentName;
use labgate_core::domain::lifecycle::LifecycleState;
use labgate_core::domain::version::VersionRequest;
use labgate_core::errors::GovernanceError;
use labgate_core::governor::{GovernanceRequest, Governor};
use labgate_core::lifecycle::{ExperimentStateLookup, LifecycleManager};
use labgate_core::policies::PolicyEvaluator;
use labgate_core::versions::VersionManager;
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::commands::{build_runtime, load_config, open_backplane, CommandResult, Failure};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

impl SmokeCheck {
    fn from_outcome(name: &'static str, elapsed_ms: u64, outcome: Result<String, String>) -> Self {
        let (status, message) = match outcome {
            Ok(message) => (SmokeStatus::Pass, message),
            Err(message) => (SmokeStatus::Fail, message),
        };
        Self { name, status, elapsed_ms, message }
    }

    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: SmokeStatus::Skipped,
            elapsed_ms: 0,
            message: "skipped due to a previous failure".to_string(),
        }
    }
}

/// Checks config, storage, and then drives a throwaway in-memory experiment through the
/// governance pipeline so policy, lifecycle and version wiring are all exercised.
pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(load_config) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck::from_outcome(
                "config_validation",
                elapsed_ms,
                Ok("configuration loaded and validated".to_string()),
            ));
            config
        }
        Err((elapsed_ms, (_, message, _))) => {
            checks.push(SmokeCheck::from_outcome("config_validation", elapsed_ms, Err(message)));
            for name in ["storage", "lifecycle_scenario", "version_scenario"] {
                checks.push(SmokeCheck::skipped(name));
            }
            return finalize_report(checks, elapsed_since(started));
        }
    };

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err((_, message, _)) => {
            checks.push(SmokeCheck::from_outcome("storage", 0, Err(message)));
            checks.push(SmokeCheck::skipped("lifecycle_scenario"));
            checks.push(SmokeCheck::skipped("version_scenario"));
            return finalize_report(checks, elapsed_since(started));
        }
    };

    let storage_started = Instant::now();
    let storage = runtime.block_on(async {
        let backplane = open_backplane(&config).await?;
        backplane.pool().close().await;
        Ok::<_, Failure>(format!("connected to `{}` and applied migrations", config.database.url))
    });
    checks.push(SmokeCheck::from_outcome(
        "storage",
        elapsed_since(storage_started),
        storage.map_err(|(class, message, _)| format!("{class}: {message}")),
    ));

    let (elapsed_ms, lifecycle) = timed(|| lifecycle_scenario(&runtime, &config));
    checks.push(SmokeCheck::from_outcome("lifecycle_scenario", elapsed_ms, lifecycle));

    let (elapsed_ms, versions) = timed(|| version_scenario(&runtime));
    checks.push(SmokeCheck::from_outcome("version_scenario", elapsed_ms, versions));

    finalize_report(checks, elapsed_since(started))
}

fn lifecycle_scenario(runtime: &Runtime, config: &GovernanceConfig) -> Result<String, String> {
    let lifecycle = Arc::new(LifecycleManager::default());
    let policies = PolicyEvaluator::new();
    let lookup: Arc<dyn ExperimentStateLookup> = lifecycle.clone();
    for policy in config.builtin_policies(lookup) {
        policies.register_policy(policy);
    }
    let governor = Governor::new(
        lifecycle,
        Arc::new(ApprovalManager::new()),
        Arc::new(policies),
        Arc::new(VersionManager::default()),
    );
    let cancel = CancellationToken::new();

    runtime.block_on(async {
        let path =
            [LifecycleState::PendingApproval, LifecycleState::Approved, LifecycleState::Running];
        for target in path {
            governor
                .request_transition(GovernanceRequest::new("smoke-checkout", target), &cancel)
                .await
                .map_err(|error| format!("expected {target} to be accepted: {error}"))?;
        }

        let shortcut = GovernanceRequest::new("smoke-shortcut", LifecycleState::Running);
        match governor.request_transition(shortcut, &cancel).await {
            Err(GovernanceError::InvalidTransition { .. }) => {}
            other => {
                return Err(format!("expected draft -> running to be rejected, got {other:?}"))
            }
        }

        let name = ExperimentName::from("smoke-checkout");
        Ok(format!(
            "draft -> running took {} transitions; draft -> running shortcut rejected",
            governor.lifecycle().get_history(&name).len()
        ))
    })
}

fn version_scenario(runtime: &Runtime) -> Result<String, String> {
    let versions = VersionManager::default();
    let name = ExperimentName::from("smoke-checkout");

    runtime.block_on(async {
        for p in 1..=3 {
            versions.create_version(&name, json!({ "p": p }), VersionRequest::by("smoke")).await;
        }
        let diff = versions.get_diff(&name, 1, 2).ok_or("versions 1 and 2 should exist")?;
        if diff.changes.len() != 1 {
            let found = diff.changes.len();
            return Err(format!("expected one change between v1 and v2, got {found}"));
        }

        let restored = versions
            .rollback_to_version(&name, 1, VersionRequest::by("smoke"))
            .await
            .map_err(|error| error.to_string())?;
        if restored.version != 4 || restored.payload != json!({ "p": 1 }) {
            return Err(format!("rollback produced unexpected version {}", restored.version));
        }

        let report = versions.verify_integrity(&name);
        match report.failure_reason {
            None => Ok(format!("{} versions verified after rollback", report.verified_versions)),
            Some(reason) => Err(reason),
        }
    })
}

fn timed<T>(check: impl FnOnce() -> T) -> (u64, T) {
    let started = Instant::now();
    let value = check();
    (elapsed_since(started), value)
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    match timed(check) {
        (elapsed_ms, Ok(value)) => Ok((elapsed_ms, value)),
        (elapsed_ms, Err(error)) => Err((elapsed_ms, error)),
    }
}

fn elapsed_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
