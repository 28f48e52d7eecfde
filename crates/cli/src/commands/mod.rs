pub mod config;
pub mod history;
pub mod migrate;
pub mod smoke;
pub mod state;
pub mod transition;

use std::sync::Arc;

use labgate_core::audit::{AuditDispatcher, TracingAuditSink};
use labgate_core::config::{GovernanceConfig, LoadOptions};
use labgate_core::domain::experiment::ExperimentName;
use labgate_core::errors::GovernanceError;
use labgate_core::lifecycle::{LifecycleManager, TransitionStore, TransitionTable};
use labgate_db::{connect_with_config, migrations, SqlGovernanceBackplane};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Error class, message and exit code of a command that could not complete.
pub type Failure = (&'static str, String, u8);

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::ok(command, message.into(), None)
    }

    /// Like `success`, with a structured `data` member carrying the command's result.
    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: &impl Serialize,
    ) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self::ok(command, message.into(), Some(value)),
            Err(error) => Self::failure(command, "serialization", error.to_string(), 1),
        }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    pub fn from_failure(command: &str, (error_class, message, exit_code): Failure) -> Self {
        Self::failure(command, error_class, message, exit_code)
    }

    fn ok(command: &str, message: String, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message,
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config() -> Result<GovernanceConfig, Failure> {
    GovernanceConfig::load(LoadOptions::default())
        .map_err(|error| ("config_validation", format!("configuration issue: {error}"), 2))
}

pub(crate) fn build_runtime() -> Result<Runtime, Failure> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        ("runtime_init", format!("failed to initialize async runtime: {error}"), 3)
    })
}

/// Connects and brings the schema up to date so every command sees the same tables.
pub(crate) async fn open_backplane(
    config: &GovernanceConfig,
) -> Result<Arc<SqlGovernanceBackplane>, Failure> {
    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4))?;
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5))?;
    Ok(Arc::new(SqlGovernanceBackplane::new(pool)))
}

pub(crate) fn audit_dispatcher(config: &GovernanceConfig) -> AuditDispatcher {
    AuditDispatcher::new(Arc::new(TracingAuditSink), config.audit.policy())
}

/// Builds a lifecycle manager backed by `backplane` and loads the named experiments into it.
pub(crate) async fn load_lifecycle(
    backplane: Arc<SqlGovernanceBackplane>,
    audit: AuditDispatcher,
    experiments: &[ExperimentName],
) -> Result<Arc<LifecycleManager>, Failure> {
    let lifecycle = LifecycleManager::new(
        TransitionTable::default(),
        TransitionStore::default(),
        audit,
    )
    .with_backplane(backplane);
    for experiment in experiments {
        lifecycle.refresh(experiment).await.map_err(|error| governance_failure(&error))?;
    }
    Ok(Arc::new(lifecycle))
}

pub(crate) fn governance_failure(error: &GovernanceError) -> Failure {
    let (error_class, exit_code) = match error {
        GovernanceError::InvalidTransition { .. } => ("invalid_transition", 7),
        GovernanceError::PolicyBlocked { .. } => ("policy_blocked", 8),
        GovernanceError::ApprovalDenied { .. } => ("approval_denied", 9),
        GovernanceError::ConcurrencyConflict { .. } => ("concurrency_conflict", 10),
        GovernanceError::GateEvaluation { .. } => ("gate_evaluation", 11),
        GovernanceError::Cancelled => ("cancelled", 12),
        GovernanceError::VersionNotFound { .. } => ("version_not_found", 13),
        GovernanceError::Backplane(_) => ("backplane", 4),
    };
    (error_class, error.to_string(), exit_code)
}
