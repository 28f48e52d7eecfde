use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::experiment::ExperimentName;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    StateTransition,
    ExperimentModified,
    ApprovalEvaluated,
    PolicyViolation,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateTransition => "state_transition",
            Self::ExperimentModified => "experiment_modified",
            Self::ApprovalEvaluated => "approval_evaluated",
            Self::PolicyViolation => "policy_violation",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub experiment: ExperimentName,
    pub actor: Option<String>,
    pub details: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        experiment: ExperimentName,
        actor: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            event_type,
            experiment,
            actor,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink rejected event: {0}")]
    Rejected(String),
    #[error("audit recording cancelled")]
    Cancelled,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent, cancel: &CancellationToken)
        -> Result<(), AuditError>;
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_of(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|event| event.event_type == event_type).collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(
        &self,
        event: AuditEvent,
        cancel: &CancellationToken,
    ) -> Result<(), AuditError> {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }
}

/// Writes every audit event as a structured log record.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(
        &self,
        event: AuditEvent,
        _cancel: &CancellationToken,
    ) -> Result<(), AuditError> {
        let details = serde_json::to_string(&event.details)
            .map_err(|error| AuditError::Rejected(error.to_string()))?;
        info!(
            event_name = "audit.recorded",
            event_id = %event.event_id,
            event_type = %event.event_type,
            experiment = %event.experiment,
            actor = event.actor.as_deref().unwrap_or("unknown"),
            details = %details,
            "governance audit event"
        );
        Ok(())
    }
}

/// How the core reacts to an audit sink that cannot take an event. The governance
/// operation that produced the event has already committed in every mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuditPolicy {
    BestEffort { max_attempts: u32 },
    Disabled,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self::BestEffort { max_attempts: 1 }
    }
}

#[derive(Clone)]
pub struct AuditDispatcher {
    sink: Arc<dyn AuditSink>,
    policy: AuditPolicy,
}

impl AuditDispatcher {
    pub fn new(sink: Arc<dyn AuditSink>, policy: AuditPolicy) -> Self {
        Self { sink, policy }
    }

    pub fn policy(&self) -> AuditPolicy {
        self.policy
    }

    /// Returns whether the sink accepted the event. Failures are logged and never
    /// surfaced to the caller.
    pub async fn dispatch(&self, event: AuditEvent, cancel: &CancellationToken) -> bool {
        let max_attempts = match self.policy {
            AuditPolicy::Disabled => {
                debug!(
                    event_name = "audit.skipped",
                    event_type = %event.event_type,
                    experiment = %event.experiment,
                    "audit disabled; event dropped"
                );
                return false;
            }
            AuditPolicy::BestEffort { max_attempts } => max_attempts.max(1),
        };

        for attempt in 1..=max_attempts {
            match self.sink.record(event.clone(), cancel).await {
                Ok(()) => return true,
                Err(AuditError::Cancelled) => {
                    warn!(
                        event_name = "audit.cancelled",
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        experiment = %event.experiment,
                        "audit recording cancelled after the operation committed"
                    );
                    return false;
                }
                Err(error) if attempt == max_attempts => {
                    warn!(
                        event_name = "audit.failed",
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        experiment = %event.experiment,
                        attempts = attempt,
                        error = %error,
                        "audit sink failed; continuing without audit record"
                    );
                }
                Err(error) => {
                    debug!(
                        event_name = "audit.retry",
                        event_id = %event.event_id,
                        attempt,
                        error = %error,
                        "audit sink failed; retrying"
                    );
                }
            }
        }
        false
    }
}

impl Default for AuditDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink), AuditPolicy::default())
    }
}
