use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::experiment::ExperimentName;
use crate::domain::lifecycle::LifecycleState;

pub const TRAFFIC_PERCENT: &str = "traffic_percent";
pub const ERROR_RATE: &str = "error_rate";
pub const RUNNING_DURATION: &str = "running_duration";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown severity `{0}`")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(UnknownSeverity(value.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TelemetryValue {
    Number(f64),
    Duration(Duration),
}

impl TelemetryValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Duration(_) => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Duration(value) => Some(*value),
            Self::Number(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub experiment: ExperimentName,
    pub current_state: Option<LifecycleState>,
    pub target_state: Option<LifecycleState>,
    pub telemetry: BTreeMap<String, TelemetryValue>,
    pub evaluated_at: DateTime<Utc>,
}

impl PolicyContext {
    pub fn new(experiment: impl Into<ExperimentName>) -> Self {
        Self {
            experiment: experiment.into(),
            current_state: None,
            target_state: None,
            telemetry: BTreeMap::new(),
            evaluated_at: Utc::now(),
        }
    }

    pub fn with_states(mut self, current: LifecycleState, target: LifecycleState) -> Self {
        self.current_state = Some(current);
        self.target_state = Some(target);
        self
    }

    pub fn with_signal(mut self, key: impl Into<String>, value: TelemetryValue) -> Self {
        self.telemetry.insert(key.into(), value);
        self
    }

    pub fn with_traffic_percent(self, percent: f64) -> Self {
        self.with_signal(TRAFFIC_PERCENT, TelemetryValue::Number(percent))
    }

    pub fn with_error_rate(self, rate: f64) -> Self {
        self.with_signal(ERROR_RATE, TelemetryValue::Number(rate))
    }

    pub fn with_running_duration(self, elapsed: Duration) -> Self {
        self.with_signal(RUNNING_DURATION, TelemetryValue::Duration(elapsed))
    }

    pub fn at(mut self, evaluated_at: DateTime<Utc>) -> Self {
        self.evaluated_at = evaluated_at;
        self
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.telemetry.get(key).and_then(TelemetryValue::as_number)
    }

    pub fn duration(&self, key: &str) -> Option<Duration> {
        self.telemetry.get(key).and_then(TelemetryValue::as_duration)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluationResult {
    pub policy: String,
    pub compliant: bool,
    pub reason: Option<String>,
    pub severity: Severity,
}

impl PolicyEvaluationResult {
    pub fn compliant(policy: impl Into<String>, severity: Severity) -> Self {
        Self { policy: policy.into(), compliant: true, reason: None, severity }
    }

    pub fn violation(
        policy: impl Into<String>,
        severity: Severity,
        reason: impl Into<String>,
    ) -> Self {
        Self { policy: policy.into(), compliant: false, reason: Some(reason.into()), severity }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn blocks(&self) -> bool {
        !self.compliant && self.severity == Severity::Critical
    }
}

/// Append-only record of one policy verdict, as handed to the persistence backplane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluationRecord {
    pub experiment: ExperimentName,
    pub current_state: Option<LifecycleState>,
    pub target_state: Option<LifecycleState>,
    pub evaluated_at: DateTime<Utc>,
    pub result: PolicyEvaluationResult,
}
