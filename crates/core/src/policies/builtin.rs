//! Built-in guardrail policies driven by the telemetry carried on a [`PolicyContext`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;

use crate::domain::experiment::ExperimentName;
use crate::domain::policy::{
    PolicyContext, PolicyEvaluationResult, Severity, ERROR_RATE, TRAFFIC_PERCENT,
    RUNNING_DURATION,
};
use crate::lifecycle::ExperimentStateLookup;
use crate::policies::evaluator::{Policy, PolicyError};

fn finite_signal(context: &PolicyContext, key: &str) -> Result<Option<f64>, PolicyError> {
    match context.number(key) {
        Some(value) if !value.is_finite() || value < 0.0 => Err(PolicyError::InvalidSignal {
            signal: key.to_owned(),
            message: format!("expected a finite non-negative number, got {value}"),
        }),
        other => Ok(other),
    }
}

/// Caps traffic exposure until the experiment has proven itself in `Running`.
#[derive(Clone, Debug)]
pub struct TrafficLimitPolicy {
    name: String,
    max_traffic_pct: f64,
    min_running: Duration,
    severity: Severity,
}

impl TrafficLimitPolicy {
    pub const NAME: &'static str = "traffic-limit";

    pub fn new(max_traffic_pct: f64, min_running: Duration) -> Self {
        Self {
            name: Self::NAME.to_owned(),
            max_traffic_pct,
            min_running,
            severity: Severity::Warning,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Policy for TrafficLimitPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    async fn evaluate(
        &self,
        context: &PolicyContext,
    ) -> Result<PolicyEvaluationResult, PolicyError> {
        let Some(traffic) = finite_signal(context, TRAFFIC_PERCENT)? else {
            return Ok(PolicyEvaluationResult::compliant(&self.name, self.severity)
                .with_reason("no traffic signal reported"));
        };
        let running = context.duration(RUNNING_DURATION).unwrap_or(Duration::ZERO);

        if traffic > self.max_traffic_pct && running < self.min_running {
            return Ok(PolicyEvaluationResult::violation(
                &self.name,
                self.severity,
                format!(
                    "traffic at {traffic}% exceeds the {}% ceiling after {}s in running \
                     (needs {}s)",
                    self.max_traffic_pct,
                    running.as_secs(),
                    self.min_running.as_secs()
                ),
            ));
        }
        Ok(PolicyEvaluationResult::compliant(&self.name, self.severity))
    }
}

#[derive(Clone, Debug)]
pub struct ErrorRatePolicy {
    name: String,
    threshold: f64,
    severity: Severity,
}

impl ErrorRatePolicy {
    pub const NAME: &'static str = "error-rate";

    pub fn new(threshold: f64) -> Self {
        Self { name: Self::NAME.to_owned(), threshold, severity: Severity::Critical }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Policy for ErrorRatePolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    async fn evaluate(
        &self,
        context: &PolicyContext,
    ) -> Result<PolicyEvaluationResult, PolicyError> {
        match finite_signal(context, ERROR_RATE)? {
            None => Ok(PolicyEvaluationResult::compliant(&self.name, self.severity)
                .with_reason("no error-rate signal reported")),
            Some(rate) if rate > self.threshold => Ok(PolicyEvaluationResult::violation(
                &self.name,
                self.severity,
                format!("error rate {rate} exceeds threshold {}", self.threshold),
            )),
            Some(_) => Ok(PolicyEvaluationResult::compliant(&self.name, self.severity)),
        }
    }
}

/// Allows changes only inside `[start, end)` UTC. `start > end` wraps past midnight;
/// `start == end` is an empty window.
#[derive(Clone, Debug)]
pub struct TimeWindowPolicy {
    name: String,
    start: NaiveTime,
    end: NaiveTime,
    severity: Severity,
}

impl TimeWindowPolicy {
    pub const NAME: &'static str = "time-window";

    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { name: Self::NAME.to_owned(), start, end, severity: Severity::Warning }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[async_trait]
impl Policy for TimeWindowPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    async fn evaluate(
        &self,
        context: &PolicyContext,
    ) -> Result<PolicyEvaluationResult, PolicyError> {
        let now = context.evaluated_at.time();
        if self.contains(now) {
            return Ok(PolicyEvaluationResult::compliant(&self.name, self.severity));
        }
        Ok(PolicyEvaluationResult::violation(
            &self.name,
            self.severity,
            format!(
                "{} UTC is outside the change window {}-{}",
                now.format("%H:%M"),
                self.start.format("%H:%M"),
                self.end.format("%H:%M")
            ),
        ))
    }
}

pub struct ConflictPreventionPolicy {
    name: String,
    conflicts: Vec<ExperimentName>,
    lookup: Arc<dyn ExperimentStateLookup>,
    severity: Severity,
}

impl ConflictPreventionPolicy {
    pub const NAME: &'static str = "conflict-prevention";

    pub fn new<I, N>(conflicts: I, lookup: Arc<dyn ExperimentStateLookup>) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<ExperimentName>,
    {
        Self {
            name: Self::NAME.to_owned(),
            conflicts: conflicts.into_iter().map(Into::into).collect(),
            lookup,
            severity: Severity::Error,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Policy for ConflictPreventionPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    async fn evaluate(
        &self,
        context: &PolicyContext,
    ) -> Result<PolicyEvaluationResult, PolicyError> {
        let active: Vec<String> = self
            .conflicts
            .iter()
            .filter(|other| **other != context.experiment)
            .filter_map(|other| {
                self.lookup
                    .recorded_state(other)
                    .filter(|state| !state.is_terminal())
                    .map(|state| format!("{other} ({state})"))
            })
            .collect();

        if active.is_empty() {
            return Ok(PolicyEvaluationResult::compliant(&self.name, self.severity));
        }
        Ok(PolicyEvaluationResult::violation(
            &self.name,
            self.severity,
            format!("conflicting experiments are active: {}", active.join(", ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveTime, TimeZone, Utc};

    use super::{ConflictPreventionPolicy, ErrorRatePolicy, TimeWindowPolicy, TrafficLimitPolicy};
    use crate::domain::experiment::ExperimentName;
    use crate::domain::lifecycle::LifecycleState;
    use crate::domain::policy::{PolicyContext, Severity};
    use crate::lifecycle::ExperimentStateLookup;
    use crate::policies::evaluator::{Policy, PolicyError};

    struct FixedStates(HashMap<ExperimentName, LifecycleState>);

    impl ExperimentStateLookup for FixedStates {
        fn recorded_state(&self, experiment: &ExperimentName) -> Option<LifecycleState> {
            self.0.get(experiment).copied()
        }
    }

    fn hm(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).expect("valid time")
    }

    #[tokio::test]
    async fn traffic_limit_needs_both_conditions() {
        let policy = TrafficLimitPolicy::new(10.0, Duration::from_secs(3600));

        let early_and_high = PolicyContext::new("checkout-test")
            .with_traffic_percent(25.0)
            .with_running_duration(Duration::from_secs(600));
        let result = policy.evaluate(&early_and_high).await.expect("evaluates");
        assert!(!result.compliant);
        assert_eq!(result.severity, Severity::Warning);

        let stable_and_high = PolicyContext::new("checkout-test")
            .with_traffic_percent(25.0)
            .with_running_duration(Duration::from_secs(7200));
        assert!(policy.evaluate(&stable_and_high).await.expect("evaluates").compliant);

        let early_and_low = PolicyContext::new("checkout-test").with_traffic_percent(5.0);
        assert!(policy.evaluate(&early_and_low).await.expect("evaluates").compliant);
    }

    #[tokio::test]
    async fn traffic_limit_treats_missing_duration_as_zero() {
        let policy = TrafficLimitPolicy::new(10.0, Duration::from_secs(1));
        let context = PolicyContext::new("checkout-test").with_traffic_percent(50.0);
        assert!(!policy.evaluate(&context).await.expect("evaluates").compliant);
    }

    #[tokio::test]
    async fn missing_signals_are_compliant() {
        let context = PolicyContext::new("checkout-test");
        let traffic = TrafficLimitPolicy::new(10.0, Duration::from_secs(60))
            .evaluate(&context)
            .await
            .expect("evaluates");
        let errors = ErrorRatePolicy::new(0.05).evaluate(&context).await.expect("evaluates");

        assert!(traffic.compliant);
        assert!(errors.compliant);
        assert_eq!(errors.reason.as_deref(), Some("no error-rate signal reported"));
    }

    #[tokio::test]
    async fn error_rate_is_critical_by_default() {
        let policy = ErrorRatePolicy::new(0.05);
        let result = policy
            .evaluate(&PolicyContext::new("checkout-test").with_error_rate(0.2))
            .await
            .expect("evaluates");
        assert!(result.blocks());

        let softened = ErrorRatePolicy::new(0.05).with_severity(Severity::Warning);
        let result = softened
            .evaluate(&PolicyContext::new("checkout-test").with_error_rate(0.2))
            .await
            .expect("evaluates");
        assert!(!result.compliant);
        assert!(!result.blocks());
    }

    #[tokio::test]
    async fn invalid_signal_is_an_error() {
        let error = ErrorRatePolicy::new(0.05)
            .evaluate(&PolicyContext::new("checkout-test").with_error_rate(f64::NAN))
            .await
            .expect_err("nan is rejected");
        assert!(matches!(error, PolicyError::InvalidSignal { ref signal, .. } if signal == "error_rate"));
    }

    #[tokio::test]
    async fn time_window_is_half_open() {
        let policy = TimeWindowPolicy::new(hm(9, 0), hm(17, 0));
        let at = |hour, minute| {
            PolicyContext::new("checkout-test")
                .at(Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).single().expect("valid"))
        };

        assert!(policy.evaluate(&at(9, 0)).await.expect("evaluates").compliant);
        assert!(policy.evaluate(&at(16, 59)).await.expect("evaluates").compliant);
        let late = policy.evaluate(&at(17, 0)).await.expect("evaluates");
        assert!(!late.compliant);
        assert_eq!(
            late.reason.as_deref(),
            Some("17:00 UTC is outside the change window 09:00-17:00")
        );
    }

    #[test]
    fn time_window_wraps_past_midnight() {
        let overnight = TimeWindowPolicy::new(hm(22, 0), hm(6, 0));
        assert!(overnight.contains(hm(23, 30)));
        assert!(overnight.contains(hm(0, 0)));
        assert!(overnight.contains(hm(5, 59)));
        assert!(!overnight.contains(hm(6, 0)));
        assert!(!overnight.contains(hm(12, 0)));

        let empty = TimeWindowPolicy::new(hm(8, 0), hm(8, 0));
        assert!(!empty.contains(hm(8, 0)));
    }

    #[tokio::test]
    async fn conflict_prevention_only_flags_active_experiments() {
        let lookup = Arc::new(FixedStates(HashMap::from([
            (ExperimentName::from("pricing-test"), LifecycleState::Running),
            (ExperimentName::from("banner-test"), LifecycleState::Archived),
        ])));
        let policy = ConflictPreventionPolicy::new(
            ["checkout-test", "pricing-test", "banner-test", "never-started"],
            lookup,
        );

        let result =
            policy.evaluate(&PolicyContext::new("checkout-test")).await.expect("evaluates");
        assert!(!result.compliant);
        assert_eq!(result.severity, Severity::Error);
        assert_eq!(
            result.reason.as_deref(),
            Some("conflicting experiments are active: pricing-test (running)")
        );
    }

    #[tokio::test]
    async fn conflict_prevention_passes_when_others_are_idle() {
        let lookup = Arc::new(FixedStates(HashMap::from([(
            ExperimentName::from("checkout-test"),
            LifecycleState::Running,
        )])));
        let policy = ConflictPreventionPolicy::new(["checkout-test"], lookup)
            .with_name("checkout-exclusive");

        let result =
            policy.evaluate(&PolicyContext::new("checkout-test")).await.expect("evaluates");
        assert!(result.compliant);
        assert_eq!(result.policy, "checkout-exclusive");
    }
}
