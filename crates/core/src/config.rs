use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::ApprovalGate;
use crate::audit::AuditPolicy;
use crate::domain::lifecycle::LifecycleState;
use crate::lifecycle::ExperimentStateLookup;
use crate::policies::{
    ConflictPreventionPolicy, ErrorRatePolicy, Policy, TimeWindowPolicy, TrafficLimitPolicy,
};

pub const CONFIG_FILE_NAME: &str = "labgate.toml";
pub const NESTED_CONFIG_FILE: &str = "config/labgate.toml";

const TIME_FORMAT: &str = "%H:%M";

#[derive(Clone, Debug, PartialEq)]
pub struct GovernanceConfig {
    pub database: DatabaseConfig,
    pub audit: AuditConfig,
    pub policies: PoliciesConfig,
    pub approvals: ApprovalsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuditConfig {
    pub mode: AuditMode,
    pub max_attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    BestEffort,
    Disabled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoliciesConfig {
    pub traffic_limit: TrafficLimitConfig,
    pub error_rate: ErrorRateConfig,
    pub time_window: TimeWindowConfig,
    pub conflict_prevention: ConflictPreventionConfig,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrafficLimitConfig {
    pub max_traffic_pct: f64,
    pub min_running_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ErrorRateConfig {
    pub threshold: f64,
}

/// Both bounds unset disables the time-window policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeWindowConfig {
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictPreventionConfig {
    pub experiments: Vec<String>,
}

/// An empty `launch_roles` leaves launches ungated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApprovalsConfig {
    pub launch_roles: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub audit_mode: Option<AuditMode>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://labgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            audit: AuditConfig { mode: AuditMode::BestEffort, max_attempts: 1 },
            policies: PoliciesConfig {
                traffic_limit: TrafficLimitConfig { max_traffic_pct: 10.0, min_running_secs: 3600 },
                error_rate: ErrorRateConfig { threshold: 0.05 },
                time_window: TimeWindowConfig::default(),
                conflict_prevention: ConflictPreventionConfig::default(),
            },
            approvals: ApprovalsConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AuditMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BestEffort => "best_effort",
            Self::Disabled => "disabled",
        }
    }
}

impl std::str::FromStr for AuditMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "best_effort" => Ok(Self::BestEffort),
            "disabled" => Ok(Self::Disabled),
            other => Err(ConfigError::Validation(format!(
                "unsupported audit mode `{other}` (expected best_effort|disabled)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AuditConfig {
    pub fn policy(&self) -> AuditPolicy {
        match self.mode {
            AuditMode::BestEffort => AuditPolicy::BestEffort { max_attempts: self.max_attempts },
            AuditMode::Disabled => AuditPolicy::Disabled,
        }
    }
}

impl GovernanceConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Instantiates the configured built-in policies. Time-window and conflict-prevention
    /// are only included when configured.
    pub fn builtin_policies(
        &self,
        lookup: Arc<dyn ExperimentStateLookup>,
    ) -> Vec<Arc<dyn Policy>> {
        let policies = &self.policies;
        let mut built: Vec<Arc<dyn Policy>> = vec![
            Arc::new(TrafficLimitPolicy::new(
                policies.traffic_limit.max_traffic_pct,
                Duration::from_secs(policies.traffic_limit.min_running_secs),
            )),
            Arc::new(ErrorRatePolicy::new(policies.error_rate.threshold)),
        ];
        if let (Some(start), Some(end)) = (policies.time_window.start, policies.time_window.end) {
            built.push(Arc::new(TimeWindowPolicy::new(start, end)));
        }
        if !policies.conflict_prevention.experiments.is_empty() {
            built.push(Arc::new(ConflictPreventionPolicy::new(
                policies.conflict_prevention.experiments.iter().map(String::as_str),
                lookup,
            )));
        }
        built
    }

    /// Role-based `launch-roles` gates on every edge into Running or Ramping, when
    /// `approvals.launch_roles` is set.
    pub fn approval_gates(&self) -> Vec<(Option<LifecycleState>, LifecycleState, ApprovalGate)> {
        if self.approvals.launch_roles.is_empty() {
            return Vec::new();
        }
        [LifecycleState::Running, LifecycleState::Ramping]
            .into_iter()
            .map(|target| {
                let gate = ApprovalGate::builder("launch-roles")
                    .role_based(self.approvals.launch_roles.iter().cloned());
                (None, target, gate)
            })
            .collect()
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(audit) = patch.audit {
            if let Some(mode) = audit.mode {
                self.audit.mode = mode;
            }
            if let Some(max_attempts) = audit.max_attempts {
                self.audit.max_attempts = max_attempts;
            }
        }

        if let Some(policies) = patch.policies {
            if let Some(traffic) = policies.traffic_limit {
                if let Some(max_traffic_pct) = traffic.max_traffic_pct {
                    self.policies.traffic_limit.max_traffic_pct = max_traffic_pct;
                }
                if let Some(min_running_secs) = traffic.min_running_secs {
                    self.policies.traffic_limit.min_running_secs = min_running_secs;
                }
            }
            if let Some(threshold) = policies.error_rate.and_then(|patch| patch.threshold) {
                self.policies.error_rate.threshold = threshold;
            }
            if let Some(window) = policies.time_window {
                if let Some(start) = window.start {
                    self.policies.time_window.start =
                        Some(parse_time("policies.time_window.start", &start)?);
                }
                if let Some(end) = window.end {
                    self.policies.time_window.end =
                        Some(parse_time("policies.time_window.end", &end)?);
                }
            }
            if let Some(experiments) =
                policies.conflict_prevention.and_then(|patch| patch.experiments)
            {
                self.policies.conflict_prevention.experiments = experiments;
            }
        }

        if let Some(launch_roles) = patch.approvals.and_then(|patch| patch.launch_roles) {
            self.approvals.launch_roles = launch_roles;
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LABGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LABGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("LABGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LABGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("LABGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LABGATE_AUDIT_MODE") {
            self.audit.mode = value.parse()?;
        }
        if let Some(value) = read_env("LABGATE_AUDIT_MAX_ATTEMPTS") {
            self.audit.max_attempts = parse_env("LABGATE_AUDIT_MAX_ATTEMPTS", &value)?;
        }

        if let Some(value) = read_env("LABGATE_POLICIES_TRAFFIC_LIMIT_MAX_TRAFFIC_PCT") {
            self.policies.traffic_limit.max_traffic_pct =
                parse_env("LABGATE_POLICIES_TRAFFIC_LIMIT_MAX_TRAFFIC_PCT", &value)?;
        }
        if let Some(value) = read_env("LABGATE_POLICIES_TRAFFIC_LIMIT_MIN_RUNNING_SECS") {
            self.policies.traffic_limit.min_running_secs =
                parse_env("LABGATE_POLICIES_TRAFFIC_LIMIT_MIN_RUNNING_SECS", &value)?;
        }
        if let Some(value) = read_env("LABGATE_POLICIES_ERROR_RATE_THRESHOLD") {
            self.policies.error_rate.threshold =
                parse_env("LABGATE_POLICIES_ERROR_RATE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("LABGATE_POLICIES_TIME_WINDOW_START") {
            self.policies.time_window.start =
                Some(parse_time("LABGATE_POLICIES_TIME_WINDOW_START", &value)?);
        }
        if let Some(value) = read_env("LABGATE_POLICIES_TIME_WINDOW_END") {
            self.policies.time_window.end =
                Some(parse_time("LABGATE_POLICIES_TIME_WINDOW_END", &value)?);
        }
        if let Some(value) = read_env("LABGATE_POLICIES_CONFLICT_PREVENTION_EXPERIMENTS") {
            self.policies.conflict_prevention.experiments = split_list(&value);
        }
        if let Some(value) = read_env("LABGATE_APPROVALS_LAUNCH_ROLES") {
            self.approvals.launch_roles = split_list(&value);
        }

        let log_level =
            read_env("LABGATE_LOGGING_LEVEL").or_else(|| read_env("LABGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LABGATE_LOGGING_FORMAT").or_else(|| read_env("LABGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(audit_mode) = overrides.audit_mode {
            self.audit.mode = audit_mode;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_audit(&self.audit)?;
        validate_policies(&self.policies)?;
        validate_approvals(&self.approvals)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(CONFIG_FILE_NAME), PathBuf::from(NESTED_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_audit(audit: &AuditConfig) -> Result<(), ConfigError> {
    if audit.mode == AuditMode::BestEffort && !(1..=10).contains(&audit.max_attempts) {
        return Err(ConfigError::Validation(
            "audit.max_attempts must be in range 1..=10 when audit.mode is best_effort"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_policies(policies: &PoliciesConfig) -> Result<(), ConfigError> {
    let traffic = policies.traffic_limit.max_traffic_pct;
    if !traffic.is_finite() || !(0.0..=100.0).contains(&traffic) {
        return Err(ConfigError::Validation(
            "policies.traffic_limit.max_traffic_pct must be in range 0..=100".to_string(),
        ));
    }

    let threshold = policies.error_rate.threshold;
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(ConfigError::Validation(
            "policies.error_rate.threshold must be in range 0..=1".to_string(),
        ));
    }

    match (policies.time_window.start, policies.time_window.end) {
        (Some(start), Some(end)) if start == end => Err(ConfigError::Validation(
            "policies.time_window.start and end must differ (the window would be empty)"
                .to_string(),
        )),
        (Some(_), None) | (None, Some(_)) => Err(ConfigError::Validation(
            "policies.time_window needs both start and end, or neither".to_string(),
        )),
        _ => Ok(()),
    }
}

fn validate_approvals(approvals: &ApprovalsConfig) -> Result<(), ConfigError> {
    if approvals.launch_roles.iter().any(|role| role.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "approvals.launch_roles must not contain blank roles".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty()).map(str::to_string).collect()
}

fn parse_time(key: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT).map_err(|_| {
        ConfigError::Validation(format!("{key} must be a UTC time of day as HH:MM, got `{value}`"))
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    audit: Option<AuditPatch>,
    policies: Option<PoliciesPatch>,
    approvals: Option<ApprovalsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditPatch {
    mode: Option<AuditMode>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PoliciesPatch {
    traffic_limit: Option<TrafficLimitPatch>,
    error_rate: Option<ErrorRatePatch>,
    time_window: Option<TimeWindowPatch>,
    conflict_prevention: Option<ConflictPreventionPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct TrafficLimitPatch {
    max_traffic_pct: Option<f64>,
    min_running_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorRatePatch {
    threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct TimeWindowPatch {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConflictPreventionPatch {
    experiments: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ApprovalsPatch {
    launch_roles: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Arc, Mutex, OnceLock};

    use chrono::NaiveTime;
    use tempfile::TempDir;

    use super::{AuditMode, ConfigError, ConfigOverrides, GovernanceConfig, LoadOptions, LogFormat};
    use crate::audit::AuditPolicy;
    use crate::domain::lifecycle::LifecycleState;
    use crate::lifecycle::LifecycleManager;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    fn write_config(dir: &TempDir, body: &str) -> Result<std::path::PathBuf, String> {
        let path = dir.path().join("labgate.toml");
        fs::write(&path, body).map_err(|err| err.to_string())?;
        Ok(path)
    }

    #[test]
    fn defaults_are_valid_and_best_effort() -> Result<(), String> {
        let config = GovernanceConfig::default();
        config.validate().map_err(|err| err.to_string())?;

        ensure(
            config.audit.policy() == AuditPolicy::BestEffort { max_attempts: 1 },
            "default audit policy should be best effort with one attempt",
        )?;
        ensure(config.logging.format == LogFormat::Compact, "default format should be compact")?;
        ensure(
            config.policies.time_window.start.is_none(),
            "time window should be unset by default",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_LABGATE_DB", "sqlite://interpolated.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = write_config(
                &dir,
                r#"
[database]
url = "${TEST_LABGATE_DB}"

[policies.time_window]
start = "22:00"
end = "06:00"
"#,
            )?;

            let config = GovernanceConfig::load(LoadOptions {
                config_path: Some(path),
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://interpolated.db",
                "database url should be interpolated from the environment",
            )?;
            ensure(
                config.policies.time_window.start == NaiveTime::from_hms_opt(22, 0, 0),
                "time window start should parse from HH:MM",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_LABGATE_DB"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LABGATE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("LABGATE_POLICIES_ERROR_RATE_THRESHOLD", "0.2");
        env::set_var("LABGATE_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = write_config(
                &dir,
                r#"
[database]
url = "sqlite://from-file.db"

[audit]
mode = "best_effort"
max_attempts = 3

[policies.error_rate]
threshold = 0.1

[logging]
level = "warn"
"#,
            )?;

            let config = GovernanceConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    audit_mode: Some(AuditMode::Disabled),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.policies.error_rate.threshold == 0.2, "env threshold should beat file")?;
            ensure(config.logging.level == "warn", "file log level should beat default")?;
            ensure(config.logging.format == LogFormat::Json, "log format alias should apply")?;
            ensure(config.audit.max_attempts == 3, "file max_attempts should apply")?;
            ensure(config.audit.policy() == AuditPolicy::Disabled, "override mode should win")?;
            Ok(())
        })();

        clear_vars(&[
            "LABGATE_DATABASE_URL",
            "LABGATE_POLICIES_ERROR_RATE_THRESHOLD",
            "LABGATE_LOG_FORMAT",
        ]);
        result
    }

    #[test]
    fn invalid_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LABGATE_AUDIT_MAX_ATTEMPTS", "many");

        let result = match GovernanceConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "LABGATE_AUDIT_MAX_ATTEMPTS", "error should name the variable")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected invalid override to fail".to_string()),
        };

        clear_vars(&["LABGATE_AUDIT_MAX_ATTEMPTS"]);
        result
    }

    #[test]
    fn half_configured_time_window_fails_validation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = write_config(&dir, "[policies.time_window]\nstart = \"09:00\"\n")?;

        let error = match GovernanceConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected validation failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::Validation(ref message)
                if message.contains("policies.time_window")),
            "validation failure should mention policies.time_window",
        )
    }

    #[test]
    fn malformed_time_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path =
            write_config(&dir, "[policies.time_window]\nstart = \"9am\"\nend = \"17:00\"\n")?;

        let result =
            GovernanceConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() });
        ensure(
            matches!(result, Err(ConfigError::Validation(ref message)) if message.contains("9am")),
            "malformed time should be reported verbatim",
        )
    }

    #[test]
    fn required_file_must_exist() -> Result<(), String> {
        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let missing = dir.path().join("absent.toml");

        let result = GovernanceConfig::load(LoadOptions {
            config_path: Some(missing.clone()),
            require_file: true,
            ..LoadOptions::default()
        });
        ensure(
            matches!(result, Err(ConfigError::MissingConfigFile(ref path)) if path == &missing),
            "missing required file should be reported",
        )
    }

    #[test]
    fn launch_roles_gate_running_and_ramping() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["LABGATE_APPROVALS_LAUNCH_ROLES"]);

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = write_config(&dir, "[approvals]\nlaunch_roles = [\"lead\", \"sre\"]\n")?;
        let config = GovernanceConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        })
        .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.approvals.launch_roles == ["lead", "sre"], "roles read from file")?;
        let gates = config.approval_gates();
        let edges: Vec<_> =
            gates.iter().map(|(from, to, gate)| (*from, *to, gate.name())).collect();
        ensure(
            edges
                == [
                    (None, LifecycleState::Running, "launch-roles"),
                    (None, LifecycleState::Ramping, "launch-roles"),
                ],
            "one gate per launch edge",
        )?;
        ensure(
            GovernanceConfig::default().approval_gates().is_empty(),
            "no roles configured means no gates",
        )
    }

    #[test]
    fn builtin_policies_follow_configuration() -> Result<(), String> {
        let lookup = Arc::new(LifecycleManager::default());
        let mut config = GovernanceConfig::default();

        let names: Vec<String> = config
            .builtin_policies(lookup.clone())
            .iter()
            .map(|policy| policy.name().to_string())
            .collect();
        ensure(names == ["traffic-limit", "error-rate"], "defaults build two policies")?;

        config.policies.time_window.start = NaiveTime::from_hms_opt(9, 0, 0);
        config.policies.time_window.end = NaiveTime::from_hms_opt(17, 0, 0);
        config.policies.conflict_prevention.experiments = vec!["pricing-test".to_string()];
        let names: Vec<String> = config
            .builtin_policies(lookup)
            .iter()
            .map(|policy| policy.name().to_string())
            .collect();
        ensure(
            names == ["traffic-limit", "error-rate", "time-window", "conflict-prevention"],
            "configured window and conflict set add two more policies",
        )
    }
}
