use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use labgate_core::config::{GovernanceConfig, LoadOptions, CONFIG_FILE_NAME, NESTED_CONFIG_FILE};
use toml::Value;

/// One rendered setting: dotted key, effective value and the env vars that can set it.
struct Setting {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

pub fn run() -> String {
    let config = match GovernanceConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for setting in settings(&config) {
        let source = field_source(
            setting.key,
            setting.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", setting.key, setting.value));
    }
    lines.join("\n")
}

fn settings(config: &GovernanceConfig) -> Vec<Setting> {
    let policies = &config.policies;
    let time = |value: Option<chrono::NaiveTime>| {
        value.map(|time| time.format("%H:%M").to_string()).unwrap_or_else(|| "<unset>".into())
    };
    let conflicts = if policies.conflict_prevention.experiments.is_empty() {
        "<none>".to_string()
    } else {
        policies.conflict_prevention.experiments.join(",")
    };

    vec![
        Setting {
            key: "database.url",
            value: config.database.url.clone(),
            env_keys: &["LABGATE_DATABASE_URL"],
        },
        Setting {
            key: "database.max_connections",
            value: config.database.max_connections.to_string(),
            env_keys: &["LABGATE_DATABASE_MAX_CONNECTIONS"],
        },
        Setting {
            key: "database.timeout_secs",
            value: config.database.timeout_secs.to_string(),
            env_keys: &["LABGATE_DATABASE_TIMEOUT_SECS"],
        },
        Setting {
            key: "audit.mode",
            value: config.audit.mode.as_str().to_string(),
            env_keys: &["LABGATE_AUDIT_MODE"],
        },
        Setting {
            key: "audit.max_attempts",
            value: config.audit.max_attempts.to_string(),
            env_keys: &["LABGATE_AUDIT_MAX_ATTEMPTS"],
        },
        Setting {
            key: "policies.traffic_limit.max_traffic_pct",
            value: policies.traffic_limit.max_traffic_pct.to_string(),
            env_keys: &["LABGATE_POLICIES_TRAFFIC_LIMIT_MAX_TRAFFIC_PCT"],
        },
        Setting {
            key: "policies.traffic_limit.min_running_secs",
            value: policies.traffic_limit.min_running_secs.to_string(),
            env_keys: &["LABGATE_POLICIES_TRAFFIC_LIMIT_MIN_RUNNING_SECS"],
        },
        Setting {
            key: "policies.error_rate.threshold",
            value: policies.error_rate.threshold.to_string(),
            env_keys: &["LABGATE_POLICIES_ERROR_RATE_THRESHOLD"],
        },
        Setting {
            key: "policies.time_window.start",
            value: time(policies.time_window.start),
            env_keys: &["LABGATE_POLICIES_TIME_WINDOW_START"],
        },
        Setting {
            key: "policies.time_window.end",
            value: time(policies.time_window.end),
            env_keys: &["LABGATE_POLICIES_TIME_WINDOW_END"],
        },
        Setting {
            key: "policies.conflict_prevention.experiments",
            value: conflicts,
            env_keys: &["LABGATE_POLICIES_CONFLICT_PREVENTION_EXPERIMENTS"],
        },
        Setting {
            key: "approvals.launch_roles",
            value: if config.approvals.launch_roles.is_empty() {
                "<none>".to_string()
            } else {
                config.approvals.launch_roles.join(",")
            },
            env_keys: &["LABGATE_APPROVALS_LAUNCH_ROLES"],
        },
        Setting {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_keys: &["LABGATE_LOGGING_LEVEL", "LABGATE_LOG_LEVEL"],
        },
        Setting {
            key: "logging.format",
            value: format!("{:?}", config.logging.format).to_ascii_lowercase(),
            env_keys: &["LABGATE_LOGGING_FORMAT", "LABGATE_LOG_FORMAT"],
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from(CONFIG_FILE_NAME), PathBuf::from(NESTED_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if config_file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
        let file_path = config_file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    key_path
        .split('.')
        .try_fold(root, |current, key| current.get(key))
        .is_some()
}
