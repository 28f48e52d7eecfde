use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audit::{AuditDispatcher, AuditEvent, AuditEventType};
use crate::domain::experiment::ExperimentName;
use crate::domain::version::{ConfigurationVersion, VersionDiff, VersionRequest};
use crate::errors::GovernanceError;
use crate::locking::lock;
use crate::versions::diff::{content_hash, diff_payloads};

type VersionLog = Arc<Mutex<Vec<ConfigurationVersion>>>;

#[derive(Debug, Default)]
pub struct VersionStore {
    experiments: Mutex<HashMap<ExperimentName, VersionLog>>,
}

impl VersionStore {
    /// Seeds an experiment's history with versions loaded from elsewhere, replacing any
    /// existing ones. Nothing is validated here; see [`VersionManager::verify_integrity`].
    pub fn restore(&self, experiment: &ExperimentName, versions: Vec<ConfigurationVersion>) {
        let log = self.log(experiment);
        *lock(&log) = versions;
    }

    fn log(&self, experiment: &ExperimentName) -> VersionLog {
        lock(&self.experiments).entry(experiment.clone()).or_default().clone()
    }

    fn existing(&self, experiment: &ExperimentName) -> Option<VersionLog> {
        lock(&self.experiments).get(experiment).cloned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub experiment: ExperimentName,
    pub valid: bool,
    pub verified_versions: usize,
    pub failure_reason: Option<String>,
}

struct Rollback {
    target: u32,
}

pub struct VersionManager {
    store: VersionStore,
    audit: AuditDispatcher,
}

impl VersionManager {
    pub fn new(store: VersionStore, audit: AuditDispatcher) -> Self {
        Self { store, audit }
    }

    pub async fn create_version(
        &self,
        experiment: &ExperimentName,
        payload: Value,
        request: VersionRequest,
    ) -> ConfigurationVersion {
        self.create_version_with_cancel(experiment, payload, request, &CancellationToken::new())
            .await
    }

    /// `cancel` only stops audit delivery; the version is appended either way.
    pub async fn create_version_with_cancel(
        &self,
        experiment: &ExperimentName,
        payload: Value,
        request: VersionRequest,
        cancel: &CancellationToken,
    ) -> ConfigurationVersion {
        let log = self.store.log(experiment);
        let version = {
            let mut log = lock(&log);
            append(&mut log, experiment, payload, request, None)
        };
        self.committed(&version, cancel).await;
        version
    }

    pub fn get_version(
        &self,
        experiment: &ExperimentName,
        version: u32,
    ) -> Option<ConfigurationVersion> {
        let log = self.store.existing(experiment)?;
        let log = lock(&log);
        log.iter().find(|candidate| candidate.version == version).cloned()
    }

    pub fn get_latest_version(&self, experiment: &ExperimentName) -> Option<ConfigurationVersion> {
        let log = self.store.existing(experiment)?;
        let log = lock(&log);
        log.last().cloned()
    }

    /// Ascending by version number.
    pub fn get_all_versions(&self, experiment: &ExperimentName) -> Vec<ConfigurationVersion> {
        self.store.existing(experiment).map(|log| lock(&log).clone()).unwrap_or_default()
    }

    /// `None` when either version does not exist.
    pub fn get_diff(
        &self,
        experiment: &ExperimentName,
        from_version: u32,
        to_version: u32,
    ) -> Option<VersionDiff> {
        let from = self.get_version(experiment, from_version)?;
        let to = self.get_version(experiment, to_version)?;
        Some(VersionDiff {
            experiment: experiment.clone(),
            from_version,
            to_version,
            changes: diff_payloads(&from.payload, &to.payload),
        })
    }

    /// Appends a copy of `target`'s payload as the newest version. The description
    /// defaults to "Rolled back to version N" and the lifecycle snapshot to the target's.
    pub async fn rollback_to_version(
        &self,
        experiment: &ExperimentName,
        target: u32,
        request: VersionRequest,
    ) -> Result<ConfigurationVersion, GovernanceError> {
        let cancel = CancellationToken::new();
        self.rollback_to_version_with_cancel(experiment, target, request, &cancel).await
    }

    pub async fn rollback_to_version_with_cancel(
        &self,
        experiment: &ExperimentName,
        target: u32,
        request: VersionRequest,
        cancel: &CancellationToken,
    ) -> Result<ConfigurationVersion, GovernanceError> {
        let log = self.store.log(experiment);
        let version = {
            let mut log = lock(&log);
            let Some(source) = log.iter().find(|candidate| candidate.version == target).cloned()
            else {
                return Err(GovernanceError::VersionNotFound {
                    experiment: experiment.clone(),
                    version: target,
                });
            };
            let request = VersionRequest {
                actor: request.actor,
                description: Some(
                    request
                        .description
                        .unwrap_or_else(|| format!("Rolled back to version {target}")),
                ),
                lifecycle_state: request.lifecycle_state.or(source.lifecycle_state),
            };
            append(&mut log, experiment, source.payload, request, Some(Rollback { target }))
        };
        self.committed(&version, cancel).await;
        Ok(version)
    }

    /// Recomputes every stored content hash and checks numbering is 1..N without gaps.
    pub fn verify_integrity(&self, experiment: &ExperimentName) -> IntegrityReport {
        let versions = self.get_all_versions(experiment);
        let report = |verified_versions, failure_reason: Option<String>| IntegrityReport {
            experiment: experiment.clone(),
            valid: failure_reason.is_none(),
            verified_versions,
            failure_reason,
        };

        for (index, version) in versions.iter().enumerate() {
            let expected = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            if version.version != expected {
                return report(
                    index,
                    Some(format!("expected version {expected}, found {}", version.version)),
                );
            }
            if content_hash(&version.payload) != version.content_hash {
                return report(index, Some(format!("content hash mismatch at version {expected}")));
            }
            if let Some(source) = version.rolled_back_from {
                if source >= version.version {
                    return report(
                        index,
                        Some(format!(
                            "version {expected} claims to roll back to later version {source}"
                        )),
                    );
                }
            }
        }
        report(versions.len(), None)
    }

    async fn committed(&self, version: &ConfigurationVersion, cancel: &CancellationToken) {
        info!(
            event_name = "versions.created",
            experiment = %version.experiment,
            version = version.version,
            is_rollback = version.is_rollback,
            "configuration version created"
        );

        let mut event = AuditEvent::new(
            AuditEventType::ExperimentModified,
            version.experiment.clone(),
            version.created_by.clone(),
        )
        .with_detail("version", version.version.to_string())
        .with_detail("content_hash", version.content_hash.clone())
        .with_detail("is_rollback", version.is_rollback.to_string());
        if let Some(source) = version.rolled_back_from {
            event = event.with_detail("rolled_back_from", source.to_string());
        }
        if let Some(description) = &version.description {
            event = event.with_detail("description", description.clone());
        }
        self.audit.dispatch(event, cancel).await;
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new(VersionStore::default(), AuditDispatcher::default())
    }
}

fn append(
    log: &mut Vec<ConfigurationVersion>,
    experiment: &ExperimentName,
    payload: Value,
    request: VersionRequest,
    rollback: Option<Rollback>,
) -> ConfigurationVersion {
    let next = log.last().map_or(1, |latest| latest.version.saturating_add(1));
    let version = ConfigurationVersion {
        experiment: experiment.clone(),
        version: next,
        content_hash: content_hash(&payload),
        payload,
        created_at: Utc::now(),
        created_by: request.actor,
        description: request.description,
        lifecycle_state: request.lifecycle_state,
        is_rollback: rollback.is_some(),
        rolled_back_from: rollback.map(|rollback| rollback.target),
    };
    log.push(version.clone());
    version
}
