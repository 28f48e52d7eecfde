use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditDispatcher, AuditEvent, AuditEventType};
use crate::backplane::{BackplaneError, GovernanceBackplane};
use crate::domain::experiment::ExperimentName;
use crate::domain::lifecycle::{LifecycleState, StateTransition, TransitionRequest};
use crate::errors::GovernanceError;
use crate::lifecycle::table::TransitionTable;
use crate::locking::lock;

/// Read-only view of recorded experiment states, used by policies that look across
/// experiments.
pub trait ExperimentStateLookup: Send + Sync {
    /// `None` when the experiment has no recorded history.
    fn recorded_state(&self, experiment: &ExperimentName) -> Option<LifecycleState>;
}

/// `state` can differ from the last entry of `transitions` after a refresh, when the
/// backplane saved a state whose history append failed.
#[derive(Debug, Default)]
struct ExperimentLog {
    transitions: Vec<StateTransition>,
    state: Option<LifecycleState>,
    token: Option<String>,
}

impl ExperimentLog {
    fn current_state(&self) -> LifecycleState {
        self.state.unwrap_or(LifecycleState::Draft)
    }

    fn push(&mut self, transition: StateTransition) {
        self.state = Some(transition.to);
        self.transitions.push(transition);
    }
}

/// Per-experiment transition logs. The outer lock is only held long enough to find or
/// create an experiment's log; appends serialize on that log's own lock.
#[derive(Debug, Default)]
pub struct TransitionStore {
    experiments: Mutex<HashMap<ExperimentName, Arc<Mutex<ExperimentLog>>>>,
}

impl TransitionStore {
    fn log(&self, experiment: &ExperimentName) -> Arc<Mutex<ExperimentLog>> {
        lock(&self.experiments).entry(experiment.clone()).or_default().clone()
    }

    fn existing(&self, experiment: &ExperimentName) -> Option<Arc<Mutex<ExperimentLog>>> {
        lock(&self.experiments).get(experiment).cloned()
    }

    fn experiments(&self) -> Vec<ExperimentName> {
        let logs: Vec<_> = lock(&self.experiments)
            .iter()
            .map(|(name, log)| (name.clone(), log.clone()))
            .collect();
        let mut names: Vec<_> = logs
            .into_iter()
            .filter(|(_, log)| lock(log).state.is_some())
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }
}

pub struct LifecycleManager {
    table: TransitionTable,
    store: TransitionStore,
    audit: AuditDispatcher,
    backplane: Option<Arc<dyn GovernanceBackplane>>,
}

impl LifecycleManager {
    pub fn new(table: TransitionTable, store: TransitionStore, audit: AuditDispatcher) -> Self {
        Self { table, store, audit, backplane: None }
    }

    /// Makes the backplane the system of record: transitions are saved there (guarded by
    /// its concurrency token) before they are committed locally.
    pub fn with_backplane(mut self, backplane: Arc<dyn GovernanceBackplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn get_state(&self, experiment: &ExperimentName) -> LifecycleState {
        self.recorded_state(experiment).unwrap_or(LifecycleState::Draft)
    }

    pub fn get_history(&self, experiment: &ExperimentName) -> Vec<StateTransition> {
        self.store.existing(experiment).map(|log| lock(&log).transitions.clone()).unwrap_or_default()
    }

    pub fn can_transition(&self, experiment: &ExperimentName, target: LifecycleState) -> bool {
        self.table.permits(self.get_state(experiment), target)
    }

    pub fn allowed_transitions(&self, experiment: &ExperimentName) -> Vec<LifecycleState> {
        self.table.allowed(self.get_state(experiment)).to_vec()
    }

    pub fn list_experiments(&self) -> Vec<ExperimentName> {
        self.store.experiments()
    }

    pub async fn transition(
        &self,
        experiment: &ExperimentName,
        target: LifecycleState,
        request: TransitionRequest,
    ) -> Result<StateTransition, GovernanceError> {
        self.transition_with_cancel(experiment, target, request, &CancellationToken::new()).await
    }

    /// The cancellation token only applies to audit delivery; once validation passes the
    /// commit itself is not interruptible.
    pub async fn transition_with_cancel(
        &self,
        experiment: &ExperimentName,
        target: LifecycleState,
        request: TransitionRequest,
        cancel: &CancellationToken,
    ) -> Result<StateTransition, GovernanceError> {
        self.commit(experiment, None, target, request, cancel).await
    }

    /// Commits `expected_from -> target` only if the experiment is still in
    /// `expected_from`. Callers that evaluated gates or policies for a specific edge use
    /// this so a state change in the meantime surfaces as `ConcurrencyConflict`.
    pub async fn transition_from(
        &self,
        experiment: &ExperimentName,
        expected_from: LifecycleState,
        target: LifecycleState,
        request: TransitionRequest,
        cancel: &CancellationToken,
    ) -> Result<StateTransition, GovernanceError> {
        self.commit(experiment, Some(expected_from), target, request, cancel).await
    }

    async fn commit(
        &self,
        experiment: &ExperimentName,
        expected_from: Option<LifecycleState>,
        target: LifecycleState,
        request: TransitionRequest,
        cancel: &CancellationToken,
    ) -> Result<StateTransition, GovernanceError> {
        let log = self.store.log(experiment);

        let transition = match &self.backplane {
            None => {
                let mut log = lock(&log);
                let current = log.current_state();
                self.check_expected(experiment, expected_from, current, target)?;
                let transition = self.prepare(experiment, current, target, request)?;
                log.push(transition.clone());
                transition
            }
            Some(backplane) => {
                let (current, token) = {
                    let log = lock(&log);
                    (log.current_state(), log.token.clone())
                };
                self.check_expected(experiment, expected_from, current, target)?;
                let transition = self.prepare(experiment, current, target, request)?;
                let new_token = match backplane
                    .save_state(experiment, target, token.as_deref())
                    .await
                {
                    Ok(new_token) => new_token,
                    Err(BackplaneError::Conflict { experiment: conflicted }) => {
                        info!(
                            event_name = "lifecycle.transition.conflict",
                            experiment = %conflicted,
                            from = %current,
                            to = %target,
                            "backplane rejected stale concurrency token"
                        );
                        return Err(GovernanceError::ConcurrencyConflict { experiment: conflicted });
                    }
                    Err(error) => return Err(error.into()),
                };
                if let Err(error) = backplane.append_transition(&transition).await {
                    warn!(
                        event_name = "lifecycle.history.persist_failed",
                        experiment = %experiment,
                        error = %error,
                        "state saved but transition history could not be appended"
                    );
                }

                let mut log = lock(&log);
                log.push(transition.clone());
                log.token = Some(new_token);
                transition
            }
        };

        info!(
            event_name = "lifecycle.transition.committed",
            experiment = %experiment,
            from = %transition.from,
            to = %transition.to,
            actor = transition.actor.as_deref().unwrap_or("unknown"),
            "lifecycle transition committed"
        );

        self.audit.dispatch(transition_event(&transition), cancel).await;
        Ok(transition)
    }

    /// Replaces the local log with the backplane's view. Used after a
    /// `ConcurrencyConflict` before retrying. The persisted state wins over the history
    /// when the two disagree.
    pub async fn refresh(
        &self,
        experiment: &ExperimentName,
    ) -> Result<LifecycleState, GovernanceError> {
        let Some(backplane) = &self.backplane else {
            return Ok(self.get_state(experiment));
        };

        let persisted = backplane.load_state(experiment).await?;
        let transitions = backplane.list_transitions(experiment).await?;

        let history_state = transitions.last().map(|transition| transition.to);
        let state = persisted.as_ref().map(|persisted| persisted.state).or(history_state);
        if history_state.is_some() && state != history_state {
            warn!(
                event_name = "lifecycle.refresh.history_mismatch",
                experiment = %experiment,
                persisted_state = ?state,
                history_state = ?history_state,
                "persisted state disagrees with persisted history; using persisted state"
            );
        }

        let log = self.store.log(experiment);
        let mut log = lock(&log);
        log.transitions = transitions;
        log.state = state;
        log.token = persisted.map(|persisted| persisted.token);
        Ok(log.current_state())
    }

    fn check_expected(
        &self,
        experiment: &ExperimentName,
        expected_from: Option<LifecycleState>,
        current: LifecycleState,
        target: LifecycleState,
    ) -> Result<(), GovernanceError> {
        match expected_from {
            Some(expected) if expected != current => {
                info!(
                    event_name = "lifecycle.transition.state_moved",
                    experiment = %experiment,
                    expected = %expected,
                    current = %current,
                    to = %target,
                    "experiment left the evaluated state before commit"
                );
                Err(GovernanceError::ConcurrencyConflict { experiment: experiment.clone() })
            }
            _ => Ok(()),
        }
    }

    fn prepare(
        &self,
        experiment: &ExperimentName,
        current: LifecycleState,
        target: LifecycleState,
        request: TransitionRequest,
    ) -> Result<StateTransition, GovernanceError> {
        if !self.table.permits(current, target) {
            return Err(GovernanceError::InvalidTransition {
                experiment: experiment.clone(),
                from: current,
                to: target,
                allowed: self.table.allowed(current).to_vec(),
            });
        }

        Ok(StateTransition {
            experiment: experiment.clone(),
            from: current,
            to: target,
            occurred_at: Utc::now(),
            actor: request.actor,
            reason: request.reason,
            metadata: request.metadata,
        })
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(TransitionTable::default(), TransitionStore::default(), AuditDispatcher::default())
    }
}

impl ExperimentStateLookup for LifecycleManager {
    fn recorded_state(&self, experiment: &ExperimentName) -> Option<LifecycleState> {
        let log = self.store.existing(experiment)?;
        let state = lock(&log).state;
        state
    }
}

fn transition_event(transition: &StateTransition) -> AuditEvent {
    let mut event = AuditEvent::new(
        AuditEventType::StateTransition,
        transition.experiment.clone(),
        transition.actor.clone(),
    )
    .with_detail("from", transition.from.as_str())
    .with_detail("to", transition.to.as_str());
    if let Some(reason) = &transition.reason {
        event = event.with_detail("reason", reason.clone());
    }
    for (key, value) in &transition.metadata {
        event = event.with_detail(format!("metadata.{key}"), value.clone());
    }
    event
}
