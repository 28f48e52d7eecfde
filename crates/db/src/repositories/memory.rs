use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use labgate_core::backplane::{BackplaneError, GovernanceBackplane, PersistedState};
use labgate_core::domain::approval::ApprovalRecord;
use labgate_core::domain::experiment::ExperimentName;
use labgate_core::domain::lifecycle::{LifecycleState, StateTransition};
use labgate_core::domain::policy::PolicyEvaluationRecord;

/// Process-local backplane with the same token semantics as the SQL store.
#[derive(Default)]
pub struct InMemoryBackplane {
    states: RwLock<HashMap<ExperimentName, PersistedState>>,
    transitions: RwLock<HashMap<ExperimentName, Vec<StateTransition>>>,
    approvals: RwLock<HashMap<ExperimentName, Vec<ApprovalRecord>>>,
    evaluations: RwLock<HashMap<ExperimentName, Vec<PolicyEvaluationRecord>>>,
}

impl InMemoryBackplane {
    pub async fn list_experiments(&self) -> Vec<ExperimentName> {
        let mut names: Vec<_> = self.states.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl GovernanceBackplane for InMemoryBackplane {
    async fn load_state(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Option<PersistedState>, BackplaneError> {
        let states = self.states.read().await;
        Ok(states.get(experiment).cloned())
    }

    async fn save_state(
        &self,
        experiment: &ExperimentName,
        state: LifecycleState,
        expected_token: Option<&str>,
    ) -> Result<String, BackplaneError> {
        let mut states = self.states.write().await;
        let current = states.get(experiment).map(|stored| stored.token.as_str());
        if current != expected_token {
            return Err(BackplaneError::Conflict { experiment: experiment.clone() });
        }

        let token = Uuid::new_v4().to_string();
        states.insert(experiment.clone(), PersistedState { state, token: token.clone() });
        Ok(token)
    }

    async fn append_transition(
        &self,
        transition: &StateTransition,
    ) -> Result<(), BackplaneError> {
        let mut transitions = self.transitions.write().await;
        transitions.entry(transition.experiment.clone()).or_default().push(transition.clone());
        Ok(())
    }

    async fn list_transitions(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<StateTransition>, BackplaneError> {
        let transitions = self.transitions.read().await;
        Ok(transitions.get(experiment).cloned().unwrap_or_default())
    }

    async fn append_approval(&self, record: &ApprovalRecord) -> Result<(), BackplaneError> {
        let mut approvals = self.approvals.write().await;
        approvals.entry(record.experiment.clone()).or_default().push(record.clone());
        Ok(())
    }

    async fn list_approvals(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<ApprovalRecord>, BackplaneError> {
        let approvals = self.approvals.read().await;
        Ok(approvals.get(experiment).cloned().unwrap_or_default())
    }

    async fn append_policy_evaluation(
        &self,
        record: &PolicyEvaluationRecord,
    ) -> Result<(), BackplaneError> {
        let mut evaluations = self.evaluations.write().await;
        evaluations.entry(record.experiment.clone()).or_default().push(record.clone());
        Ok(())
    }

    async fn list_policy_evaluations(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<PolicyEvaluationRecord>, BackplaneError> {
        let evaluations = self.evaluations.read().await;
        Ok(evaluations.get(experiment).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use labgate_core::backplane::{BackplaneError, GovernanceBackplane};
    use labgate_core::domain::experiment::ExperimentName;
    use labgate_core::domain::lifecycle::LifecycleState;

    use super::InMemoryBackplane;

    #[tokio::test]
    async fn token_must_match_the_stored_one() {
        let backplane = InMemoryBackplane::default();
        let name = ExperimentName::new("pricing-page");

        let first =
            backplane.save_state(&name, LifecycleState::PendingApproval, None).await.expect("save");
        assert!(matches!(
            backplane.save_state(&name, LifecycleState::Approved, None).await,
            Err(BackplaneError::Conflict { .. })
        ));
        assert!(matches!(
            backplane.save_state(&name, LifecycleState::Approved, Some("bogus")).await,
            Err(BackplaneError::Conflict { .. })
        ));

        let second = backplane
            .save_state(&name, LifecycleState::Approved, Some(&first))
            .await
            .expect("save with current token");
        let stored = backplane.load_state(&name).await.expect("load").expect("stored");
        assert_eq!(stored.state, LifecycleState::Approved);
        assert_eq!(stored.token, second);
        assert_eq!(backplane.list_experiments().await, vec![name]);
    }

    #[tokio::test]
    async fn unknown_experiments_have_empty_histories() {
        let backplane = InMemoryBackplane::default();
        let name = ExperimentName::new("missing");

        assert_eq!(backplane.load_state(&name).await.expect("load"), None);
        assert!(backplane.list_transitions(&name).await.expect("transitions").is_empty());
        assert!(backplane.list_approvals(&name).await.expect("approvals").is_empty());
        assert!(backplane.list_policy_evaluations(&name).await.expect("evaluations").is_empty());
    }
}
