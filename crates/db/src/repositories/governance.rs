use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use uuid::Uuid;

use labgate_core::backplane::{BackplaneError, GovernanceBackplane, PersistedState};
use labgate_core::domain::approval::{ApprovalRecord, ApprovalResult};
use labgate_core::domain::experiment::ExperimentName;
use labgate_core::domain::lifecycle::{LifecycleState, StateTransition};
use labgate_core::domain::policy::{PolicyEvaluationRecord, PolicyEvaluationResult, Severity};

use super::RepositoryError;
use crate::DbPool;

/// SQLite-backed system of record for lifecycle state, transition history, approval
/// verdicts and policy evaluations.
pub struct SqlGovernanceBackplane {
    pool: DbPool,
}

impl SqlGovernanceBackplane {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Every experiment with a stored state, ordered by name.
    pub async fn list_experiments(&self) -> Result<Vec<ExperimentName>, RepositoryError> {
        let rows = sqlx::query("SELECT experiment FROM experiment_state ORDER BY experiment")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| column::<String>(row, "experiment").map(ExperimentName)).collect()
    }

    async fn fetch_state(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Option<PersistedState>, RepositoryError> {
        let row = sqlx::query("SELECT state, token FROM experiment_state WHERE experiment = ?")
            .bind(experiment.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(PersistedState {
                state: parse_state(&column::<String>(&row, "state")?)?,
                token: column(&row, "token")?,
            })
        })
        .transpose()
    }

    /// Returns the number of rows written; zero means the token check failed.
    async fn write_state(
        &self,
        experiment: &ExperimentName,
        state: LifecycleState,
        expected_token: Option<&str>,
        token: &str,
    ) -> Result<u64, RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let result = match expected_token {
            None => {
                sqlx::query(
                    "INSERT INTO experiment_state (experiment, state, token, updated_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(experiment) DO NOTHING",
                )
                .bind(experiment.as_str())
                .bind(state.as_str())
                .bind(token)
                .bind(&now)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    "UPDATE experiment_state
                     SET state = ?, token = ?, updated_at = ?
                     WHERE experiment = ? AND token = ?",
                )
                .bind(state.as_str())
                .bind(token)
                .bind(&now)
                .bind(experiment.as_str())
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn insert_transition(
        &self,
        transition: &StateTransition,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO state_transition
                (experiment, from_state, to_state, occurred_at, actor, reason, metadata_json)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(transition.experiment.as_str())
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.occurred_at.to_rfc3339())
        .bind(&transition.actor)
        .bind(&transition.reason)
        .bind(encode_metadata(&transition.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_transitions(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<StateTransition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT experiment, from_state, to_state, occurred_at, actor, reason, metadata_json
             FROM state_transition
             WHERE experiment = ?
             ORDER BY id",
        )
        .bind(experiment.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_transition).collect()
    }

    async fn insert_approval(&self, record: &ApprovalRecord) -> Result<(), RepositoryError> {
        let result = &record.result;
        sqlx::query(
            "INSERT INTO approval_record
                (experiment, from_state, to_state, actor, gate, approved, reason, approver,
                 decided_at, metadata_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.experiment.as_str())
        .bind(record.from.as_str())
        .bind(record.to.as_str())
        .bind(&record.actor)
        .bind(&result.gate)
        .bind(result.approved)
        .bind(&result.reason)
        .bind(&result.approver)
        .bind(result.decided_at.to_rfc3339())
        .bind(encode_metadata(&result.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_approvals(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<ApprovalRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT experiment, from_state, to_state, actor, gate, approved, reason, approver,
                    decided_at, metadata_json
             FROM approval_record
             WHERE experiment = ?
             ORDER BY id",
        )
        .bind(experiment.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_approval).collect()
    }

    async fn insert_policy_evaluation(
        &self,
        record: &PolicyEvaluationRecord,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO policy_evaluation
                (experiment, current_state, target_state, evaluated_at, policy, compliant,
                 severity, reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.experiment.as_str())
        .bind(record.current_state.map(|state| state.as_str()))
        .bind(record.target_state.map(|state| state.as_str()))
        .bind(record.evaluated_at.to_rfc3339())
        .bind(&record.result.policy)
        .bind(record.result.compliant)
        .bind(record.result.severity.as_str())
        .bind(&record.result.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_policy_evaluations(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<PolicyEvaluationRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT experiment, current_state, target_state, evaluated_at, policy, compliant,
                    severity, reason
             FROM policy_evaluation
             WHERE experiment = ?
             ORDER BY id",
        )
        .bind(experiment.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_policy_evaluation).collect()
    }
}

#[async_trait]
impl GovernanceBackplane for SqlGovernanceBackplane {
    async fn load_state(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Option<PersistedState>, BackplaneError> {
        Ok(self.fetch_state(experiment).await?)
    }

    async fn save_state(
        &self,
        experiment: &ExperimentName,
        state: LifecycleState,
        expected_token: Option<&str>,
    ) -> Result<String, BackplaneError> {
        let token = Uuid::new_v4().to_string();
        let written = self.write_state(experiment, state, expected_token, &token).await?;
        if written == 0 {
            tracing::warn!(
                event_name = "backplane.state.conflict",
                experiment = %experiment,
                target = %state,
                "stale concurrency token rejected"
            );
            return Err(BackplaneError::Conflict { experiment: experiment.clone() });
        }
        Ok(token)
    }

    async fn append_transition(
        &self,
        transition: &StateTransition,
    ) -> Result<(), BackplaneError> {
        Ok(self.insert_transition(transition).await?)
    }

    async fn list_transitions(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<StateTransition>, BackplaneError> {
        Ok(self.select_transitions(experiment).await?)
    }

    async fn append_approval(&self, record: &ApprovalRecord) -> Result<(), BackplaneError> {
        Ok(self.insert_approval(record).await?)
    }

    async fn list_approvals(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<ApprovalRecord>, BackplaneError> {
        Ok(self.select_approvals(experiment).await?)
    }

    async fn append_policy_evaluation(
        &self,
        record: &PolicyEvaluationRecord,
    ) -> Result<(), BackplaneError> {
        Ok(self.insert_policy_evaluation(record).await?)
    }

    async fn list_policy_evaluations(
        &self,
        experiment: &ExperimentName,
    ) -> Result<Vec<PolicyEvaluationRecord>, BackplaneError> {
        Ok(self.select_policy_evaluations(experiment).await?)
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_state(value: &str) -> Result<LifecycleState, RepositoryError> {
    Ok(value.parse::<LifecycleState>()?)
}

fn parse_optional_state(value: Option<String>) -> Result<Option<LifecycleState>, RepositoryError> {
    value.as_deref().map(parse_state).transpose()
}

fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid {field}: {e}")))
}

fn encode_metadata(metadata: &BTreeMap<String, String>) -> Result<String, RepositoryError> {
    serde_json::to_string(metadata).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn decode_metadata(raw: &str) -> Result<BTreeMap<String, String>, RepositoryError> {
    serde_json::from_str(raw)
        .map_err(|e| RepositoryError::Decode(format!("invalid metadata_json: {e}")))
}

fn row_to_transition(row: &SqliteRow) -> Result<StateTransition, RepositoryError> {
    Ok(StateTransition {
        experiment: ExperimentName(column(row, "experiment")?),
        from: parse_state(&column::<String>(row, "from_state")?)?,
        to: parse_state(&column::<String>(row, "to_state")?)?,
        occurred_at: parse_timestamp(&column::<String>(row, "occurred_at")?, "occurred_at")?,
        actor: column(row, "actor")?,
        reason: column(row, "reason")?,
        metadata: decode_metadata(&column::<String>(row, "metadata_json")?)?,
    })
}

fn row_to_approval(row: &SqliteRow) -> Result<ApprovalRecord, RepositoryError> {
    Ok(ApprovalRecord {
        experiment: ExperimentName(column(row, "experiment")?),
        from: parse_state(&column::<String>(row, "from_state")?)?,
        to: parse_state(&column::<String>(row, "to_state")?)?,
        actor: column(row, "actor")?,
        result: ApprovalResult {
            gate: column(row, "gate")?,
            approved: column(row, "approved")?,
            reason: column(row, "reason")?,
            approver: column(row, "approver")?,
            decided_at: parse_timestamp(&column::<String>(row, "decided_at")?, "decided_at")?,
            metadata: decode_metadata(&column::<String>(row, "metadata_json")?)?,
        },
    })
}

fn row_to_policy_evaluation(row: &SqliteRow) -> Result<PolicyEvaluationRecord, RepositoryError> {
    let severity: String = column(row, "severity")?;
    Ok(PolicyEvaluationRecord {
        experiment: ExperimentName(column(row, "experiment")?),
        current_state: parse_optional_state(column(row, "current_state")?)?,
        target_state: parse_optional_state(column(row, "target_state")?)?,
        evaluated_at: parse_timestamp(&column::<String>(row, "evaluated_at")?, "evaluated_at")?,
        result: PolicyEvaluationResult {
            policy: column(row, "policy")?,
            compliant: column(row, "compliant")?,
            reason: column(row, "reason")?,
            severity: severity.parse::<Severity>()?,
        },
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use labgate_core::backplane::{BackplaneError, GovernanceBackplane};
    use labgate_core::domain::approval::{ApprovalRecord, ApprovalResult};
    use labgate_core::domain::experiment::ExperimentName;
    use labgate_core::domain::lifecycle::{LifecycleState, StateTransition};
    use labgate_core::domain::policy::{
        PolicyEvaluationRecord, PolicyEvaluationResult, Severity,
    };

    use super::SqlGovernanceBackplane;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlGovernanceBackplane {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlGovernanceBackplane::new(pool)
    }

    fn name() -> ExperimentName {
        ExperimentName::new("checkout-flow")
    }

    #[tokio::test]
    async fn first_save_requires_absent_state() {
        let backplane = setup().await;
        assert_eq!(backplane.load_state(&name()).await.expect("load"), None);

        let token = backplane
            .save_state(&name(), LifecycleState::PendingApproval, None)
            .await
            .expect("first save");
        let stored = backplane.load_state(&name()).await.expect("load").expect("stored");
        assert_eq!(stored.state, LifecycleState::PendingApproval);
        assert_eq!(stored.token, token);

        let second = backplane.save_state(&name(), LifecycleState::Approved, None).await;
        assert_eq!(second, Err(BackplaneError::Conflict { experiment: name() }));
    }

    #[tokio::test]
    async fn stale_token_is_rejected_and_state_is_unchanged() {
        let backplane = setup().await;
        let first = backplane
            .save_state(&name(), LifecycleState::PendingApproval, None)
            .await
            .expect("first save");
        let second = backplane
            .save_state(&name(), LifecycleState::Approved, Some(&first))
            .await
            .expect("second save");
        assert_ne!(first, second);

        let stale = backplane.save_state(&name(), LifecycleState::Running, Some(&first)).await;
        assert!(matches!(stale, Err(BackplaneError::Conflict { .. })));

        let stored = backplane.load_state(&name()).await.expect("load").expect("stored");
        assert_eq!(stored.state, LifecycleState::Approved);
        assert_eq!(stored.token, second);
        assert_eq!(backplane.list_experiments().await.expect("list"), vec![name()]);
    }

    #[tokio::test]
    async fn transitions_come_back_in_append_order() {
        let backplane = setup().await;
        let occurred_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().expect("time");
        let first = StateTransition {
            experiment: name(),
            from: LifecycleState::Draft,
            to: LifecycleState::PendingApproval,
            occurred_at,
            actor: Some("dana".to_string()),
            reason: Some("ready for review".to_string()),
            metadata: [("ticket".to_string(), "EXP-42".to_string())].into_iter().collect(),
        };
        let second = StateTransition {
            from: LifecycleState::PendingApproval,
            to: LifecycleState::Approved,
            actor: None,
            reason: None,
            metadata: Default::default(),
            ..first.clone()
        };

        backplane.append_transition(&first).await.expect("append first");
        backplane.append_transition(&second).await.expect("append second");

        let listed = backplane.list_transitions(&name()).await.expect("list");
        assert_eq!(listed, vec![first, second]);
        assert!(backplane
            .list_transitions(&ExperimentName::new("other"))
            .await
            .expect("list other")
            .is_empty());
    }

    #[tokio::test]
    async fn approval_and_policy_records_are_persisted() {
        let backplane = setup().await;
        let decided_at = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).single().expect("time");
        let approval = ApprovalRecord {
            experiment: name(),
            from: LifecycleState::PendingApproval,
            to: LifecycleState::Approved,
            actor: Some("dana".to_string()),
            result: ApprovalResult {
                decided_at,
                ..ApprovalResult::deny("manual-review", "awaiting decision")
                    .with_metadata("status", "pending")
            },
        };
        backplane.append_approval(&approval).await.expect("append approval");
        assert_eq!(backplane.list_approvals(&name()).await.expect("list"), vec![approval]);

        let evaluation = PolicyEvaluationRecord {
            experiment: name(),
            current_state: Some(LifecycleState::Approved),
            target_state: None,
            evaluated_at: decided_at,
            result: PolicyEvaluationResult::violation(
                "error-rate",
                Severity::Critical,
                "error rate 0.20 exceeds 0.05",
            ),
        };
        backplane.append_policy_evaluation(&evaluation).await.expect("append evaluation");
        assert_eq!(
            backplane.list_policy_evaluations(&name()).await.expect("list"),
            vec![evaluation]
        );
    }

    #[tokio::test]
    async fn corrupt_rows_surface_as_storage_errors() {
        let backplane = setup().await;
        sqlx::query(
            "INSERT INTO experiment_state (experiment, state, token, updated_at)
             VALUES ('checkout-flow', 'launched', 't', '2026-01-01T00:00:00Z')",
        )
        .execute(backplane.pool())
        .await
        .expect("insert corrupt row");

        let loaded = backplane.load_state(&name()).await;
        assert!(matches!(
            loaded,
            Err(BackplaneError::Storage(message)) if message.contains("launched")
        ));
    }

    #[tokio::test]
    async fn unknown_severity_is_a_decode_error() {
        let backplane = setup().await;
        sqlx::query(
            "INSERT INTO policy_evaluation
                (experiment, current_state, target_state, evaluated_at, policy, compliant,
                 severity, reason)
             VALUES ('checkout-flow', NULL, NULL, '2026-01-01T00:00:00Z', 'error-rate', 0,
                     'fatal', 'too many errors')",
        )
        .execute(backplane.pool())
        .await
        .expect("insert corrupt row");

        let loaded = backplane.list_policy_evaluations(&name()).await;
        assert!(matches!(
            loaded,
            Err(BackplaneError::Storage(message))
                if message == "decode error: unknown severity `fatal`"
        ));
    }
}
