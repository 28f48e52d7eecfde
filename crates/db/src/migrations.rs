use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{run_pending, MIGRATOR};
    use crate::{connect_with_settings, DbPool};

    const GOVERNANCE_TABLES: [&str; 4] =
        ["experiment_state", "state_transition", "approval_record", "policy_evaluation"];
    const GOVERNANCE_INDEXES: [&str; 3] = [
        "idx_state_transition_experiment",
        "idx_approval_record_experiment",
        "idx_policy_evaluation_experiment",
    ];

    async fn migrated_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");
        pool
    }

    /// `(type, name, sql)` for every governance table and index, sorted.
    async fn schema(pool: &DbPool) -> Vec<(String, String, String)> {
        let rows = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql FROM sqlite_master
             WHERE type IN ('table', 'index') ORDER BY type, name",
        )
        .fetch_all(pool)
        .await
        .expect("read sqlite_master");

        rows.into_iter()
            .map(|row| {
                let entry: (String, String, String) =
                    (row.get("type"), row.get("name"), row.get("sql"));
                entry
            })
            .filter(|(_, name, _)| {
                GOVERNANCE_TABLES.contains(&name.as_str())
                    || GOVERNANCE_INDEXES.contains(&name.as_str())
            })
            .collect()
    }

    #[tokio::test]
    async fn creates_every_governance_table_and_index() {
        let pool = migrated_pool().await;
        let names: Vec<String> = schema(&pool).await.into_iter().map(|(_, name, _)| name).collect();

        for expected in GOVERNANCE_TABLES.iter().chain(GOVERNANCE_INDEXES.iter()) {
            assert!(names.iter().any(|name| name == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn rerunning_is_a_no_op() {
        let pool = migrated_pool().await;
        let before = schema(&pool).await;
        run_pending(&pool).await.expect("second run");

        assert_eq!(schema(&pool).await, before);
    }

    #[tokio::test]
    async fn full_undo_then_redo_restores_the_same_schema() {
        let pool = migrated_pool().await;
        let original = schema(&pool).await;

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");
        assert!(schema(&pool).await.is_empty(), "undo should drop every governance object");

        run_pending(&pool).await.expect("redo migrations");
        assert_eq!(schema(&pool).await, original);
    }

    #[tokio::test]
    async fn one_state_row_per_experiment() {
        let pool = migrated_pool().await;
        let insert = "INSERT INTO experiment_state (experiment, state, token, updated_at)
                      VALUES ('checkout-test', 'draft', ?, '2026-01-01T00:00:00Z')";

        sqlx::query(insert).bind("a").execute(&pool).await.expect("first insert");
        assert!(sqlx::query(insert).bind("b").execute(&pool).await.is_err());
    }
}
