//! A single cleanup pass: expire rows for every active policy inside one
//! transaction.

use std::time::{Duration, Instant};

use crate::{
    db::{CleanupTransaction, DbError, TtlPolicyRepo},
    observability::metrics,
};

/// Rows deleted from one policy's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCleanup {
    pub table_name: String,
    pub column_name: String,
    pub rows_deleted: u64,
}

/// Results from a single committed cleanup pass.
#[derive(Debug, Default, Clone)]
pub struct CleanupRunResult {
    /// False when the policy table was gone and nothing ran.
    pub installed: bool,
    pub tables: Vec<TableCleanup>,
    pub duration: Duration,
}

impl CleanupRunResult {
    pub fn policies_processed(&self) -> usize {
        self.tables.len()
    }

    /// Total number of rows deleted across all tables.
    pub fn total(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_deleted).sum()
    }

    pub fn has_deletions(&self) -> bool {
        self.total() > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("Failed to start cleanup transaction: {0}")]
    Begin(#[source] DbError),

    #[error("Failed to expire rows of {table}.{column}: {source}")]
    Expire {
        table: String,
        column: String,
        #[source]
        source: DbError,
    },

    #[error("Cleanup pass failed: {0}")]
    Db(#[from] DbError),
}

/// Run one cleanup pass.
///
/// Either every active policy is applied and the transaction commits, or the
/// first failure aborts the whole pass: the transaction is rolled back and
/// the error returned. A failing rollback is logged and otherwise ignored.
pub async fn perform_ttl_cleanup(
    policies: &dyn TtlPolicyRepo,
) -> Result<CleanupRunResult, CleanupError> {
    let started = Instant::now();

    let mut tx = policies.begin_cleanup().await.map_err(CleanupError::Begin)?;

    let expired = expire_all(tx.as_mut()).await;
    let outcome = match expired {
        Ok(result) => tx.commit().await.map(|()| result).map_err(CleanupError::from),
        Err(e) => {
            abort(tx).await;
            Err(e)
        }
    };

    let elapsed = started.elapsed();
    match outcome {
        Ok(mut result) => {
            result.duration = elapsed;
            if result.installed {
                for table in &result.tables {
                    metrics::record_rows_deleted(&table.table_name, table.rows_deleted);
                }
                metrics::record_cleanup_pass("success", elapsed.as_secs_f64());
            } else {
                metrics::record_cleanup_pass("not_installed", elapsed.as_secs_f64());
            }
            Ok(result)
        }
        Err(e) => {
            metrics::record_cleanup_pass("error", elapsed.as_secs_f64());
            Err(e)
        }
    }
}

async fn expire_all(tx: &mut dyn CleanupTransaction) -> Result<CleanupRunResult, CleanupError> {
    let mut result = CleanupRunResult::default();

    // The policy table can vanish under a running worker
    if !tx.policy_table_installed().await? {
        tracing::debug!("Policy table not installed, skipping cleanup");
        return Ok(result);
    }
    result.installed = true;

    for policy in tx.active_policies().await? {
        let rows_deleted =
            tx.expire_rows(&policy)
                .await
                .map_err(|source| CleanupError::Expire {
                    table: policy.table_name.clone(),
                    column: policy.column_name.clone(),
                    source,
                })?;

        tracing::debug!(
            table = %policy.table_name,
            column = %policy.column_name,
            expire_after_seconds = policy.expire_after_seconds,
            rows_deleted,
            "Expired rows"
        );

        result.tables.push(TableCleanup {
            table_name: policy.table_name,
            column_name: policy.column_name,
            rows_deleted,
        });
    }

    Ok(result)
}

/// Best-effort rollback after a failed pass.
async fn abort(tx: Box<dyn CleanupTransaction>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Failed to roll back cleanup transaction");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        db::DbResult,
        models::{CreateTtlPolicy, TtlPolicy},
    };

    /// Repo whose transactions fail on demand.
    #[derive(Default)]
    struct FailingRepo {
        fail_rollback: bool,
        committed: Arc<AtomicBool>,
        rolled_back: Arc<AtomicBool>,
    }

    struct FailingTransaction {
        fail_rollback: bool,
        committed: Arc<AtomicBool>,
        rolled_back: Arc<AtomicBool>,
    }

    fn policy(table: &str) -> TtlPolicy {
        TtlPolicy {
            table_name: table.to_string(),
            column_name: "created_at".to_string(),
            expire_after_seconds: 60,
            active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[async_trait]
    impl TtlPolicyRepo for FailingRepo {
        async fn upsert(&self, _input: &CreateTtlPolicy) -> DbResult<TtlPolicy> {
            unimplemented!()
        }
        async fn delete(&self, _table: &str, _column: &str) -> DbResult<bool> {
            unimplemented!()
        }
        async fn get(&self, _table: &str, _column: &str) -> DbResult<Option<TtlPolicy>> {
            unimplemented!()
        }
        async fn list(&self) -> DbResult<Vec<TtlPolicy>> {
            unimplemented!()
        }
        async fn column_type(&self, _table: &str, _column: &str) -> DbResult<Option<String>> {
            unimplemented!()
        }
        async fn begin_cleanup(&self) -> DbResult<Box<dyn CleanupTransaction>> {
            Ok(Box::new(FailingTransaction {
                fail_rollback: self.fail_rollback,
                committed: Arc::clone(&self.committed),
                rolled_back: Arc::clone(&self.rolled_back),
            }))
        }
    }

    #[async_trait]
    impl CleanupTransaction for FailingTransaction {
        async fn policy_table_installed(&mut self) -> DbResult<bool> {
            Ok(true)
        }
        async fn active_policies(&mut self) -> DbResult<Vec<TtlPolicy>> {
            Ok(vec![policy("accounts"), policy("broken")])
        }
        async fn expire_rows(&mut self, policy: &TtlPolicy) -> DbResult<u64> {
            if policy.table_name == "broken" {
                Err(DbError::Internal("relation \"broken\" does not exist".into()))
            } else {
                Ok(3)
            }
        }
        async fn commit(self: Box<Self>) -> DbResult<()> {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(self: Box<Self>) -> DbResult<()> {
            self.rolled_back.store(true, Ordering::SeqCst);
            if self.fail_rollback {
                Err(DbError::Internal("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_mid_pass_error_rolls_back() {
        let repo = FailingRepo::default();

        let err = perform_ttl_cleanup(&repo).await.unwrap_err();

        assert!(
            matches!(err, CleanupError::Expire { ref table, .. } if table == "broken"),
            "got: {err}"
        );
        assert!(repo.rolled_back.load(Ordering::SeqCst));
        assert!(!repo.committed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rollback_failure_is_swallowed() {
        let repo = FailingRepo {
            fail_rollback: true,
            ..Default::default()
        };

        // The original failure is reported, not the rollback failure
        let err = perform_ttl_cleanup(&repo).await.unwrap_err();
        assert!(matches!(err, CleanupError::Expire { .. }), "got: {err}");
        assert!(repo.rolled_back.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_result_totals() {
        let result = CleanupRunResult {
            installed: true,
            tables: vec![
                TableCleanup {
                    table_name: "orders".into(),
                    column_name: "created_at".into(),
                    rows_deleted: 2,
                },
                TableCleanup {
                    table_name: "sessions".into(),
                    column_name: "seen_at".into(),
                    rows_deleted: 0,
                },
            ],
            duration: Duration::ZERO,
        };
        assert_eq!(result.policies_processed(), 2);
        assert_eq!(result.total(), 2);
        assert!(result.has_deletions());
        assert!(!CleanupRunResult::default().has_deletions());
    }

    #[cfg(feature = "database-sqlite")]
    mod sqlite {
        use super::*;
        use crate::{
            db::tests::harness::Fixtures,
            worker::test_support::{create_policy, sqlite_db},
        };

        #[tokio::test]
        async fn test_orders_example() {
            let (db, fixtures) = sqlite_db().await;
            fixtures.create_table("orders").await;
            fixtures.insert_aged("orders", 1, 90_000).await;
            fixtures.insert_aged("orders", 2, 10_000).await;
            create_policy(&db, "orders", "created_at", 86_400).await;

            let result = perform_ttl_cleanup(db.ttl_policies().as_ref())
                .await
                .unwrap();

            assert!(result.installed);
            assert_eq!(result.policies_processed(), 1);
            assert_eq!(result.total(), 1);
            assert_eq!(fixtures.ids("orders").await, vec![2]);
        }

        #[tokio::test]
        async fn test_mid_pass_error_deletes_nothing() {
            let (db, fixtures) = sqlite_db().await;
            fixtures.create_table("accounts").await;
            fixtures.insert_aged("accounts", 1, 90_000).await;
            create_policy(&db, "accounts", "created_at", 60).await;
            fixtures.create_table("zz_dropped").await;
            create_policy(&db, "zz_dropped", "created_at", 60).await;
            fixtures.execute(r#"DROP TABLE "zz_dropped""#).await;

            let result = perform_ttl_cleanup(db.ttl_policies().as_ref()).await;

            assert!(
                matches!(result, Err(CleanupError::Expire { ref table, .. }) if table == "zz_dropped")
            );
            assert_eq!(fixtures.ids("accounts").await, vec![1]);

            // Policies are untouched for the next pass
            let policies = db.ttl_policies().list().await.unwrap();
            assert_eq!(policies.len(), 2);
            assert!(policies.iter().all(|p| p.active));
        }

        #[tokio::test]
        async fn test_missing_policy_table_is_noop() {
            let (db, fixtures) = sqlite_db().await;
            fixtures.execute("DROP TABLE ttl_index_table").await;

            let result = perform_ttl_cleanup(db.ttl_policies().as_ref())
                .await
                .unwrap();

            assert!(!result.installed);
            assert_eq!(result.policies_processed(), 0);
        }
    }
}
