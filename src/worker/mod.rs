//! The TTL background worker.
//!
//! One worker runs per database. It wakes every `naptime`, deletes rows
//! older than each active policy allows, and goes back to sleep.
//! [`lifecycle`] starts and stops it through a [`crate::supervisor::Supervisor`].

pub mod cleanup;
pub mod lifecycle;
pub mod scheduler;
pub mod settings;
pub mod signals;

pub use cleanup::{CleanupError, CleanupRunResult, TableCleanup, perform_ttl_cleanup};
pub use lifecycle::{LifecycleError, WorkerLifecycle};
pub use scheduler::{WorkerContext, WorkerError, should_perform_cleanup, ttl_worker_main};
pub use settings::{FileSettings, SettingsSource, SharedSettings};
#[cfg(unix)]
pub use signals::forward_os_signals;
pub use signals::{Latch, WaitEvents, WorkerSignal, WorkerSignals};

#[cfg(all(test, feature = "database-sqlite"))]
pub(crate) mod test_support {
    use std::{future::Future, sync::Arc, time::Duration};

    use crate::{
        db::{
            DbPool,
            tests::harness::{SqliteFixtures, create_sqlite_pool, run_sqlite_migrations},
        },
        models::CreateTtlPolicy,
    };

    /// A migrated in-memory database, plus fixtures on the same connection.
    pub async fn sqlite_db() -> (Arc<DbPool>, SqliteFixtures) {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        let fixtures = SqliteFixtures { pool: pool.clone() };
        (Arc::new(DbPool::from_sqlite(pool)), fixtures)
    }

    /// Store a policy without checking the column type.
    pub async fn create_policy(db: &DbPool, table: &str, column: &str, seconds: i64) {
        db.ttl_policies()
            .upsert(&CreateTtlPolicy {
                table_name: table.to_string(),
                column_name: column.to_string(),
                expire_after_seconds: seconds,
            })
            .await
            .expect("Failed to create policy");
    }

    /// Poll `check` until it holds, failing the test after five seconds.
    pub async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check().await {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met within 5s"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
