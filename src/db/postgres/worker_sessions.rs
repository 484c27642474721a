use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::WorkerSessionRepo,
    },
    models::{NewWorkerSession, WorkerSession},
};

/// Worker registry backed by a session table. A session is live while a
/// backend tagged with its application name shows up in `pg_stat_activity`.
pub struct PostgresWorkerSessionRepo {
    write_pool: PgPool,
}

impl PostgresWorkerSessionRepo {
    pub fn new(write_pool: PgPool) -> Self {
        Self { write_pool }
    }
}

fn session_from_row(row: &PgRow) -> WorkerSession {
    WorkerSession {
        worker_id: row.get("worker_id"),
        database_name: row.get("database_name"),
        application_name: row.get("application_name"),
        pid: row.get("pid"),
        hostname: row.get("hostname"),
        process_start: row.get("process_start"),
        started_at: row.get("started_at"),
    }
}

#[async_trait]
impl WorkerSessionRepo for PostgresWorkerSessionRepo {
    async fn register(&self, input: NewWorkerSession) -> DbResult<WorkerSession> {
        let mut tx = self.write_pool.begin().await?;

        let pruned = sqlx::query(
            r#"
            DELETE FROM ttl_worker_sessions s
            WHERE s.database_name = $1
              AND NOT EXISTS (
                  SELECT 1 FROM pg_stat_activity a
                  WHERE a.application_name = s.application_name
              )
            "#,
        )
        .bind(&input.database_name)
        .execute(&mut *tx)
        .await?;

        if pruned.rows_affected() > 0 {
            tracing::debug!(
                database = %input.database_name,
                pruned = pruned.rows_affected(),
                "Pruned stale worker sessions"
            );
        }

        let row = sqlx::query(
            r#"
            INSERT INTO ttl_worker_sessions
                (worker_id, database_name, application_name, pid, hostname, process_start)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING worker_id, database_name, application_name, pid, hostname,
                      process_start, started_at
            "#,
        )
        .bind(input.worker_id)
        .bind(&input.database_name)
        .bind(&input.application_name)
        .bind(input.pid)
        .bind(&input.hostname)
        .bind(input.process_start)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => DbError::Conflict(
                format!("A worker for database '{}' is already running", input.database_name),
            ),
            _ => DbError::from(e),
        })?;

        tx.commit().await?;

        Ok(session_from_row(&row))
    }

    async fn deregister(&self, worker_id: Uuid) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM ttl_worker_sessions WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.write_pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_live(&self, database_name: &str) -> DbResult<Vec<WorkerSession>> {
        let rows = sqlx::query(
            r#"
            SELECT s.worker_id, s.database_name, s.application_name, s.pid, s.hostname,
                   s.process_start, s.started_at
            FROM ttl_worker_sessions s
            WHERE s.database_name = $1
              AND EXISTS (
                  SELECT 1 FROM pg_stat_activity a
                  WHERE a.application_name = s.application_name
              )
            ORDER BY s.started_at
            "#,
        )
        .bind(database_name)
        .fetch_all(&self.write_pool)
        .await?;

        Ok(rows.iter().map(session_from_row).collect())
    }
}
