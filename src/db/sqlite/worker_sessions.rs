use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use uuid::Uuid;

use super::common::parse_uuid;
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::WorkerSessionRepo,
    },
    models::{NewWorkerSession, WorkerSession},
};

/// Worker registry backed by a session table. A session is live while its
/// OS process, identified by host, pid and start time, is running.
pub struct SqliteWorkerSessionRepo {
    pool: SqlitePool,
}

impl SqliteWorkerSessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &SqliteRow) -> DbResult<WorkerSession> {
    Ok(WorkerSession {
        worker_id: parse_uuid(&row.get::<String, _>("worker_id"))?,
        database_name: row.get("database_name"),
        application_name: row.get("application_name"),
        pid: row.get("pid"),
        hostname: row.get("hostname"),
        process_start: row.get("process_start"),
        started_at: row.get("started_at"),
    })
}

#[async_trait]
impl WorkerSessionRepo for SqliteWorkerSessionRepo {
    async fn register(&self, input: NewWorkerSession) -> DbResult<WorkerSession> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT worker_id, database_name, application_name, pid, hostname,
                   process_start, started_at
            FROM ttl_worker_sessions
            WHERE database_name = ?
            "#,
        )
        .bind(&input.database_name)
        .fetch_all(&mut *tx)
        .await?;

        for row in &existing {
            let session = session_from_row(row)?;
            if !session.is_local_process_running() {
                tracing::debug!(
                    worker_id = %session.worker_id,
                    pid = session.pid,
                    hostname = %session.hostname,
                    "Pruning stale worker session"
                );
                sqlx::query("DELETE FROM ttl_worker_sessions WHERE worker_id = ?")
                    .bind(session.worker_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO ttl_worker_sessions
                (worker_id, database_name, application_name, pid, hostname,
                 process_start, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(input.worker_id.to_string())
        .bind(&input.database_name)
        .bind(&input.application_name)
        .bind(input.pid)
        .bind(&input.hostname)
        .bind(input.process_start)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => DbError::Conflict(
                format!("A worker for database '{}' is already running", input.database_name),
            ),
            _ => DbError::from(e),
        })?;

        tx.commit().await?;

        Ok(WorkerSession {
            worker_id: input.worker_id,
            database_name: input.database_name,
            application_name: input.application_name,
            pid: input.pid,
            hostname: input.hostname,
            process_start: input.process_start,
            started_at: now,
        })
    }

    async fn deregister(&self, worker_id: Uuid) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM ttl_worker_sessions WHERE worker_id = ?")
            .bind(worker_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_live(&self, database_name: &str) -> DbResult<Vec<WorkerSession>> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, database_name, application_name, pid, hostname,
                   process_start, started_at
            FROM ttl_worker_sessions
            WHERE database_name = ?
            ORDER BY started_at
            "#,
        )
        .bind(database_name)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let session = session_from_row(row)?;
            if session.is_local_process_running() {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}
