use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    db::error::DbResult,
    models::{NewWorkerSession, WorkerSession},
};

/// Registry of running workers, at most one per database.
#[async_trait]
pub trait WorkerSessionRepo: Send + Sync {
    /// Register a worker. Sessions whose process is gone are pruned first;
    /// a live session for the same database yields `DbError::Conflict`.
    async fn register(&self, input: NewWorkerSession) -> DbResult<WorkerSession>;

    /// Remove a session. Returns true iff it existed.
    async fn deregister(&self, worker_id: Uuid) -> DbResult<bool>;

    /// Sessions for `database_name` whose process is still alive.
    async fn list_live(&self, database_name: &str) -> DbResult<Vec<WorkerSession>>;
}
