use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::host;

/// Prefix of the application name every worker connects with. The database
/// name follows it.
pub const WORKER_NAME_PREFIX: &str = "TTL Worker DB ";

/// Type tag reported by workers.
pub const WORKER_TYPE: &str = "TTL Index Worker";

/// PostgreSQL truncates `application_name` to NAMEDATALEN - 1 bytes.
const MAX_APPLICATION_NAME_LEN: usize = 63;

/// Length of the worker id suffix, including the separating space.
const WORKER_ID_SUFFIX_LEN: usize = 9;

/// Application name tag identifying one worker of `database`.
///
/// The tag ends with the first 8 hex digits of the worker id, so a stale
/// session left behind by a dead worker never matches the connections of
/// its successor. The database part is truncated so the suffix survives
/// PostgreSQL's length limit.
pub fn worker_application_name(database: &str, worker_id: Uuid) -> String {
    let mut name = format!("{WORKER_NAME_PREFIX}{database}");
    let budget = MAX_APPLICATION_NAME_LEN - WORKER_ID_SUFFIX_LEN;
    if name.len() > budget {
        let end = name.floor_char_boundary(budget);
        name.truncate(end);
    }
    let id = worker_id.simple().to_string();
    name.push(' ');
    name.push_str(&id[..8]);
    name
}

/// A registered worker for one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSession {
    pub worker_id: Uuid,
    pub database_name: String,
    pub application_name: String,
    /// OS process id of the process hosting the worker.
    pub pid: i64,
    /// Host the worker process runs on.
    pub hostname: String,
    /// Start time of the worker process in clock ticks since boot, where the
    /// platform exposes one. Tells the worker apart from a later process
    /// that reuses its pid.
    pub process_start: Option<i64>,
    pub started_at: DateTime<Utc>,
}

impl WorkerSession {
    /// Whether the recorded worker process is still running on this host.
    pub fn is_local_process_running(&self) -> bool {
        host::is_running(&self.hostname, self.pid, self.process_start)
    }
}

#[derive(Debug, Clone)]
pub struct NewWorkerSession {
    pub worker_id: Uuid,
    pub database_name: String,
    pub application_name: String,
    pub pid: i64,
    pub hostname: String,
    pub process_start: Option<i64>,
}

impl NewWorkerSession {
    pub fn for_current_process(worker_id: Uuid, database_name: &str) -> Self {
        let pid = i64::from(std::process::id());
        Self {
            worker_id,
            database_name: database_name.to_string(),
            application_name: worker_application_name(database_name, worker_id),
            pid,
            hostname: host::hostname().to_string(),
            process_start: host::process_start_time(pid),
        }
    }
}
