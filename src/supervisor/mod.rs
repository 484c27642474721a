//! Process supervisor abstraction.
//!
//! The lifecycle manager never starts a worker itself. It hands a
//! [`WorkerDescriptor`] to a [`Supervisor`] and waits on the returned
//! [`WorkerHandle`] for the outcome. [`TaskSupervisor`] hosts workers as
//! tasks of the current process; [`ProcessSupervisor`] runs each one as a
//! separate OS process.

mod process;
mod task;

use std::time::Duration;

use async_trait::async_trait;
pub use process::{ProcessSupervisor, READY_PREFIX};
pub use task::TaskSupervisor;
use tokio::sync::oneshot;

use crate::{
    models::{WORKER_NAME_PREFIX, WORKER_TYPE, WorkerSession},
    worker::WorkerSignal,
};

/// Library name reported in worker descriptors.
pub const WORKER_LIBRARY: &str = "ttl_index";

/// Entry point every descriptor names.
pub const WORKER_ENTRY_POINT: &str = "ttl_worker_main";

/// What a supervisor does when a worker exits with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    After(Duration),
}

/// When a registered worker may begin running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCondition {
    /// Once the database accepts writes.
    RecoveryFinished,
}

/// Everything a supervisor needs to launch one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub name: String,
    pub worker_type: String,
    pub library: String,
    pub entry_point: String,
    pub database: String,
    pub restart: RestartPolicy,
    pub start: StartCondition,
}

impl WorkerDescriptor {
    /// Descriptor for the TTL worker of `database`: never restarted, started
    /// after recovery.
    pub fn for_database(database: &str) -> Self {
        Self {
            name: format!("{WORKER_NAME_PREFIX}{database}"),
            worker_type: WORKER_TYPE.to_string(),
            library: WORKER_LIBRARY.to_string(),
            entry_point: WORKER_ENTRY_POINT.to_string(),
            database: database.to_string(),
            restart: RestartPolicy::Never,
            start: StartCondition::RecoveryFinished,
        }
    }
}

/// How a registered worker's startup ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStatus {
    /// The worker is running under this pid.
    Started(u32),
    /// The worker exited before it was ready.
    Stopped,
    /// The supervisor went away while the worker was starting.
    SupervisorDied,
}

/// Handle to a worker a supervisor accepted.
#[derive(Debug)]
pub struct WorkerHandle {
    pub name: String,
    startup: oneshot::Receiver<StartupStatus>,
}

impl WorkerHandle {
    pub(crate) fn new(name: String, startup: oneshot::Receiver<StartupStatus>) -> Self {
        Self { name, startup }
    }

    /// Wait until the worker is running or has given up.
    ///
    /// A supervisor that drops the handle's sender without reporting is
    /// treated as a stopped worker.
    pub async fn wait_for_startup(self) -> StartupStatus {
        self.startup.await.unwrap_or(StartupStatus::Stopped)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Unknown worker entry point: {0}")]
    UnknownEntryPoint(String),

    #[error("Restart policy {0:?} is not supported by this supervisor")]
    UnsupportedRestartPolicy(RestartPolicy),
}

/// Launches workers and delivers signals to them.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Register a worker. `None` means no slot is free.
    async fn register(
        &self,
        descriptor: WorkerDescriptor,
    ) -> Result<Option<WorkerHandle>, SupervisorError>;

    /// Deliver `signal` to the worker behind `session`. Returns false if
    /// this supervisor could not reach it.
    async fn signal(
        &self,
        session: &WorkerSession,
        signal: WorkerSignal,
    ) -> Result<bool, SupervisorError>;
}

fn check_entry_point(descriptor: &WorkerDescriptor) -> Result<(), SupervisorError> {
    if descriptor.library != WORKER_LIBRARY || descriptor.entry_point != WORKER_ENTRY_POINT {
        return Err(SupervisorError::UnknownEntryPoint(format!(
            "{}::{}",
            descriptor.library, descriptor.entry_point
        )));
    }
    Ok(())
}
