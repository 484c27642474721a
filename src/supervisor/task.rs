//! Supervisor hosting workers as tokio tasks of the current process.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use super::{
    RestartPolicy, StartupStatus, Supervisor, SupervisorError, WorkerDescriptor, WorkerHandle,
    check_entry_point,
};
use crate::{
    db::DbPool,
    models::WorkerSession,
    worker::{SettingsSource, WorkerContext, WorkerError, WorkerSignal, WorkerSignals, ttl_worker_main},
};

/// In-process supervisor.
///
/// Cancelling it with [`TaskSupervisor::shutdown`] is what workers observe
/// as supervisor death.
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<DbPool>,
    settings: Arc<dyn SettingsSource>,
    max_workers: usize,
    /// Signal state of every hosted worker, keyed by worker id.
    slots: Mutex<HashMap<Uuid, Arc<WorkerSignals>>>,
    /// Slots reserved by registrations whose worker has not exited yet.
    reserved: Mutex<usize>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl TaskSupervisor {
    pub fn new(db: Arc<DbPool>, settings: Arc<dyn SettingsSource>, max_workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                settings,
                max_workers,
                slots: Mutex::new(HashMap::new()),
                reserved: Mutex::new(0),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Deliver `signal` to every hosted worker. Returns how many were reached.
    pub fn broadcast(&self, signal: WorkerSignal) -> usize {
        let slots = self.inner.slots.lock();
        for signals in slots.values() {
            signals.deliver(signal);
        }
        slots.len()
    }

    /// Number of workers currently hosted.
    pub fn running(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Stop accepting workers, notify the hosted ones that the supervisor is
    /// gone, and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    fn try_reserve(&self) -> bool {
        let mut reserved = self.inner.reserved.lock();
        if *reserved >= self.inner.max_workers {
            return false;
        }
        *reserved += 1;
        true
    }
}

#[async_trait]
impl Supervisor for TaskSupervisor {
    async fn register(
        &self,
        descriptor: WorkerDescriptor,
    ) -> Result<Option<WorkerHandle>, SupervisorError> {
        check_entry_point(&descriptor)?;

        if self.inner.shutdown.is_cancelled() || !self.try_reserve() {
            tracing::warn!(name = %descriptor.name, "No free worker slot");
            return Ok(None);
        }

        let (status_tx, status_rx) = oneshot::channel();
        let name = descriptor.name.clone();
        self.inner
            .tracker
            .spawn(run_slot(Arc::clone(&self.inner), descriptor, status_tx));

        Ok(Some(WorkerHandle::new(name, status_rx)))
    }

    async fn signal(
        &self,
        session: &WorkerSession,
        signal: WorkerSignal,
    ) -> Result<bool, SupervisorError> {
        match self.inner.slots.lock().get(&session.worker_id) {
            Some(signals) => {
                signals.deliver(signal);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Run one slot: the worker, and its restarts if the policy asks for them.
async fn run_slot(
    inner: Arc<Inner>,
    descriptor: WorkerDescriptor,
    status_tx: oneshot::Sender<StartupStatus>,
) {
    let mut status_tx = Some(status_tx);
    let mut slot = SlotGuard {
        inner: Arc::clone(&inner),
        hosted: None,
    };

    loop {
        let worker_id = Uuid::new_v4();
        let signals = Arc::new(WorkerSignals::new());
        slot.host(worker_id, Arc::clone(&signals));

        let ctx = WorkerContext {
            worker_id,
            database: descriptor.database.clone(),
            db: Arc::clone(&inner.db),
            signals,
            settings: Arc::clone(&inner.settings),
            supervisor_death: inner.shutdown.child_token(),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = ttl_worker_main(ctx, ready_tx);
        tokio::pin!(worker);

        let result = tokio::select! {
            biased;

            result = &mut worker => result,
            ready = ready_rx => {
                if ready.is_ok()
                    && let Some(tx) = status_tx.take()
                {
                    let _ = tx.send(StartupStatus::Started(std::process::id()));
                }
                worker.await
            }
        };

        slot.vacate();

        if let Some(tx) = status_tx.take() {
            let status = match &result {
                Err(WorkerError::SupervisorDied) => StartupStatus::SupervisorDied,
                _ => StartupStatus::Stopped,
            };
            let _ = tx.send(status);
        }

        let delay = match (&result, descriptor.restart) {
            (Err(e), RestartPolicy::After(delay)) if !inner.shutdown.is_cancelled() => {
                tracing::warn!(name = %descriptor.name, error = %e, ?delay, "Restarting worker");
                delay
            }
            _ => break,
        };

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// A reserved slot. Dropping it releases the reservation and forgets the
/// hosted worker, also when the worker panics.
struct SlotGuard {
    inner: Arc<Inner>,
    hosted: Option<Uuid>,
}

impl SlotGuard {
    fn host(&mut self, worker_id: Uuid, signals: Arc<WorkerSignals>) {
        self.inner.slots.lock().insert(worker_id, signals);
        self.hosted = Some(worker_id);
    }

    fn vacate(&mut self) {
        if let Some(worker_id) = self.hosted.take() {
            self.inner.slots.lock().remove(&worker_id);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.vacate();
        *self.inner.reserved.lock() -= 1;
    }
}
