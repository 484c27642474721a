//! Starting and stopping the worker of the connected database.

use std::sync::Arc;

use crate::{
    db::{DbError, DbPool},
    supervisor::{StartupStatus, Supervisor, SupervisorError, WorkerDescriptor},
    worker::WorkerSignal,
};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Cannot start TTL worker while the database is in recovery")]
    RecoveryInProgress,

    #[error("Supervisor died while starting the TTL worker")]
    SupervisorDied,

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Db(#[from] DbError),
}

pub struct WorkerLifecycle {
    db: Arc<DbPool>,
    supervisor: Arc<dyn Supervisor>,
}

impl WorkerLifecycle {
    pub fn new(db: Arc<DbPool>, supervisor: Arc<dyn Supervisor>) -> Self {
        Self { db, supervisor }
    }

    /// Start the worker for the connected database.
    ///
    /// Returns true if a worker is running afterwards, including one that
    /// was already running. Returns false if the supervisor had no free
    /// slot or the worker stopped during startup.
    pub async fn start(&self) -> Result<bool, LifecycleError> {
        if self.db.in_recovery().await? {
            return Err(LifecycleError::RecoveryInProgress);
        }

        let database = self.db.current_database().await?;
        if !self
            .db
            .worker_sessions()
            .list_live(&database)
            .await?
            .is_empty()
        {
            tracing::debug!(database = %database, "TTL worker already running");
            return Ok(true);
        }

        let descriptor = WorkerDescriptor::for_database(&database);
        let Some(handle) = self.supervisor.register(descriptor).await? else {
            return Ok(false);
        };

        match handle.wait_for_startup().await {
            StartupStatus::Started(pid) => {
                tracing::info!(database = %database, pid, "TTL worker started");
                Ok(true)
            }
            StartupStatus::Stopped => {
                tracing::warn!(database = %database, "TTL worker stopped during startup");
                Ok(false)
            }
            StartupStatus::SupervisorDied => Err(LifecycleError::SupervisorDied),
        }
    }

    /// Ask every live worker of the connected database to terminate.
    ///
    /// Returns true iff at least one worker was signalled. Doesn't wait for
    /// the workers to exit.
    pub async fn stop(&self) -> Result<bool, LifecycleError> {
        self.signal_live(WorkerSignal::Terminate).await
    }

    /// Ask every live worker of the connected database to reload its
    /// settings. Returns true iff at least one worker was signalled.
    pub async fn reload(&self) -> Result<bool, LifecycleError> {
        self.signal_live(WorkerSignal::Reload).await
    }

    async fn signal_live(&self, signal: WorkerSignal) -> Result<bool, LifecycleError> {
        let database = self.db.current_database().await?;
        let sessions = self.db.worker_sessions().list_live(&database).await?;

        let mut signalled = false;
        for session in &sessions {
            if self.supervisor.signal(session, signal).await? {
                tracing::info!(
                    database = %database,
                    pid = session.pid,
                    ?signal,
                    "Signalled TTL worker"
                );
                signalled = true;
            }
        }
        Ok(signalled)
    }
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::oneshot;
    use uuid::Uuid;

    use super::*;
    use crate::{
        config::WorkerSettings,
        db::tests::harness::Fixtures,
        models::{NewWorkerSession, WorkerSession},
        supervisor::{TaskSupervisor, WorkerHandle},
        worker::{SharedSettings, test_support::sqlite_db},
    };

    /// Reports a fixed startup outcome without running anything.
    struct ScriptedSupervisor {
        startup: Option<StartupStatus>,
        registered: AtomicUsize,
        signalled: AtomicUsize,
    }

    impl ScriptedSupervisor {
        fn new(startup: Option<StartupStatus>) -> Arc<Self> {
            Arc::new(Self {
                startup,
                registered: AtomicUsize::new(0),
                signalled: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Supervisor for ScriptedSupervisor {
        async fn register(
            &self,
            descriptor: WorkerDescriptor,
        ) -> Result<Option<WorkerHandle>, SupervisorError> {
            self.registered.fetch_add(1, Ordering::SeqCst);
            let Some(status) = self.startup else {
                return Ok(None);
            };
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(status);
            Ok(Some(WorkerHandle::new(descriptor.name, rx)))
        }

        async fn signal(
            &self,
            _session: &WorkerSession,
            _signal: WorkerSignal,
        ) -> Result<bool, SupervisorError> {
            self.signalled.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_start_maps_startup_status() {
        let cases = [
            (Some(StartupStatus::Started(42)), Some(true)),
            (Some(StartupStatus::Stopped), Some(false)),
            (None, Some(false)),
            (Some(StartupStatus::SupervisorDied), None),
        ];

        for (startup, expected) in cases {
            let (db, _fixtures) = sqlite_db().await;
            let supervisor = ScriptedSupervisor::new(startup);
            let lifecycle = WorkerLifecycle::new(db, supervisor.clone());

            match (lifecycle.start().await, expected) {
                (Ok(started), Some(want)) => assert_eq!(started, want, "{startup:?}"),
                (Err(LifecycleError::SupervisorDied), None) => {}
                (other, _) => panic!("unexpected result for {startup:?}: {other:?}"),
            }
            assert_eq!(supervisor.registered.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_start_with_live_worker_is_noop() {
        let (db, _fixtures) = sqlite_db().await;
        let database = db.current_database().await.unwrap();
        db.worker_sessions()
            .register(NewWorkerSession::for_current_process(Uuid::new_v4(), &database))
            .await
            .unwrap();

        let supervisor = ScriptedSupervisor::new(Some(StartupStatus::Stopped));
        let lifecycle = WorkerLifecycle::new(db, supervisor.clone());

        assert!(lifecycle.start().await.unwrap());
        assert_eq!(supervisor.registered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_ignores_session_of_exited_process() {
        let (db, _fixtures) = sqlite_db().await;
        let database = db.current_database().await.unwrap();
        let own = NewWorkerSession::for_current_process(Uuid::new_v4(), &database);
        // Our pid, but recorded for a process that started at another time
        db.worker_sessions()
            .register(NewWorkerSession {
                process_start: Some(own.process_start.unwrap_or(0) + 1),
                ..own
            })
            .await
            .unwrap();

        let supervisor = ScriptedSupervisor::new(Some(StartupStatus::Stopped));
        let lifecycle = WorkerLifecycle::new(Arc::clone(&db), supervisor.clone());

        assert!(!lifecycle.start().await.unwrap());
        assert_eq!(supervisor.registered.load(Ordering::SeqCst), 1);
        assert!(!lifecycle.stop().await.unwrap());
        assert_eq!(supervisor.signalled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_in_recovery_fails() {
        let (db, fixtures) = sqlite_db().await;
        fixtures.execute("PRAGMA query_only = ON").await;

        let supervisor = ScriptedSupervisor::new(Some(StartupStatus::Started(1)));
        let lifecycle = WorkerLifecycle::new(db, supervisor.clone());

        assert!(matches!(
            lifecycle.start().await,
            Err(LifecycleError::RecoveryInProgress)
        ));
        assert_eq!(supervisor.registered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_signals_live_workers() {
        let (db, _fixtures) = sqlite_db().await;
        let supervisor = ScriptedSupervisor::new(None);
        let lifecycle = WorkerLifecycle::new(Arc::clone(&db), supervisor.clone());

        assert!(!lifecycle.stop().await.unwrap());
        assert_eq!(supervisor.signalled.load(Ordering::SeqCst), 0);

        let database = db.current_database().await.unwrap();
        db.worker_sessions()
            .register(NewWorkerSession::for_current_process(Uuid::new_v4(), &database))
            .await
            .unwrap();

        assert!(lifecycle.stop().await.unwrap());
        assert!(lifecycle.reload().await.unwrap());
        assert_eq!(supervisor.signalled.load(Ordering::SeqCst), 2);
    }

    fn task_supervisor(db: &Arc<DbPool>) -> Arc<TaskSupervisor> {
        let settings = SharedSettings::new(WorkerSettings {
            naptime: Duration::from_secs(3600),
            enabled: true,
        });
        Arc::new(TaskSupervisor::new(Arc::clone(db), Arc::new(settings), 4))
    }

    #[tokio::test]
    async fn test_start_twice_runs_one_worker() {
        let (db, _fixtures) = sqlite_db().await;
        let supervisor = task_supervisor(&db);
        let lifecycle = WorkerLifecycle::new(Arc::clone(&db), supervisor.clone());

        assert!(lifecycle.start().await.unwrap());
        assert!(lifecycle.start().await.unwrap());
        assert_eq!(supervisor.running(), 1);

        let database = db.current_database().await.unwrap();
        assert_eq!(db.worker_sessions().list_live(&database).await.unwrap().len(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_without_worker_returns_false() {
        let (db, _fixtures) = sqlite_db().await;
        let supervisor = task_supervisor(&db);
        let lifecycle = WorkerLifecycle::new(db, supervisor);

        assert!(!lifecycle.stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_after_start_terminates_worker() {
        let (db, _fixtures) = sqlite_db().await;
        let supervisor = task_supervisor(&db);
        let lifecycle = WorkerLifecycle::new(Arc::clone(&db), supervisor.clone());

        assert!(lifecycle.start().await.unwrap());
        assert!(lifecycle.stop().await.unwrap());

        // Stop doesn't wait; the worker exits on its own
        tokio::time::timeout(Duration::from_secs(5), async {
            while supervisor.running() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("worker did not exit");

        assert!(!lifecycle.stop().await.unwrap());
    }
}
