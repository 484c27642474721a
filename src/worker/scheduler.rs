//! Worker entry point and scheduling loop.
//!
//! The loop sleeps for the configured naptime, runs a cleanup pass on each
//! timeout, and reacts to terminate and reload requests in between. Cleanup
//! failures are logged and the loop carries on; only a terminate request or
//! the death of the supervisor ends it.

use std::{sync::Arc, time::Duration};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    cleanup::perform_ttl_cleanup,
    settings::SettingsSource,
    signals::{WaitEvents, WorkerSignals},
};
use crate::{
    config::{ConfigError, WorkerSettings},
    db::{DbError, DbPool},
    models::{NewWorkerSession, WorkerSession},
};

/// How often a worker started on a recovering database checks whether
/// recovery has finished.
const RECOVERY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Invalid database for TTL worker: {0}")]
    InvalidDatabase(String),

    #[error("A TTL worker is already running for database {0}")]
    AlreadyRunning(String),

    #[error("Supervisor exited, shutting down worker")]
    SupervisorDied,

    #[error("Failed to load worker settings: {0}")]
    Settings(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Everything a worker needs to run against one database.
pub struct WorkerContext {
    pub worker_id: Uuid,
    /// Database the worker was started for. Must match the connected one.
    pub database: String,
    pub db: Arc<DbPool>,
    pub signals: Arc<WorkerSignals>,
    pub settings: Arc<dyn SettingsSource>,
    /// Cancelled when the hosting supervisor goes away.
    pub supervisor_death: CancellationToken,
}

/// Decide whether this wake-up should run a cleanup pass.
///
/// A timeout runs one. A wake caused only by the latch (a reload or
/// terminate request) does not, so repeated reloads can't trigger a burst of
/// passes. Anything else runs one.
pub fn should_perform_cleanup(events: WaitEvents) -> bool {
    if events.timeout {
        return true;
    }
    if events.latch_set {
        return false;
    }
    true
}

/// Worker entry point.
///
/// Validates the target database, waits for recovery to finish, registers
/// the worker session, reports readiness through `ready`, then runs the
/// scheduling loop until terminated. The session is removed on the way out.
pub async fn ttl_worker_main(
    ctx: WorkerContext,
    ready: oneshot::Sender<WorkerSession>,
) -> Result<(), WorkerError> {
    if ctx.database.trim().is_empty() {
        return Err(WorkerError::InvalidDatabase("empty database name".into()));
    }

    let connected = ctx.db.current_database().await?;
    if connected != ctx.database {
        return Err(WorkerError::InvalidDatabase(format!(
            "worker started for '{}' but connected to '{}'",
            ctx.database, connected
        )));
    }

    let mut settings = ctx.settings.load()?;

    let new_session = NewWorkerSession::for_current_process(ctx.worker_id, &ctx.database);
    let db = ctx.db.for_worker(&new_session.application_name).await?;

    // Sessions can't be written until the database accepts writes
    if !wait_for_recovery(&ctx, &db).await? {
        return Ok(());
    }

    let session = db
        .worker_sessions()
        .register(new_session)
        .await
        .map_err(|e| match e {
            DbError::Conflict(_) => WorkerError::AlreadyRunning(ctx.database.clone()),
            other => WorkerError::Db(other),
        })?;

    tracing::info!(
        worker_id = %ctx.worker_id,
        database = %ctx.database,
        naptime_secs = settings.naptime.as_secs(),
        enabled = settings.enabled,
        "TTL worker started"
    );
    // The receiver may be gone if nobody waits for startup
    let _ = ready.send(session);

    let result = run_loop(&ctx, &db, &mut settings).await;

    if let Err(e) = db.worker_sessions().deregister(ctx.worker_id).await {
        tracing::warn!(worker_id = %ctx.worker_id, error = %e, "Failed to deregister worker session");
    }

    match &result {
        Ok(()) => tracing::info!(database = %ctx.database, "TTL worker shutting down"),
        Err(e) => tracing::error!(database = %ctx.database, error = %e, "TTL worker exiting"),
    }
    result
}

/// Block until the database accepts writes.
///
/// Returns false if the worker was asked to terminate while waiting.
async fn wait_for_recovery(ctx: &WorkerContext, db: &DbPool) -> Result<bool, WorkerError> {
    let mut logged = false;
    while db.in_recovery().await? {
        if !logged {
            tracing::info!(database = %ctx.database, "Database in recovery, waiting before starting TTL worker");
            logged = true;
        }

        ctx.signals.latch().reset();
        let events = ctx
            .signals
            .latch()
            .wait(RECOVERY_POLL_INTERVAL, &ctx.supervisor_death)
            .await;
        if ctx.signals.terminate_requested() {
            return Ok(false);
        }
        if events.supervisor_death {
            return Err(WorkerError::SupervisorDied);
        }
    }
    Ok(true)
}

async fn run_loop(
    ctx: &WorkerContext,
    db: &DbPool,
    settings: &mut WorkerSettings,
) -> Result<(), WorkerError> {
    let latch = ctx.signals.latch();

    loop {
        latch.reset();

        // A request delivered while the previous pass ran set the latch
        // before the reset above; its flag is still pending.
        let events = if ctx.signals.pending() {
            WaitEvents {
                latch_set: true,
                supervisor_death: ctx.supervisor_death.is_cancelled(),
                timeout: false,
            }
        } else {
            latch.wait(settings.naptime, &ctx.supervisor_death).await
        };

        if ctx.signals.terminate_requested() {
            return Ok(());
        }

        if events.supervisor_death {
            return Err(WorkerError::SupervisorDied);
        }

        if ctx.signals.take_reload() {
            reload_settings(ctx, settings);
        }

        if !should_perform_cleanup(events) {
            continue;
        }

        if !settings.enabled {
            tracing::debug!("TTL worker disabled, skipping cleanup");
            continue;
        }

        match db.in_recovery().await {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!("Database in recovery, skipping cleanup");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to check recovery state, skipping cleanup");
                continue;
            }
        }

        match perform_ttl_cleanup(db.ttl_policies().as_ref()).await {
            Ok(result) if result.has_deletions() => {
                tracing::info!(
                    policies = result.policies_processed(),
                    rows_deleted = result.total(),
                    duration_ms = result.duration.as_millis() as u64,
                    "TTL cleanup complete"
                );
            }
            Ok(result) => {
                tracing::debug!(
                    policies = result.policies_processed(),
                    installed = result.installed,
                    "TTL cleanup complete, no expired rows"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "TTL cleanup failed");
            }
        }
    }
}

/// Re-read the settings. On failure the previous settings stay in effect.
fn reload_settings(ctx: &WorkerContext, settings: &mut WorkerSettings) {
    match ctx.settings.load() {
        Ok(new) => {
            if new != *settings {
                tracing::info!(
                    naptime_secs = new.naptime.as_secs(),
                    enabled = new.enabled,
                    "TTL worker settings reloaded"
                );
            }
            *settings = new;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reload TTL worker settings, keeping previous");
        }
    }
}
