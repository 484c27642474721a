use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use ttl_index::{
    config::TtlIndexConfig,
    db::DbPool,
    models::WorkerSession,
    observability,
    services::TtlPolicyService,
    supervisor::{ProcessSupervisor, READY_PREFIX, TaskSupervisor},
    worker::{
        FileSettings, WorkerContext, WorkerLifecycle, WorkerSignal, WorkerSignals,
        perform_ttl_cleanup, ttl_worker_main,
    },
};
use uuid::Uuid;

/// CLI arguments for ttl-index
#[derive(Parser, Debug)]
#[command(version, about = "Time-to-live row expiration for SQL databases", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file
    #[arg(short, long, global = true, default_value = "ttl-index.toml")]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Expire rows of TABLE once COLUMN is older than SECONDS
    CreatePolicy {
        table: String,
        column: String,
        seconds: i64,
    },
    /// Remove the policy for TABLE.COLUMN
    DropPolicy { table: String, column: String },
    /// List all policies
    ListPolicies {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Start the background worker for the configured database
    Start,
    /// Ask the running worker to terminate
    Stop,
    /// Ask the running worker to re-read its settings
    Reload,
    /// Run a single cleanup pass in the foreground and exit
    RunOnce,
    /// Run database migrations and exit
    Migrate,
    /// Host the worker in this process until SIGTERM or Ctrl-C
    ///
    /// SIGHUP reloads the worker settings.
    Serve,
    /// Worker process entry point, spawned by `start`
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        database: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match TtlIndexConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => fail(e),
    };

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {e}");
    }

    match args.command {
        Command::CreatePolicy {
            table,
            column,
            seconds,
        } => {
            let service = TtlPolicyService::new(connect(&config).await);
            match service.create_policy(&table, &column, seconds).await {
                Ok(created) => println!("{created}"),
                Err(e) => fail(e),
            }
        }
        Command::DropPolicy { table, column } => {
            let service = TtlPolicyService::new(connect(&config).await);
            match service.drop_policy(&table, &column).await {
                Ok(dropped) => println!("{dropped}"),
                Err(e) => fail(e),
            }
        }
        Command::ListPolicies { json } => {
            let service = TtlPolicyService::new(connect(&config).await);
            let policies = match service.list_policies().await {
                Ok(p) => p,
                Err(e) => fail(e),
            };
            if json {
                match serde_json::to_string_pretty(&policies) {
                    Ok(out) => println!("{out}"),
                    Err(e) => fail(e),
                }
            } else {
                for p in &policies {
                    println!(
                        "{}\t{}\t{}\t{}",
                        p.table_name,
                        p.column_name,
                        p.expire_after_seconds,
                        if p.active { "active" } else { "inactive" }
                    );
                }
            }
        }
        Command::Start => {
            let lifecycle = process_lifecycle(&args.config, &config).await;
            match lifecycle.start().await {
                Ok(started) => println!("{started}"),
                Err(e) => fail(e),
            }
        }
        Command::Stop => {
            let lifecycle = process_lifecycle(&args.config, &config).await;
            match lifecycle.stop().await {
                Ok(stopped) => println!("{stopped}"),
                Err(e) => fail(e),
            }
        }
        Command::Reload => {
            let lifecycle = process_lifecycle(&args.config, &config).await;
            match lifecycle.reload().await {
                Ok(reloaded) => println!("{reloaded}"),
                Err(e) => fail(e),
            }
        }
        Command::RunOnce => {
            let db = connect(&config).await;
            match perform_ttl_cleanup(db.ttl_policies().as_ref()).await {
                Ok(result) => {
                    for table in &result.tables {
                        println!(
                            "{}.{}\t{}",
                            table.table_name, table.column_name, table.rows_deleted
                        );
                    }
                    tracing::info!(
                        policies = result.policies_processed(),
                        rows_deleted = result.total(),
                        "Cleanup pass complete"
                    );
                }
                Err(e) => fail(e),
            }
        }
        Command::Migrate => run_migrate(&config).await,
        Command::Serve => run_serve(args.config, &config).await,
        Command::Worker { database } => run_worker(args.config, &config, database).await,
    }
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("Error: {e}");
    std::process::exit(1);
}

/// Connect to the configured database, running migrations if enabled.
async fn connect(config: &TtlIndexConfig) -> Arc<DbPool> {
    let db = match DbPool::from_config(&config.database).await {
        Ok(db) => db,
        Err(e) => fail(e),
    };
    if config.database.run_migrations()
        && let Err(e) = db.run_migrations().await
    {
        fail(e);
    }
    Arc::new(db)
}

/// Lifecycle manager that runs the worker as a detached `ttl-index worker`
/// process.
async fn process_lifecycle(config_path: &Path, config: &TtlIndexConfig) -> WorkerLifecycle {
    let db = connect(config).await;
    let config_path =
        std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    let supervisor = match ProcessSupervisor::new(config_path) {
        Ok(s) => s,
        Err(e) => fail(e),
    };
    WorkerLifecycle::new(db, Arc::new(supervisor))
}

/// Run database migrations and exit.
///
/// Exits with code 0 on success, 1 on failure.
async fn run_migrate(config: &TtlIndexConfig) {
    let db = match DbPool::from_config(&config.database).await {
        Ok(db) => db,
        Err(e) => fail(e),
    };
    if let Err(e) = db.run_migrations().await {
        fail(e);
    }
    tracing::info!("Migrations complete");
}

async fn run_serve(config_path: PathBuf, config: &TtlIndexConfig) {
    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }

    let db = connect(config).await;
    let settings = Arc::new(FileSettings::new(config_path));
    let supervisor = Arc::new(TaskSupervisor::new(
        Arc::clone(&db),
        settings,
        config.worker.max_workers,
    ));
    let lifecycle = WorkerLifecycle::new(Arc::clone(&db), supervisor.clone());

    if config.worker.autostart {
        match lifecycle.start().await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("TTL worker did not start"),
            Err(e) => tracing::error!(error = %e, "Failed to start TTL worker"),
        }
    }

    wait_for_shutdown(&supervisor).await;

    tracing::info!("Shutdown signal received, waiting for workers to exit...");
    match tokio::time::timeout(Duration::from_secs(30), supervisor.shutdown()).await {
        Ok(()) => tracing::info!("All workers exited"),
        Err(_) => tracing::warn!("Timeout waiting for workers, some may not have exited"),
    }
}

/// Block until SIGTERM or Ctrl-C. SIGHUP is forwarded to the hosted workers
/// as a reload request.
async fn wait_for_shutdown(supervisor: &TaskSupervisor) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(ctrl_c);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut terminate, mut hangup) =
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(t), Ok(h)) => (t, h),
                (Err(e), _) | (_, Err(e)) => fail(e),
            };

        loop {
            tokio::select! {
                _ = &mut ctrl_c => return,
                _ = terminate.recv() => return,
                _ = hangup.recv() => {
                    let reached = supervisor.broadcast(WorkerSignal::Reload);
                    tracing::info!(workers = reached, "Reload requested");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = supervisor;
        ctrl_c.await;
    }
}

/// Run one worker in this process. Prints `READY <pid>` on stdout once the
/// worker is running; exits 0 when terminated and 1 on failure.
async fn run_worker(config_path: PathBuf, config: &TtlIndexConfig, database: String) {
    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }

    let db = connect(config).await;
    let signals = Arc::new(WorkerSignals::new());

    #[cfg(unix)]
    {
        let forwarded = Arc::clone(&signals);
        tokio::spawn(async move {
            if let Err(e) = ttl_index::worker::forward_os_signals(forwarded).await {
                tracing::error!(error = %e, "Failed to install signal handlers");
            }
        });
    }

    let ctx = WorkerContext {
        worker_id: Uuid::new_v4(),
        database,
        db,
        signals,
        settings: Arc::new(FileSettings::new(config_path)),
        supervisor_death: CancellationToken::new(),
    };

    let (ready_tx, ready_rx) = oneshot::channel::<WorkerSession>();
    tokio::spawn(async move {
        if let Ok(session) = ready_rx.await {
            println!("{READY_PREFIX}{}", session.pid);
        }
    });

    if let Err(e) = ttl_worker_main(ctx, ready_tx).await {
        fail(e);
    }
}
