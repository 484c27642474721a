//! Supervisor running each worker as a separate OS process.
//!
//! The child is `ttl-index --config <path> worker --database <name>`. It
//! prints `READY <pid>` on stdout once it is running; everything else it
//! writes goes to stderr. Signals are delivered by pid, and only after the
//! session's recorded host and process start time match the process that
//! now holds that pid. A worker on another host can't be signalled.

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::oneshot,
};

use super::{
    RestartPolicy, StartupStatus, Supervisor, SupervisorError, WorkerDescriptor, WorkerHandle,
    check_entry_point,
};
use crate::{host, models::WorkerSession, worker::WorkerSignal};

/// Prefix of the line a worker process prints once it is running.
pub const READY_PREFIX: &str = "READY ";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ProcessSupervisor {
    program: PathBuf,
    config_path: PathBuf,
    handshake_timeout: Duration,
}

impl ProcessSupervisor {
    /// Supervisor that re-executes the current binary.
    pub fn new(config_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        Ok(Self::with_program(std::env::current_exe()?, config_path))
    }

    pub fn with_program(program: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: config_path.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// How long to wait for the `READY` line before reporting the worker as
    /// stopped.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn command(&self, database: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--config")
            .arg(&self.config_path)
            .arg("worker")
            .arg("--database")
            .arg(database)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // Keep the worker out of the controller's process group so a Ctrl-C
        // aimed at the CLI doesn't reach it
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn register(
        &self,
        descriptor: WorkerDescriptor,
    ) -> Result<Option<WorkerHandle>, SupervisorError> {
        check_entry_point(&descriptor)?;
        if descriptor.restart != RestartPolicy::Never {
            return Err(SupervisorError::UnsupportedRestartPolicy(descriptor.restart));
        }

        let child = self.command(&descriptor.database).spawn()?;
        tracing::debug!(
            name = %descriptor.name,
            pid = child.id(),
            "Spawned worker process"
        );

        let (status_tx, status_rx) = oneshot::channel();
        tokio::spawn(read_handshake(child, self.handshake_timeout, status_tx));

        Ok(Some(WorkerHandle::new(descriptor.name, status_rx)))
    }

    async fn signal(
        &self,
        session: &WorkerSession,
        signal: WorkerSignal,
    ) -> Result<bool, SupervisorError> {
        if !session.is_local_process_running() {
            tracing::warn!(
                pid = session.pid,
                hostname = %session.hostname,
                ?signal,
                "Worker process is not running on this host, not signalling"
            );
            return Ok(false);
        }
        Ok(send_signal(session.pid, signal))
    }
}

/// Wait for the child's `READY` line and report the outcome.
async fn read_handshake(
    mut child: Child,
    timeout: Duration,
    status_tx: oneshot::Sender<StartupStatus>,
) {
    let Some(stdout) = child.stdout.take() else {
        let _ = status_tx.send(StartupStatus::Stopped);
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    let status = match tokio::time::timeout(timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) => match parse_ready(&line) {
            Some(pid) => StartupStatus::Started(pid),
            None => {
                tracing::warn!(line = %line, "Unexpected worker handshake");
                StartupStatus::Stopped
            }
        },
        Ok(Ok(None)) => StartupStatus::Stopped,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to read worker handshake");
            StartupStatus::Stopped
        }
        Err(_) => {
            tracing::warn!(?timeout, "Worker did not report readiness in time");
            if child.start_kill().is_ok() {
                let _ = child.wait().await;
            }
            StartupStatus::Stopped
        }
    };

    let _ = status_tx.send(status);
}

/// Parse `READY <pid>`.
pub fn parse_ready(line: &str) -> Option<u32> {
    line.trim().strip_prefix(READY_PREFIX)?.trim().parse().ok()
}

#[cfg(unix)]
fn send_signal(pid: i64, signal: WorkerSignal) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let signo = match signal {
        WorkerSignal::Terminate => libc::SIGTERM,
        WorkerSignal::Reload => libc::SIGHUP,
    };
    // SAFETY: kill has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, signo) };
    if rc != 0 {
        tracing::warn!(
            pid,
            error = %std::io::Error::last_os_error(),
            "Failed to signal worker process"
        );
    }
    rc == 0
}

#[cfg(not(unix))]
fn send_signal(_pid: i64, _signal: WorkerSignal) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ready() {
        assert_eq!(parse_ready("READY 4242"), Some(4242));
        assert_eq!(parse_ready("READY 17\n"), Some(17));
        assert_eq!(parse_ready("READY"), None);
        assert_eq!(parse_ready("READY abc"), None);
        assert_eq!(parse_ready("started 12"), None);
    }

    #[tokio::test]
    async fn test_restart_policy_rejected() {
        let supervisor = ProcessSupervisor::with_program("/nonexistent", "ttl-index.toml");
        let descriptor = WorkerDescriptor {
            restart: RestartPolicy::After(Duration::from_secs(1)),
            ..WorkerDescriptor::for_database("app")
        };
        assert!(matches!(
            supervisor.register(descriptor).await,
            Err(SupervisorError::UnsupportedRestartPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let supervisor = ProcessSupervisor::with_program("/nonexistent/ttl-index", "ttl-index.toml");
        assert!(matches!(
            supervisor.register(WorkerDescriptor::for_database("app")).await,
            Err(SupervisorError::Spawn(_))
        ));
    }

    #[cfg(unix)]
    mod unix {
        use std::os::unix::fs::PermissionsExt;

        use super::*;

        /// Write an executable shell script standing in for the binary.
        fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("worker.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn start(program: PathBuf, timeout: Duration) -> StartupStatus {
            let supervisor = ProcessSupervisor::with_program(program, "ttl-index.toml")
                .with_handshake_timeout(timeout);

            // A concurrent fork in another test can briefly hold the freshly
            // written script open for writing (ETXTBSY)
            let mut attempts = 0;
            let handle = loop {
                match supervisor.register(WorkerDescriptor::for_database("app")).await {
                    Err(SupervisorError::Spawn(e))
                        if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 10 =>
                    {
                        attempts += 1;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    other => break other.unwrap().expect("process supervisor always has a slot"),
                }
            };
            handle.wait_for_startup().await
        }

        #[tokio::test]
        async fn test_ready_line_reports_started() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, r#"echo "READY $$""#);

            let status = start(program, Duration::from_secs(5)).await;
            assert!(matches!(status, StartupStatus::Started(pid) if pid > 0));
        }

        #[tokio::test]
        async fn test_exit_before_ready_reports_stopped() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "echo 'no such database' >&2\nexit 1");

            assert_eq!(start(program, Duration::from_secs(5)).await, StartupStatus::Stopped);
        }

        #[tokio::test]
        async fn test_silent_worker_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "sleep 30");

            assert_eq!(
                start(program, Duration::from_millis(200)).await,
                StartupStatus::Stopped
            );
        }

        fn session(pid: i64, process_start: Option<i64>) -> WorkerSession {
            WorkerSession {
                worker_id: uuid::Uuid::new_v4(),
                database_name: "app".into(),
                application_name: "TTL Worker DB app".into(),
                pid,
                hostname: host::hostname().to_string(),
                process_start,
                started_at: chrono::Utc::now(),
            }
        }

        #[tokio::test]
        async fn test_signal_dead_pid_fails() {
            let supervisor = ProcessSupervisor::with_program("/nonexistent", "ttl-index.toml");

            let dead = session(i64::from(i32::MAX), None);
            assert!(!supervisor.signal(&dead, WorkerSignal::Reload).await.unwrap());

            let invalid = session(0, None);
            assert!(!supervisor.signal(&invalid, WorkerSignal::Terminate).await.unwrap());
        }

        #[tokio::test]
        #[cfg(target_os = "linux")]
        async fn test_signal_checks_process_identity() {
            let supervisor = ProcessSupervisor::with_program("/nonexistent", "ttl-index.toml");
            let mut child = Command::new("sleep").arg("30").spawn().unwrap();
            let pid = i64::from(child.id().unwrap());
            let started = host::process_start_time(pid).unwrap();

            // The recorded worker is gone and its pid now belongs to `sleep`
            let reused = session(pid, Some(started - 1));
            assert!(!supervisor.signal(&reused, WorkerSignal::Terminate).await.unwrap());

            let remote = WorkerSession {
                hostname: "elsewhere.invalid".into(),
                ..session(pid, Some(started))
            };
            assert!(!supervisor.signal(&remote, WorkerSignal::Terminate).await.unwrap());

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(child.try_wait().unwrap().is_none(), "unrelated process was signalled");

            let recorded = session(pid, Some(started));
            assert!(supervisor.signal(&recorded, WorkerSignal::Terminate).await.unwrap());
            let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .unwrap()
                .unwrap();
            assert!(!status.success());
        }
    }
}
