//! Signal state shared between a worker and whoever controls it.
//!
//! Setters only store a flag and wake the worker's latch. They never block
//! or allocate, so they are safe to call from a signal listener.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

/// Stand-in deadline for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Requests a controller can deliver to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Exit at the next loop check.
    Terminate,
    /// Re-read the runtime settings.
    Reload,
}

/// Why a [`Latch::wait`] call returned. Several reasons can be set at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitEvents {
    pub timeout: bool,
    pub latch_set: bool,
    pub supervisor_death: bool,
}

/// A resettable wake-up flag, in the style of a process latch.
#[derive(Debug, Default)]
pub struct Latch {
    is_set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake a waiter.
    pub fn set(&self) {
        self.is_set.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn reset(&self) {
        self.is_set.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::SeqCst)
    }

    /// Block until the latch is set, `timeout` elapses, or the supervisor
    /// goes away.
    pub async fn wait(&self, timeout: Duration, supervisor_death: &CancellationToken) -> WaitEvents {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the flag so a concurrent
            // set() can't slip between the check and the await.
            notified.as_mut().enable();

            if self.is_set() || supervisor_death.is_cancelled() {
                return WaitEvents {
                    timeout: false,
                    latch_set: self.is_set(),
                    supervisor_death: supervisor_death.is_cancelled(),
                };
            }

            tokio::select! {
                biased;

                _ = supervisor_death.cancelled() => {
                    return WaitEvents {
                        timeout: false,
                        latch_set: self.is_set(),
                        supervisor_death: true,
                    };
                }
                _ = &mut notified => {
                    // A stale permit from before the last reset() wakes us
                    // without the flag; go back to sleep.
                    if self.is_set() {
                        return WaitEvents {
                            latch_set: true,
                            ..WaitEvents::default()
                        };
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return WaitEvents {
                        timeout: true,
                        latch_set: self.is_set(),
                        supervisor_death: false,
                    };
                }
            }
        }
    }
}

/// Terminate and reload flags of one worker, plus the latch that wakes it.
#[derive(Debug, Default)]
pub struct WorkerSignals {
    terminate: AtomicBool,
    reload: AtomicBool,
    latch: Latch,
}

impl WorkerSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Terminate => self.request_terminate(),
            WorkerSignal::Reload => self.request_reload(),
        }
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.latch.set();
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
        self.latch.set();
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Consume a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Whether a request is waiting to be handled.
    pub fn pending(&self) -> bool {
        self.terminate.load(Ordering::SeqCst) || self.reload.load(Ordering::SeqCst)
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }
}

/// Forward SIGTERM and SIGHUP delivered to this process to `signals`.
///
/// Runs until the process exits or the signal streams close.
#[cfg(unix)]
pub async fn forward_os_signals(signals: std::sync::Arc<WorkerSignals>) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            received = terminate.recv() => {
                if received.is_none() {
                    return Ok(());
                }
                signals.request_terminate();
            }
            received = hangup.recv() => {
                if received.is_none() {
                    return Ok(());
                }
                signals.request_reload();
            }
        }
    }
}
