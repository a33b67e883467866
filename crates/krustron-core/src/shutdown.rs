//! Graceful shutdown coordination.
//!
//! One controller owns the process-wide cancellation token. Long-running
//! components (the hub loop, the HTTP server, bus workers) are spawned through
//! it or hold a child token, and `shutdown()` waits for them up to a deadline.
//!
//! ```ignore
//! let shutdown = ShutdownController::new();
//! let (hub, _) = Hub::spawn(config, shutdown.token());
//! shutdown.spawn(server);
//! wait_for_shutdown_signal().await;
//! shutdown.shutdown().await;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Shutdown phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShutdownPhase {
    /// Normal operation
    Running = 0,
    /// No new work accepted
    Stopping = 1,
    /// Waiting for tracked tasks
    Draining = 2,
    /// Deadline passed with tasks still running
    Terminating = 3,
    /// Done
    Terminated = 4,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            2 => Self::Draining,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Draining => "draining",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Coordinates cancellation and task draining across components.
pub struct ShutdownController {
    token: CancellationToken,
    tracker: TaskTracker,
    phase_tx: broadcast::Sender<ShutdownPhase>,
    phase: AtomicU8,
    initiated: AtomicBool,
    timeout: Duration,
}

impl std::fmt::Debug for ShutdownController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownController")
            .field("phase", &self.phase())
            .field("tasks", &self.tracker.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ShutdownController {
    /// Controller with the default 30s drain deadline.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS))
    }

    /// Controller with a custom drain deadline.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        let (phase_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            phase_tx,
            phase: AtomicU8::new(ShutdownPhase::Running as u8),
            initiated: AtomicBool::new(false),
            timeout,
        })
    }

    /// Child token for a component; cancelled when shutdown starts.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Phase change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether `shutdown` or `force_shutdown` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Number of tracked tasks still running.
    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Run `future` as a tracked task; shutdown waits for it.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        let _ = self.phase_tx.send(phase);
        info!(phase = %phase, "Shutdown phase changed");
    }

    /// Cancel every component and wait for tracked tasks.
    ///
    /// Returns `true` when all tasks finished before the deadline. A second
    /// call returns immediately with `false`.
    pub async fn shutdown(&self) -> bool {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already initiated");
            return false;
        }

        info!(tasks = self.tracker.len(), "Initiating graceful shutdown");
        self.set_phase(ShutdownPhase::Stopping);
        self.token.cancel();
        self.tracker.close();

        self.set_phase(ShutdownPhase::Draining);
        let graceful = tokio::time::timeout(self.timeout, self.tracker.wait())
            .await
            .is_ok();
        if !graceful {
            warn!(
                tasks = self.tracker.len(),
                timeout_secs = self.timeout.as_secs(),
                "Shutdown deadline exceeded, abandoning remaining tasks"
            );
            self.set_phase(ShutdownPhase::Terminating);
        }

        self.set_phase(ShutdownPhase::Terminated);
        graceful
    }

    /// Cancel everything without waiting.
    pub fn force_shutdown(&self) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!("Force shutdown initiated");
            self.set_phase(ShutdownPhase::Terminating);
            self.token.cancel();
            self.tracker.close();
            self.set_phase(ShutdownPhase::Terminated);
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
