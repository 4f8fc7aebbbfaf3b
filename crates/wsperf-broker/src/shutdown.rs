//! Broker shutdown sequence.
//!
//! Order matters: the registry is cleared first so observers still connected
//! get a disconnect event per worker, then every task is cancelled and
//! drained within a timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::WorkerRegistry;

/// Default timeout for graceful shutdown before giving up on tasks.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// What a completed shutdown did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    pub workers_removed: usize,
    /// Some tasks were still running when the timeout hit.
    pub timed_out: bool,
}

/// Owns the broker's cancellation token and background tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    registry: Arc<WorkerRegistry>,
    tasks: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            token: CancellationToken::new(),
            registry,
            tasks: Vec::new(),
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Clone of the cancellation token, for tasks that must stop on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Await `handle` during shutdown.
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// Clear the registry, cancel the token, then wait for the tracked tasks.
    pub async fn run(self) -> ShutdownReport {
        let workers_removed = self.registry.clear();
        info!(workers = workers_removed, "registry cleared");

        self.token.cancel();
        info!(
            task_count = self.tasks.len(),
            timeout_secs = self.timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(self.tasks);
        let timed_out = tokio::time::timeout(self.timeout, drain).await.is_err();
        if timed_out {
            warn!("shutdown timed out after {:?}, some tasks may still be running", self.timeout);
        }
        ShutdownReport {
            workers_removed,
            timed_out,
        }
    }
}
