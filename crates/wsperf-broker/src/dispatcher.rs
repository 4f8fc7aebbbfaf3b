//! Fans a test case out to every registered worker.
//!
//! At-most-once and best-effort: there is no acknowledgment, retry or
//! completion tracking. The run id exists only so results can be attributed.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info};
use wsperf_core::{CaseDefinition, RunId};

use crate::metrics::RUNS_DISPATCHED_TOTAL;
use crate::registry::WorkerRegistry;

/// Outcome of one [`RunDispatcher::submit`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub run_id: RunId,
    /// Workers the command was queued for.
    pub workers: usize,
}

#[derive(Clone)]
pub struct RunDispatcher {
    registry: Arc<WorkerRegistry>,
}

impl RunDispatcher {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    /// Mint a run id and queue the command for every worker registered right
    /// now. Returns without waiting on any worker.
    pub fn submit(&self, case: &CaseDefinition) -> Dispatch {
        let run_id = RunId::new();
        let mut workers = 0;
        for (worker_id, handle) in self.registry.handles() {
            if handle.run_case(&run_id, case) {
                workers += 1;
            } else {
                debug!(worker_id = %worker_id, run_id = %run_id, "worker gone, command skipped");
            }
        }
        counter!(RUNS_DISPATCHED_TOTAL).increment(1);
        info!(run_id = %run_id, uri = %case.uri, workers, "run dispatched");
        Dispatch { run_id, workers }
    }
}
