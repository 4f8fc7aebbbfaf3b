//! Table of connected, identified workers.
//!
//! Both directions (worker id → session, session → worker id) live behind a
//! single lock, so every add/remove is atomic with respect to every other
//! handler. Connect/disconnect events are published while the lock is held,
//! which keeps the observer feed in mutation order.

use std::collections::HashMap;

use metrics::gauge;
use parking_lot::Mutex;
use tracing::{debug, info};
use wsperf_core::{ConnectionId, WorkerId, WorkerRecord};

use crate::metrics::WORKERS_CONNECTED;
use crate::relay::ResultRelay;
use crate::session::WorkerHandle;

/// Registry invariant violations. These indicate a broker bug, not bad input.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("logic error - duplicate session {0} in add")]
    DuplicateSession(ConnectionId),
    #[error("logic error - duplicate worker id {0} in add")]
    DuplicateWorker(WorkerId),
}

struct WorkerEntry {
    record: WorkerRecord,
    handle: WorkerHandle,
}

#[derive(Default)]
struct Tables {
    workers: HashMap<WorkerId, WorkerEntry>,
    sessions: HashMap<ConnectionId, WorkerId>,
}

pub struct WorkerRegistry {
    tables: Mutex<Tables>,
    relay: ResultRelay,
}

impl WorkerRegistry {
    pub fn new(relay: ResultRelay) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            relay,
        }
    }

    /// Mint the identity for a newly accepted worker connection.
    pub fn next_worker_id(&self) -> WorkerId {
        WorkerId::new()
    }

    /// Register a worker that completed its welcome.
    ///
    /// Fails without touching the table if either the session or the worker
    /// id is already present.
    pub fn add(&self, handle: WorkerHandle, record: WorkerRecord) -> Result<(), RegistryError> {
        let mut tables = self.tables.lock();
        let session = handle.connection_id().clone();
        if tables.sessions.contains_key(&session) {
            return Err(RegistryError::DuplicateSession(session));
        }
        if tables.workers.contains_key(&record.id) {
            return Err(RegistryError::DuplicateWorker(record.id));
        }

        let _ = tables.sessions.insert(session, record.id.clone());
        let _ = tables.workers.insert(
            record.id.clone(),
            WorkerEntry {
                record: record.clone(),
                handle,
            },
        );
        gauge!(WORKERS_CONNECTED).set(tables.workers.len() as f64);
        info!(
            worker_id = %record.id,
            host = %record.host,
            port = record.port,
            version = %record.version,
            ident = %record.ident,
            "worker registered"
        );
        self.relay.on_worker_connected(record);
        Ok(())
    }

    /// Drop the worker bound to `session`. Unknown sessions are a no-op.
    pub fn remove(&self, session: &ConnectionId) -> Option<WorkerRecord> {
        let mut tables = self.tables.lock();
        let Some(worker_id) = tables.sessions.remove(session) else {
            debug!(session = %session, "remove for unregistered session");
            return None;
        };
        let entry = tables.workers.remove(&worker_id);
        gauge!(WORKERS_CONNECTED).set(tables.workers.len() as f64);
        info!(worker_id = %worker_id, "worker removed");
        self.relay.on_worker_disconnected(worker_id);
        entry.map(|e| e.record)
    }

    /// Snapshot of every registered worker, in registration order.
    pub fn list(&self) -> Vec<WorkerRecord> {
        let tables = self.tables.lock();
        let mut records: Vec<WorkerRecord> =
            tables.workers.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Snapshot of the send handles, for fanning out a command.
    pub fn handles(&self) -> Vec<(WorkerId, WorkerHandle)> {
        let tables = self.tables.lock();
        let mut handles: Vec<(WorkerId, WorkerHandle)> = tables
            .workers
            .iter()
            .map(|(id, e)| (id.clone(), e.handle.clone()))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    pub fn count(&self) -> usize {
        self.tables.lock().workers.len()
    }

    /// Remove every worker, publishing a disconnect for each. Used at shutdown.
    pub fn clear(&self) -> usize {
        let mut tables = self.tables.lock();
        let mut ids: Vec<WorkerId> = tables.workers.keys().cloned().collect();
        ids.sort();
        tables.workers.clear();
        tables.sessions.clear();
        gauge!(WORKERS_CONNECTED).set(0.0);
        for id in &ids {
            self.relay.on_worker_disconnected(id.clone());
        }
        ids.len()
    }

    /// Whether the two maps are exact inverses of each other.
    pub fn is_consistent(&self) -> bool {
        let tables = self.tables.lock();
        tables.sessions.len() == tables.workers.len()
            && tables.sessions.iter().all(|(session, id)| {
                tables
                    .workers
                    .get(id)
                    .is_some_and(|e| e.handle.connection_id() == session && &e.record.id == id)
            })
    }
}
