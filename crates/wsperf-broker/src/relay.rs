//! Republishes worker lifecycle and run results to every observer.
//!
//! Delivery is fire-and-forget: an event published while nobody is
//! subscribed is dropped, and a subscriber that falls behind skips events.

use metrics::counter;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;
use wsperf_core::{BrokerEvent, RunId, WorkerId, WorkerRecord};

use crate::metrics::RESULTS_RELAYED_TOTAL;

#[derive(Clone, Debug)]
pub struct ResultRelay {
    tx: broadcast::Sender<BrokerEvent>,
}

impl ResultRelay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn on_result(&self, worker_id: WorkerId, run_id: RunId, result: Value) {
        counter!(RESULTS_RELAYED_TOTAL).increment(1);
        self.publish(BrokerEvent::CaseResult {
            worker_id,
            run_id,
            result,
        });
    }

    pub fn on_complete(&self, worker_id: WorkerId, run_id: RunId) {
        self.publish(BrokerEvent::CaseComplete { worker_id, run_id });
    }

    pub fn on_worker_connected(&self, worker: WorkerRecord) {
        self.publish(BrokerEvent::WorkerConnected { worker });
    }

    pub fn on_worker_disconnected(&self, worker_id: WorkerId) {
        self.publish(BrokerEvent::WorkerDisconnected { worker_id });
    }

    fn publish(&self, event: BrokerEvent) {
        let event_type = event.event_type();
        if self.tx.send(event).is_err() {
            trace!(event_type, "no observers attached, event dropped");
        }
    }
}
