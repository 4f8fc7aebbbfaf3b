use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use wsperf_core::BrokerEvent;

use crate::observer::ObserverRegistry;

/// Namespace of the observer event topics.
pub const EVENT_URI_PREFIX: &str = "http://wsperf.org/event#";

/// Topic name of an event, without the namespace.
pub fn topic_name(event: &BrokerEvent) -> &'static str {
    match event {
        BrokerEvent::WorkerConnected { .. } => "slaveConnected",
        BrokerEvent::WorkerDisconnected { .. } => "slaveDisconnected",
        BrokerEvent::CaseResult { .. } => "caseResult",
        BrokerEvent::CaseComplete { .. } => "caseComplete",
    }
}

/// Observer-facing payload of an event.
pub fn event_data(event: &BrokerEvent) -> Value {
    match event {
        BrokerEvent::WorkerConnected { worker } => json!({
            "id": worker.id,
            "host": worker.host,
            "port": worker.port,
            "version": worker.version,
            "ident": worker.ident,
        }),
        BrokerEvent::WorkerDisconnected { worker_id } => json!({ "id": worker_id }),
        BrokerEvent::CaseResult {
            worker_id,
            run_id,
            result,
        } => json!({
            "slaveId": worker_id,
            "runId": run_id,
            "result": result,
        }),
        BrokerEvent::CaseComplete { worker_id, run_id } => json!({
            "slaveId": worker_id,
            "runId": run_id,
        }),
    }
}

/// Full wire frame pushed to observers.
pub fn event_to_wire(event: &BrokerEvent) -> Value {
    json!({
        "type": "event",
        "topic": format!("{EVENT_URI_PREFIX}{}", topic_name(event)),
        "timestamp": Utc::now().to_rfc3339(),
        "data": event_data(event),
    })
}

/// Subscribes to the relay's event channel and forwards every event to all
/// connected observers. When it stops, every observer connection is closed.
pub struct EventBridge {
    observers: Arc<ObserverRegistry>,
}

impl EventBridge {
    pub fn new(observers: Arc<ObserverRegistry>) -> Self {
        Self { observers }
    }

    pub fn start(
        &self,
        mut rx: broadcast::Receiver<BrokerEvent>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let observers = Arc::clone(&self.observers);

        tokio::spawn(async move {
            loop {
                // events already published are forwarded before the cancel
                let received = tokio::select! {
                    biased;
                    received = rx.recv() => received,
                    () = shutdown.cancelled() => break,
                };
                match received {
                    Ok(event) => match serde_json::to_string(&event_to_wire(&event)) {
                        Ok(json) => {
                            let delivered = observers.broadcast_all(&json);
                            tracing::trace!(
                                event_type = event.event_type(),
                                delivered,
                                "event forwarded"
                            );
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
            let closed = observers.close_all();
            tracing::debug!(observers = closed, "event bridge stopped");
        })
    }
}
