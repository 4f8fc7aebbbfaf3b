use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RunId, WorkerId};
use crate::worker::WorkerRecord;

/// Events republished to observers. Ephemeral: relayed, never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerEvent {
    #[serde(rename = "worker_connected")]
    WorkerConnected { worker: WorkerRecord },

    #[serde(rename = "worker_disconnected")]
    WorkerDisconnected { worker_id: WorkerId },

    #[serde(rename = "case_result")]
    CaseResult {
        worker_id: WorkerId,
        run_id: RunId,
        result: Value,
    },

    #[serde(rename = "case_complete")]
    CaseComplete { worker_id: WorkerId, run_id: RunId },
}

impl BrokerEvent {
    pub fn worker_id(&self) -> &WorkerId {
        match self {
            Self::WorkerConnected { worker } => &worker.id,
            Self::WorkerDisconnected { worker_id }
            | Self::CaseResult { worker_id, .. }
            | Self::CaseComplete { worker_id, .. } => worker_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkerConnected { .. } => "worker_connected",
            Self::WorkerDisconnected { .. } => "worker_disconnected",
            Self::CaseResult { .. } => "case_result",
            Self::CaseComplete { .. } => "case_complete",
        }
    }
}
