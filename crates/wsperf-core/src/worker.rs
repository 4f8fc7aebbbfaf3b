use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

/// Registry view of one identified worker, as reported to observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub ident: String,
}
