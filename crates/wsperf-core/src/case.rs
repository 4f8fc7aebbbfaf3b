use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters of one performance test, as submitted by an observer.
///
/// The broker never interprets these values; they are forwarded to every
/// worker inside the `message_test` command line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseDefinition {
    /// Target URI the workers test against.
    pub uri: String,
    /// Payload size in bytes.
    pub size: u64,
    /// Number of messages per run.
    pub count: u64,
    #[serde(alias = "quantileCount")]
    pub quantile_count: u64,
    /// Per-run timeout, enforced by the workers.
    pub timeout: u64,
    pub binary: bool,
    pub sync: bool,
    /// Accepted for compatibility; the command always carries `rtts=false`.
    #[serde(default)]
    pub rtts: bool,
    /// Correctness-check policy. Any JSON value; rendered with [`CaseDefinition::correctness_label`].
    pub correctness: Value,
}

impl CaseDefinition {
    /// Textual form of the correctness policy: strings bare, anything else as JSON.
    pub fn correctness_label(&self) -> String {
        match &self.correctness {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
