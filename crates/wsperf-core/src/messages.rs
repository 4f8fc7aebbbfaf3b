use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::RunId;

/// Subprotocol token a worker must offer during the WebSocket handshake.
pub const WSPERF_SUBPROTOCOL: &str = "wsperf";

/// A decoded worker → broker message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker-side failure report. Logged, never acted on.
    Error {
        #[serde(flatten)]
        details: Map<String, Value>,
    },
    /// A worker finished a run.
    TestComplete {
        #[serde(default)]
        token: Option<RunId>,
    },
    /// One batch of results for a run. `data` is opaque to the broker.
    TestData { token: RunId, data: Value },
    /// First message on a connection; identifies the worker build.
    TestWelcome { version: String, ident: String },
}

impl WorkerMessage {
    pub const KINDS: [&'static str; 4] = ["error", "test_complete", "test_data", "test_welcome"];

    /// Decode a text frame.
    ///
    /// The `type` tag is validated before any kind-specific field is read, so
    /// unknown kinds and malformed payloads surface as distinct errors.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(ref object) = value else {
            return Err(ProtocolError::InvalidJson("expected a JSON object".into()));
        };

        let kind = match object.get("type") {
            None => return Err(ProtocolError::MissingType),
            Some(Value::String(kind)) => kind.as_str(),
            Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        let Some(kind) = Self::KINDS.iter().copied().find(|k| *k == kind) else {
            return Err(ProtocolError::UnknownType(kind.to_owned()));
        };

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
            kind,
            reason: e.to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::TestComplete { .. } => "test_complete",
            Self::TestData { .. } => "test_data",
            Self::TestWelcome { .. } => "test_welcome",
        }
    }
}
