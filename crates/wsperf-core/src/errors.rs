/// Worker protocol violations. Every variant is fatal for the connection
/// that produced it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected empty message")]
    EmptyMessage,
    #[error("unexpected binary message")]
    BinaryMessage,
    #[error("could not decode text message as JSON ({0})")]
    InvalidJson(String),
    #[error("message has no type field")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("duplicate welcome message")]
    DuplicateWelcome,
}

impl ProtocolError {
    /// WebSocket close code sent to a worker that violates the protocol.
    pub const CLOSE_CODE: u16 = 3000;

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::EmptyMessage => "empty_message",
            Self::BinaryMessage => "binary_message",
            Self::InvalidJson(_) => "invalid_json",
            Self::MissingType => "missing_type",
            Self::UnknownType(_) => "unknown_type",
            Self::Malformed { .. } => "malformed",
            Self::DuplicateWelcome => "duplicate_welcome",
        }
    }
}
