use thiserror::Error;

/// Protocol decoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid payload for opcode {op}: {reason}")]
    InvalidPayload { op: u8, reason: String },

    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("malformed discovery reply: {0}")]
    InvalidDiscoveryReply(&'static str),

    #[error("invalid UTF-8 encoding")]
    InvalidUtf8,

    #[error("unknown close code: {0}")]
    UnknownCloseCode(u16),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidJson(err.to_string())
    }
}
