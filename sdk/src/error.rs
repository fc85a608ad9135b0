use thiserror::Error;
use voicegate_protocol::{CloseCode, ProtocolError};

/// Broad class of a failure, deciding how it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket-level failure. Reported as an event, never ends the session.
    Transport,
    /// Malformed or out-of-sequence message. Dropped, channel stays up.
    Protocol,
    /// Reconnect budget exhausted or fatal close. Ends the session.
    Lifecycle,
    /// API misuse. Returned synchronously to the caller.
    Precondition,
}

/// Errors that can occur in the voice session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    #[error("Data channel has no socket")]
    NotReady,

    #[error("Local address not discovered yet")]
    MissingLocalInfo,

    #[error("Data channel remote endpoint not configured")]
    NotConfigured,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Heartbeat interval must be greater than zero")]
    InvalidInterval,

    #[error("Heartbeat interval not set")]
    HeartbeatUnscheduled,

    #[error("Control channel not connected")]
    NotConnected,

    #[error("Voice session has ended")]
    SessionEnded,

    #[error("Lock poisoned")]
    LockError,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout exceeded: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Gave up after {attempts} connection attempts")]
    ReconnectBudgetExhausted { attempts: u32 },

    #[error("Control channel closed with fatal code {0}")]
    FatalClose(CloseCode),

    #[error("Control channel is dead")]
    Dead,
}

impl SdkError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SdkError::NotReady
            | SdkError::MissingLocalInfo
            | SdkError::NotConfigured
            | SdkError::InvalidEndpoint(_)
            | SdkError::InvalidInterval
            | SdkError::HeartbeatUnscheduled
            | SdkError::NotConnected
            | SdkError::SessionEnded
            | SdkError::LockError => ErrorKind::Precondition,
            SdkError::ConnectionFailed(_)
            | SdkError::Transport(_)
            | SdkError::Timeout(_)
            | SdkError::Disconnected => ErrorKind::Transport,
            SdkError::Protocol(_) => ErrorKind::Protocol,
            SdkError::ReconnectBudgetExhausted { .. } | SdkError::FatalClose(_) | SdkError::Dead => {
                ErrorKind::Lifecycle
            }
        }
    }
}

impl From<std::io::Error> for SdkError {
    fn from(err: std::io::Error) -> Self {
        SdkError::Transport(err.to_string())
    }
}
