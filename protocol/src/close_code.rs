//! Close codes the relay may send when it terminates the control channel.

use std::fmt;

use crate::error::ProtocolError;

/// Whether a closure may be followed by a reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    Recoverable,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    UnknownOpcode = 4001,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    SessionInvalid = 4006,
    SessionTimeout = 4009,
    ServerNotFound = 4011,
    UnknownProtocol = 4012,
    Disconnected = 4013,
    ServerCrashed = 4014,
    UnknownEncryption = 4015,
}

impl CloseCode {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Session and negotiation failures are fatal: reconnecting with the same
    /// credentials cannot succeed. Server-side and timeout closures are not.
    #[must_use]
    pub const fn disposition(self) -> Disposition {
        match self {
            CloseCode::UnknownOpcode
            | CloseCode::NotAuthenticated
            | CloseCode::AuthenticationFailed
            | CloseCode::AlreadyAuthenticated
            | CloseCode::SessionInvalid
            | CloseCode::UnknownProtocol
            | CloseCode::UnknownEncryption => Disposition::Fatal,
            CloseCode::SessionTimeout
            | CloseCode::ServerNotFound
            | CloseCode::Disconnected
            | CloseCode::ServerCrashed => Disposition::Recoverable,
        }
    }

    /// Classifies a raw closure. A missing or unrecognised code is treated as
    /// a transient drop.
    #[must_use]
    pub fn classify(raw: Option<u16>) -> Disposition {
        raw.and_then(|code| CloseCode::try_from(code).ok())
            .map_or(Disposition::Recoverable, CloseCode::disposition)
    }
}

impl TryFrom<u16> for CloseCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            4001 => CloseCode::UnknownOpcode,
            4003 => CloseCode::NotAuthenticated,
            4004 => CloseCode::AuthenticationFailed,
            4005 => CloseCode::AlreadyAuthenticated,
            4006 => CloseCode::SessionInvalid,
            4009 => CloseCode::SessionTimeout,
            4011 => CloseCode::ServerNotFound,
            4012 => CloseCode::UnknownProtocol,
            4013 => CloseCode::Disconnected,
            4014 => CloseCode::ServerCrashed,
            4015 => CloseCode::UnknownEncryption,
            other => return Err(ProtocolError::UnknownCloseCode(other)),
        })
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u16())
    }
}
