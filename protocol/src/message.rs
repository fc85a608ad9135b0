//! Control-channel messages.
//!
//! Every message is a JSON object `{ "op": <opcode>, "d": <payload> }`.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::opcode::OpCode;

/// Encryption mode requested in `SelectProtocol` unless configured otherwise.
pub const ENCRYPTION_MODE: &str = "xsalsa20_poly1305";

/// Transport protocol name sent in `SelectProtocol`.
pub const DATA_PROTOCOL: &str = "udp";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    op: u8,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Milliseconds; some relays send this as a float.
    pub heartbeat_interval: f64,
}

impl Hello {
    /// The negotiated interval, or `None` if the server sent a non-positive,
    /// non-finite or unrepresentably large value.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        if self.heartbeat_interval <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.heartbeat_interval / 1000.0).ok()
    }
}

/// Session parameters delivered once identification succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(default)]
    pub mode: String,
    pub secret_key: Vec<u8>,
}

impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescription")
            .field("mode", &self.mode)
            .field("secret_key", &format_args!("<{} bytes>", self.secret_key.len()))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnect {
    pub user_id: String,
    pub audio_ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: String,
}

/// Speaking state. Inbound messages carry `user_id`; outbound ones carry `delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaking {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub ssrc: u32,
    pub speaking: u32,
    #[serde(default)]
    pub delay: u32,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

impl fmt::Debug for Identify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identify")
            .field("server_id", &self.server_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

impl SelectProtocol {
    #[must_use]
    pub fn udp(address: String, port: u16, mode: &str) -> Self {
        Self {
            protocol: DATA_PROTOCOL.to_string(),
            data: SelectProtocolData {
                address,
                port,
                mode: mode.to_string(),
            },
        }
    }
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Inbound {
    Hello(Hello),
    Ready(Ready),
    SessionDescription(SessionDescription),
    Speaking(Speaking),
    HeartbeatAck,
    ClientConnect(ClientConnect),
    ClientDisconnect(ClientDisconnect),
    /// Recognised or unrecognised opcode this client does not act on.
    Unknown(u8),
}

impl Inbound {
    /// Decodes one control message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let op = envelope.op;
        let Ok(opcode) = OpCode::try_from(op) else {
            return Ok(Inbound::Unknown(op));
        };

        Ok(match opcode {
            OpCode::Hello => Inbound::Hello(payload(op, envelope.d)?),
            OpCode::Ready => Inbound::Ready(payload(op, envelope.d)?),
            OpCode::SessionDescription => Inbound::SessionDescription(payload(op, envelope.d)?),
            OpCode::Speaking => Inbound::Speaking(payload(op, envelope.d)?),
            OpCode::HeartbeatAck => Inbound::HeartbeatAck,
            OpCode::ClientConnect => Inbound::ClientConnect(payload(op, envelope.d)?),
            OpCode::ClientDisconnect => Inbound::ClientDisconnect(payload(op, envelope.d)?),
            _ => Inbound::Unknown(op),
        })
    }
}

fn payload<T: DeserializeOwned>(op: u8, d: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(d).map_err(|e| ProtocolError::InvalidPayload {
        op,
        reason: e.to_string(),
    })
}

/// Messages sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    /// Payload is the send time in Unix milliseconds.
    Heartbeat { nonce: u64 },
    Speaking(Speaking),
}

impl Outbound {
    #[must_use]
    pub fn opcode(&self) -> OpCode {
        match self {
            Outbound::Identify(_) => OpCode::Identify,
            Outbound::SelectProtocol(_) => OpCode::SelectProtocol,
            Outbound::Heartbeat { .. } => OpCode::Heartbeat,
            Outbound::Speaking(_) => OpCode::Speaking,
        }
    }

    /// Encodes the message as a single JSON text.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let d = match self {
            Outbound::Identify(p) => serde_json::to_value(p)?,
            Outbound::SelectProtocol(p) => serde_json::to_value(p)?,
            Outbound::Heartbeat { nonce } => Value::from(*nonce),
            Outbound::Speaking(p) => serde_json::to_value(p)?,
        };
        let envelope = Envelope {
            op: self.opcode().as_u8(),
            d,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}
