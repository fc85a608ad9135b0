//! External address discovery over the data channel.
//!
//! Probe format: `[marker: u32 BE = 1][zero padding]`, 70 bytes total.
//! Reply format: `[4 bytes][address...NUL][padding][port: u16 BE]`, the port
//! occupying the final two bytes.

use crate::error::ProtocolError;

/// Size of the discovery probe.
pub const DISCOVERY_PACKET_LEN: usize = 70;

/// Value of the first four bytes of a probe.
pub const DISCOVERY_MARKER: u32 = 1;

const HEADER_LEN: usize = 4;
const PORT_LEN: usize = 2;

/// Our externally visible address as reported by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredAddress {
    pub address: String,
    pub port: u16,
}

impl DiscoveredAddress {
    /// Parses a discovery reply.
    pub fn parse(reply: &[u8]) -> Result<Self, ProtocolError> {
        // minimum: header + 1 address byte + NUL + port
        let min = HEADER_LEN + 2 + PORT_LEN;
        if reply.len() < min {
            return Err(ProtocolError::PacketTooShort {
                expected: min,
                got: reply.len(),
            });
        }

        let body = &reply[HEADER_LEN..reply.len() - PORT_LEN];
        let end = body
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::InvalidDiscoveryReply("address is not NUL-terminated"))?;
        if end == 0 {
            return Err(ProtocolError::InvalidDiscoveryReply("empty address"));
        }

        let address = std::str::from_utf8(&body[..end])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        let port = u16::from_be_bytes([reply[reply.len() - 2], reply[reply.len() - 1]]);

        Ok(Self { address, port })
    }
}

/// Builds the discovery probe.
#[must_use]
pub fn probe() -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[..HEADER_LEN].copy_from_slice(&DISCOVERY_MARKER.to_be_bytes());
    packet
}

/// True if `payload` is exactly the probe produced by [`probe`].
#[must_use]
pub fn is_probe(payload: &[u8]) -> bool {
    payload == probe().as_slice()
}

/// True if `datagram` has the size and header of a discovery reply.
#[must_use]
pub fn looks_like_reply(datagram: &[u8]) -> bool {
    datagram.len() == DISCOVERY_PACKET_LEN
        && datagram[..HEADER_LEN] == DISCOVERY_MARKER.to_be_bytes()
}
