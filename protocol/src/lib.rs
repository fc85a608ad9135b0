pub mod close_code;
pub mod discovery;
pub mod error;
pub mod message;
pub mod opcode;

pub use close_code::{CloseCode, Disposition};
pub use discovery::{DiscoveredAddress, DISCOVERY_PACKET_LEN};
pub use error::ProtocolError;
pub use message::{
    ClientConnect, ClientDisconnect, Hello, Identify, Inbound, Outbound, Ready, SelectProtocol,
    SessionDescription, Speaking, ENCRYPTION_MODE,
};
pub use opcode::OpCode;
