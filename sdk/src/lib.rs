pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{MissedAckPolicy, SessionConfig};
pub use control::{ConnectTarget, ConnectionState, ControlAction, ControlChannel, ControlInput};
pub use data::DataChannel;
pub use error::{ErrorKind, SdkError};
pub use event::{Channel, EventHandler, EventSink, SessionEvent};
pub use heartbeat::HeartbeatTimer;
pub use registry::{Participant, ParticipantRegistry};
pub use session::VoiceSession;
pub use transport::{
    Connector, LinkEvent, LinkHalves, MemoryConnector, MemoryPeer, TcpConnector, WsConnector,
};
pub use voicegate_protocol::{CloseCode, DiscoveredAddress, Disposition};
