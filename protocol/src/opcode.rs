macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $val:literal),* $(,)?) => {
        /// Operation codes carried in the `op` field of every control message.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OpCode { $($(#[$doc])* $name = $val,)* }

        impl OpCode {
            #[must_use]
            pub const fn as_u8(self) -> u8 { self as u8 }
        }

        impl TryFrom<u8> for OpCode {
            type Error = u8;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($val => Ok(Self::$name),)*
                    _ => Err(value),
                }
            }
        }
    };
}

opcodes! {
    /// Client -> server, first message after the socket opens (dispatch/identify).
    Identify = 0,
    /// Client -> server, reports the discovered external address.
    SelectProtocol = 1,
    /// Server -> client, carries the data endpoint and our SSRC.
    Ready = 2,
    Heartbeat = 3,
    /// Server -> client, carries the channel secret key.
    SessionDescription = 4,
    /// Both directions.
    Speaking = 5,
    HeartbeatAck = 6,
    Resume = 7,
    /// Server -> client, carries the heartbeat interval.
    Hello = 8,
    Resumed = 9,
    ClientConnect = 12,
    ClientDisconnect = 13,
}
