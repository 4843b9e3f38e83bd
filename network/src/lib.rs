//! Network layer for soundstage.
//!
//! [`protocol`] defines the datagram formats exchanged with clients and
//! [`transport`] carries them over UDP behind a narrow trait so the mix
//! pipeline can be exercised without sockets.

pub mod protocol;
pub mod transport;

pub use protocol::{PacketType, StreamStats, HEADER_LEN, PROTOCOL_VERSION};
pub use transport::{Transport, UdpTransport};
