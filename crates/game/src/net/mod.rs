mod tracking;
mod transport;
mod wire;

pub use transport::{
    Channel, DEFAULT_PORT, Event, Host, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, PeerId,
    Reliability, TransportStats,
};
pub use wire::{JoinStatus, Message, StartStatus, UNKNOWN_PLAYER, UNKNOWN_ROOM, WireError};
