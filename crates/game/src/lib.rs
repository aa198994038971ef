pub mod entity;
pub mod level;
pub mod net;
pub mod room;
pub mod sim;

pub use entity::{
    ActionState, Enemy, EnemySnapshot, EntityMode, History, Player, PlayerInput, PlayerSnapshot,
    PlayerView, Stamped,
};
pub use level::{EnemySpawn, Level, PlayerSpawn, RoomData};
pub use net::{
    Channel, Event, Host, JoinStatus, Message, PeerId, Reliability, StartStatus, TransportStats,
    WireError, DEFAULT_PORT, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, UNKNOWN_PLAYER,
    UNKNOWN_ROOM,
};
pub use room::{GameRoom, JoinError, Outgoing, PoolError, RoomId, RoomPool, RoomState};
pub use sim::{FIXED_DT, TICK_RATE};
