//! Peer discovery relay.
//!
//! The relay never inspects signaling payloads; it only maintains room
//! membership and routes frames between participants of the same room.

pub mod directory;
pub mod gateway;
pub mod room;

pub use directory::RoomDirectory;
pub use gateway::router;
pub use room::Room;
