//! roomdrop: room-scoped peer discovery and peer-to-peer file transfer.
//!
//! The [`relay`] half is a small WebSocket service that tracks room
//! membership and routes opaque signaling frames between participants. The
//! [`session`] half is the client: it keeps a relay connection alive,
//! negotiates direct peer links over a pluggable transport, and moves files
//! across them in fixed-size chunks.

pub mod config;
pub mod proto;
pub mod relay;
pub mod session;
