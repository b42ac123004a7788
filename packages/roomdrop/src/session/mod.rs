//! Client side: relay connection, peer links and file transfers.

pub mod link;
pub mod memory;
pub mod orchestrator;
pub mod relay_client;
pub mod transfer;
pub mod transport;

pub use link::LinkState;
pub use memory::MemoryHub;
pub use orchestrator::{PeerInfo, PeerSession, SessionError, SessionEvent, SessionHandle};
pub use transfer::{TransferDirection, TransferSnapshot, TransferStatus};
pub use transport::{LinkFactory, PeerTransport, TransportEvent};
