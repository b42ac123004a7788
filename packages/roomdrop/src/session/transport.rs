//! Seam between the session and the underlying peer-to-peer transport.
//!
//! The session never speaks a transport protocol directly. It feeds relayed
//! signaling payloads in, pushes encoded frames out, and reacts to the event
//! stream. Anything that can do those three things can carry a link.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

/// Events a transport emits toward its link driver.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A signaling payload that must reach the remote peer via the relay.
    SignalOut(Value),
    /// The direct connection is established; frames may flow.
    Connected,
    /// A frame arrived from the remote peer.
    Data(Vec<u8>),
    /// Previously refused sends may be retried.
    Writable,
    /// The connection closed, locally or remotely.
    Closed,
    /// The connection failed. Treated exactly like `Closed` after logging.
    Error(String),
}

/// One directional handle onto a peer-to-peer connection attempt.
pub trait PeerTransport: Send + Sync {
    /// Hand a signaling payload from the remote peer to the transport.
    fn feed_signal(&self, payload: Value);

    /// Try to send one encoded frame. Returns `false` when the transport
    /// cannot accept it right now; the caller must wait for
    /// [`TransportEvent::Writable`] and retry the same frame.
    fn send(&self, frame: &[u8]) -> bool;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// Creates transports for new links. The initiator side opens the handshake;
/// the acceptor side answers one.
pub trait LinkFactory: Send + Sync {
    fn initiate(
        &self,
        remote_id: &str,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>);

    fn accept(
        &self,
        remote_id: &str,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>);
}
