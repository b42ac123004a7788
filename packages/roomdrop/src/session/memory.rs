//! In-process peer transport.
//!
//! `MemoryHub` pairs an initiator and an acceptor through the real signaling
//! path: the initiator publishes an offer carrying a rendezvous token, the
//! acceptor answers with the same token, and when the answer makes it back
//! the hub wires the two ends together. The signaling payloads travel the
//! same route real ones would (link driver, relay, remote link driver), so
//! tests exercise the full path end to end.
//!
//! The hub also carries a writability gate so tests can force backpressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::transport::{LinkFactory, PeerTransport, TransportEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct HubInner {
    /// Acceptor transports parked under their rendezvous token, waiting for
    /// the initiator's answer round-trip.
    parked: Mutex<HashMap<String, Arc<MemoryTransport>>>,
    /// Every transport this hub ever created, for the writability gate.
    members: Mutex<Vec<Weak<MemoryTransport>>>,
    writable: AtomicBool,
}

/// Shared rendezvous point. Clone-cheap; both sessions under test hold the
/// same hub.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                parked: Mutex::new(HashMap::new()),
                members: Mutex::new(Vec::new()),
                writable: AtomicBool::new(true),
            }),
        }
    }

    /// Open or close the writability gate. Closing makes every `send` refuse
    /// frames; reopening emits `Writable` to each transport that was refused
    /// while the gate was shut.
    pub fn set_writable(&self, writable: bool) {
        self.inner.writable.store(writable, Ordering::SeqCst);
        if !writable {
            return;
        }
        for member in lock(&self.inner.members).iter() {
            if let Some(transport) = member.upgrade() {
                if transport.blocked.swap(false, Ordering::SeqCst) {
                    transport.emit(TransportEvent::Writable);
                }
            }
        }
    }

    fn create(&self, remote_id: &str, token: Option<String>) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new_cyclic(|me| MemoryTransport {
            me: me.clone(),
            hub: self.inner.clone(),
            remote_id: remote_id.to_string(),
            events,
            token: Mutex::new(token),
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
        });
        lock(&self.inner.members).push(Arc::downgrade(&transport));
        (transport, events_rx)
    }
}

impl LinkFactory for MemoryHub {
    fn initiate(
        &self,
        remote_id: &str,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let token = Uuid::new_v4().to_string();
        let (transport, events_rx) = self.create(remote_id, Some(token.clone()));
        transport.emit(TransportEvent::SignalOut(json!({
            "kind": "offer",
            "token": token,
        })));
        (transport, events_rx)
    }

    fn accept(
        &self,
        remote_id: &str,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport, events_rx) = self.create(remote_id, None);
        (transport, events_rx)
    }
}

pub struct MemoryTransport {
    me: Weak<MemoryTransport>,
    hub: Arc<HubInner>,
    remote_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    token: Mutex<Option<String>>,
    peer: Mutex<Option<Arc<MemoryTransport>>>,
    closed: AtomicBool,
    blocked: AtomicBool,
}

impl MemoryTransport {
    fn emit(&self, event: TransportEvent) {
        // The receiver disappearing just means the link driver is gone.
        let _ = self.events.send(event);
    }

    fn pair_with(&self, other: Arc<MemoryTransport>) {
        if let Some(me) = self.me.upgrade() {
            *lock(&other.peer) = Some(me);
        }
        *lock(&self.peer) = Some(other.clone());
        other.emit(TransportEvent::Connected);
        self.emit(TransportEvent::Connected);
    }
}

impl PeerTransport for MemoryTransport {
    fn feed_signal(&self, payload: Value) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let kind = payload["kind"].as_str().unwrap_or_default();
        let Some(token) = payload["token"].as_str() else {
            warn!(remote = %self.remote_id, "signal without token, ignoring");
            return;
        };
        match kind {
            // Acceptor side: learn the token, park under it, answer back.
            "offer" => {
                *lock(&self.token) = Some(token.to_string());
                if let Some(me) = self.me.upgrade() {
                    lock(&self.hub.parked).insert(token.to_string(), me);
                }
                self.emit(TransportEvent::SignalOut(json!({
                    "kind": "answer",
                    "token": token,
                })));
            }
            // Initiator side: the answer closes the loop.
            "answer" => {
                if lock(&self.token).as_deref() != Some(token) {
                    warn!(remote = %self.remote_id, "answer token mismatch, ignoring");
                    return;
                }
                match lock(&self.hub.parked).remove(token) {
                    Some(other) => self.pair_with(other),
                    None => {
                        debug!(remote = %self.remote_id, "no parked acceptor for answer, dropping");
                    }
                }
            }
            other => {
                warn!(remote = %self.remote_id, kind = %other, "unknown signal kind, ignoring");
            }
        }
    }

    fn send(&self, frame: &[u8]) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if !self.hub.writable.load(Ordering::SeqCst) {
            self.blocked.store(true, Ordering::SeqCst);
            return false;
        }
        match lock(&self.peer).clone() {
            Some(peer) => {
                peer.emit(TransportEvent::Data(frame.to_vec()));
                true
            }
            None => false,
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = lock(&self.token).take() {
            lock(&self.hub.parked).remove(&token);
        }
        self.emit(TransportEvent::Closed);
        if let Some(peer) = lock(&self.peer).take() {
            peer.close();
        }
    }
}
