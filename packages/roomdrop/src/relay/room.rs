//! Per-room membership authority.
//!
//! One `Room` owns the participant map for one room id. All mutation happens
//! behind a single `tokio::sync::Mutex<Room>` held by the directory, so joins,
//! leaves and signal routing never interleave within a room.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::proto::ServerFrame;

/// One registered endpoint: its outbound sink and the epoch of its join.
///
/// The epoch lets a stale connection-close (from a join that was since
/// overwritten by a newer connection reusing the same id) skip removal.
struct Participant {
    sink: mpsc::Sender<ServerFrame>,
    epoch: u64,
}

pub struct Room {
    id: String,
    participants: HashMap<String, Participant>,
    next_epoch: u64,
}

impl Room {
    pub fn new(id: String) -> Self {
        Self {
            id,
            participants: HashMap::new(),
            next_epoch: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Register a participant, last writer wins on id collision.
    ///
    /// Sends the joiner its `all-peers` snapshot before broadcasting
    /// `peer-joined` to the others; since both happen under the room lock and
    /// every sink is FIFO, no observer can see the announcement before the
    /// joiner has its peer list queued.
    ///
    /// Returns the join epoch, which the connection must hand back to
    /// [`Room::handle_leave`].
    pub fn handle_join(&mut self, id: String, sink: mpsc::Sender<ServerFrame>) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let peers: Vec<String> = self
            .participants
            .keys()
            .filter(|other| **other != id)
            .cloned()
            .collect();

        if self
            .participants
            .insert(id.clone(), Participant { sink: sink.clone(), epoch })
            .is_some()
        {
            debug!(room = %self.id, participant = %id, "join replaced an existing registration");
        }

        if sink.try_send(ServerFrame::AllPeers { peers }).is_err() {
            warn!(room = %self.id, participant = %id, "failed to send all-peers to joiner");
        }

        self.broadcast(ServerFrame::PeerJoined { id: id.clone() }, Some(&id));
        debug!(room = %self.id, participant = %id, members = self.participants.len(), "participant joined");
        epoch
    }

    /// Route a signaling payload to `to` if it is currently a member.
    ///
    /// An unknown recipient is not an error: the remote may have left while
    /// the handshake was in flight.
    pub fn handle_signal(&self, from: String, to: &str, signal: serde_json::Value) {
        match self.participants.get(to) {
            Some(target) => {
                if target.sink.try_send(ServerFrame::Signal { from, signal }).is_err() {
                    warn!(room = %self.id, to = %to, "failed to deliver signal");
                }
            }
            None => {
                debug!(room = %self.id, to = %to, "dropping signal for unknown participant");
            }
        }
    }

    /// Remove a participant and announce the departure.
    ///
    /// Removal only happens when the stored epoch matches: a close event from
    /// a connection whose id was since taken over by a newer join must not
    /// evict the new registration.
    pub fn handle_leave(&mut self, id: &str, epoch: u64) {
        let current = match self.participants.get(id) {
            Some(p) if p.epoch == epoch => true,
            Some(_) => {
                debug!(room = %self.id, participant = %id, "ignoring stale leave");
                false
            }
            None => false,
        };
        if !current {
            return;
        }
        self.participants.remove(id);
        self.broadcast(ServerFrame::PeerLeft { id: id.to_string() }, None);
        debug!(room = %self.id, participant = %id, members = self.participants.len(), "participant left");
    }

    /// Deliver a frame to every participant except `exclude`.
    ///
    /// Delivery is fire-and-forget per sink: a closed or full sink is logged
    /// and skipped; only the transport close path removes participants.
    pub fn broadcast(&self, frame: ServerFrame, exclude: Option<&str>) {
        for (id, participant) in &self.participants {
            if exclude.is_some_and(|ex| ex == id) {
                continue;
            }
            if participant.sink.try_send(frame.clone()).is_err() {
                warn!(room = %self.id, participant = %id, "broadcast delivery failed, skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (mpsc::Sender<ServerFrame>, mpsc::Receiver<ServerFrame>) {
        mpsc::channel(16)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn first_join_gets_empty_peer_list() {
        let mut room = Room::new("ABCDEF".into());
        let (tx, mut rx) = sink();
        room.handle_join("p1".into(), tx);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerFrame::AllPeers { peers } => assert!(peers.is_empty()),
            other => panic!("Expected AllPeers, got {other:?}"),
        }
    }

    #[test]
    fn second_join_sees_first_and_first_is_notified() {
        let mut room = Room::new("ABCDEF".into());
        let (tx1, mut rx1) = sink();
        let (tx2, mut rx2) = sink();
        room.handle_join("p1".into(), tx1);
        drain(&mut rx1);

        room.handle_join("p2".into(), tx2);

        // Joiner: snapshot excluding itself.
        let frames2 = drain(&mut rx2);
        assert_eq!(frames2.len(), 1);
        match &frames2[0] {
            ServerFrame::AllPeers { peers } => assert_eq!(peers, &vec!["p1".to_string()]),
            other => panic!("Expected AllPeers, got {other:?}"),
        }

        // Existing member: announcement only.
        let frames1 = drain(&mut rx1);
        assert_eq!(frames1.len(), 1);
        match &frames1[0] {
            ServerFrame::PeerJoined { id } => assert_eq!(id, "p2"),
            other => panic!("Expected PeerJoined, got {other:?}"),
        }
    }

    #[test]
    fn join_leave_replay_is_last_write_wins() {
        let mut room = Room::new("r".into());
        let (tx, _rx) = sink();

        let e1 = room.handle_join("a".into(), tx.clone());
        let _e2 = room.handle_join("b".into(), tx.clone());
        let e3 = room.handle_join("a".into(), tx.clone()); // collision, replaces e1
        room.handle_leave("b", 1);

        assert_eq!(room.len(), 1);
        // The stale epoch from the replaced join must not evict the new one.
        room.handle_leave("a", e1);
        assert_eq!(room.len(), 1);
        room.handle_leave("a", e3);
        assert!(room.is_empty());
    }

    #[test]
    fn signal_delivered_iff_member() {
        let mut room = Room::new("r".into());
        let (tx, mut rx) = sink();
        room.handle_join("p1".into(), tx);
        drain(&mut rx);

        room.handle_signal("p2".into(), "p1", serde_json::json!({"sdp": "x"}));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerFrame::Signal { from, signal } => {
                assert_eq!(from, "p2");
                assert_eq!(signal["sdp"], "x");
            }
            other => panic!("Expected Signal, got {other:?}"),
        }

        // Unknown recipient: silent no-op.
        room.handle_signal("p1".into(), "ghost", serde_json::json!({}));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn leave_broadcasts_to_remaining() {
        let mut room = Room::new("r".into());
        let (tx1, mut rx1) = sink();
        let (tx2, mut rx2) = sink();
        let _e1 = room.handle_join("p1".into(), tx1);
        let e2 = room.handle_join("p2".into(), tx2);
        drain(&mut rx1);
        drain(&mut rx2);

        room.handle_leave("p2", e2);

        let frames = drain(&mut rx1);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerFrame::PeerLeft { id } => assert_eq!(id, "p2"),
            other => panic!("Expected PeerLeft, got {other:?}"),
        }
        // The departed participant hears nothing.
        assert!(drain(&mut rx2).is_empty());
    }

    #[test]
    fn duplicate_leave_is_a_no_op() {
        let mut room = Room::new("r".into());
        let (tx1, mut rx1) = sink();
        let (tx2, _rx2) = sink();
        let _ = room.handle_join("p1".into(), tx1);
        let e2 = room.handle_join("p2".into(), tx2);
        drain(&mut rx1);

        room.handle_leave("p2", e2);
        drain(&mut rx1);
        room.handle_leave("p2", e2);
        assert!(drain(&mut rx1).is_empty());
    }

    #[test]
    fn broadcast_skips_closed_sinks() {
        let mut room = Room::new("r".into());
        let (tx1, rx1) = sink();
        let (tx2, mut rx2) = sink();
        let _ = room.handle_join("p1".into(), tx1);
        let _ = room.handle_join("p2".into(), tx2);
        drain(&mut rx2);
        drop(rx1); // p1's connection is gone but leave hasn't run yet

        room.broadcast(
            ServerFrame::PeerJoined { id: "p3".into() },
            None,
        );

        // p2 still gets the frame; p1's failure did not abort the fan-out.
        assert_eq!(drain(&mut rx2).len(), 1);
        assert_eq!(room.len(), 2);
    }
}
