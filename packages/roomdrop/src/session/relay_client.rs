//! Relay connection machine.
//!
//! One task owns the WebSocket to the relay and cycles
//! `Connecting → Open → Down(backoff)` forever until cancelled. Every open
//! connection starts by re-sending `join`, so the relay answers with a fresh
//! `all-peers` snapshot and the session can re-initiate links after an outage.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::proto::{ClientFrame, ServerFrame, decode_server_frame};

/// What the connection task reports to the session.
#[derive(Debug)]
pub enum RelayEvent {
    /// Joined the room; an `all-peers` frame follows from the relay.
    Open,
    /// A decoded frame from the relay.
    Frame(ServerFrame),
    /// The connection dropped; a reconnect attempt is scheduled.
    Down,
}

/// Outbound side of the relay connection.
///
/// Frames sent while the socket is down are dropped, matching the
/// at-most-once relay contract; signaling recovers via the re-join snapshot.
#[derive(Clone)]
pub struct RelayHandle {
    outbox: mpsc::UnboundedSender<ClientFrame>,
    connected: watch::Receiver<bool>,
}

impl RelayHandle {
    pub fn send(&self, frame: ClientFrame) {
        if !*self.connected.borrow() {
            debug!("relay is down, dropping outbound frame");
            return;
        }
        let _ = self.outbox.send(frame);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

/// Spawn the connection task. `url` points at the room endpoint
/// (`ws://host:port/rooms/{room}`); `participant_id` is sent in the `join`
/// frame on every (re)connect.
pub fn spawn(
    url: String,
    participant_id: String,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) -> (RelayHandle, mpsc::Receiver<RelayEvent>) {
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let (connected_tx, connected) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(64);

    tokio::spawn(run(
        url,
        participant_id,
        reconnect_delay,
        cancel,
        outbox_rx,
        connected_tx,
        events_tx,
    ));

    (RelayHandle { outbox, connected }, events_rx)
}

async fn run(
    url: String,
    participant_id: String,
    reconnect_delay: Duration,
    cancel: CancellationToken,
    mut outbox_rx: mpsc::UnboundedReceiver<ClientFrame>,
    connected_tx: watch::Sender<bool>,
    events: mpsc::Sender<RelayEvent>,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                // Anything queued against the previous connection is stale.
                while outbox_rx.try_recv().is_ok() {}

                if join(&mut ws, &participant_id).await {
                    info!(url = %url, id = %participant_id, "joined relay room");
                    let _ = connected_tx.send(true);
                    let _ = events.send(RelayEvent::Open).await;

                    let keep_going =
                        drive(&mut ws, &mut outbox_rx, &cancel, &events).await;

                    let _ = connected_tx.send(false);
                    let _ = events.send(RelayEvent::Down).await;
                    if !keep_going {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(url = %url, "relay connect failed: {}", e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    let _ = connected_tx.send(false);
    debug!("relay connection task stopped");
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn join(ws: &mut Socket, participant_id: &str) -> bool {
    let frame = ClientFrame::Join {
        id: participant_id.to_string(),
    };
    let json = match serde_json::to_string(&frame) {
        Ok(j) => j,
        Err(e) => {
            error!("failed to serialize join frame: {}", e);
            return false;
        }
    };
    match ws.send(Message::Text(json.into())).await {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to send join frame: {}", e);
            false
        }
    }
}

/// Pump one open connection. Returns `false` when the task should stop for
/// good (cancelled, or every handle and listener is gone).
async fn drive(
    ws: &mut Socket,
    outbox_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    cancel: &CancellationToken,
    events: &mpsc::Sender<RelayEvent>,
) -> bool {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return false;
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(frame) = decode_server_frame(text.as_str()) {
                        if events.send(RelayEvent::Frame(frame)).await.is_err() {
                            return false;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("relay closed the connection");
                    return true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("relay socket error: {}", e);
                    return true;
                }
            },
            frame = outbox_rx.recv() => match frame {
                Some(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(j) => j,
                        Err(e) => {
                            error!("failed to serialize relay frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws.send(Message::Text(json.into())).await {
                        warn!("relay send failed: {}", e);
                        return true;
                    }
                }
                None => return false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn handle_drops_frames_while_down() {
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let handle = RelayHandle { outbox, connected };

        handle.send(ClientFrame::Signal {
            to: "p2".into(),
            from: "p1".into(),
            signal: json!({"sdp": "x"}),
        });
        assert!(outbox_rx.try_recv().is_err());
        assert!(!handle.is_connected());

        connected_tx.send(true).unwrap();
        handle.send(ClientFrame::Join { id: "p1".into() });
        assert!(outbox_rx.try_recv().is_ok());
        assert!(handle.is_connected());
    }
}
