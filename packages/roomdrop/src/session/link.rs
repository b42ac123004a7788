//! Link driver: one task per peer link.
//!
//! The driver owns the transport's event stream and the inbound file state.
//! It enforces the connect timeout, relays outbound signaling to the session,
//! and decodes data frames into the transfer engine. The session only ever
//! hears coarse notices.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::transfer::InboundFiles;
use super::transport::{PeerTransport, TransportEvent};
use crate::proto::{LinkFrame, decode_link_frame};

/// Where a link is in its lifetime. The session keeps one per remote id;
/// a closed link is removed from the map rather than kept around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake in flight; no frames may be sent.
    Signaling,
    Connected,
}

/// Reported by a link driver to the session actor.
#[derive(Debug)]
pub enum LinkNotice {
    /// The transport produced a signaling payload for the remote peer.
    SignalOut { remote: String, payload: Value },
    Connected { remote: String },
    /// The link is gone, whatever the reason. Always the last notice.
    Closed { remote: String },
}

pub fn spawn_driver(
    remote: String,
    transport: Arc<dyn PeerTransport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    connect_timeout: Duration,
    writable: watch::Sender<u64>,
    cancel: CancellationToken,
    notices: mpsc::Sender<LinkNotice>,
    inbound: InboundFiles,
) {
    tokio::spawn(run(
        remote,
        transport,
        events,
        connect_timeout,
        writable,
        cancel,
        notices,
        inbound,
    ));
}

#[allow(clippy::too_many_arguments)]
async fn run(
    remote: String,
    transport: Arc<dyn PeerTransport>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    connect_timeout: Duration,
    writable: watch::Sender<u64>,
    cancel: CancellationToken,
    notices: mpsc::Sender<LinkNotice>,
    mut inbound: InboundFiles,
) {
    debug!(remote = %remote, "link driver started");

    if signaling(&remote, &transport, &mut events, connect_timeout, &cancel, &notices).await {
        connected(&remote, &transport, &mut events, &writable, &cancel, &notices, &mut inbound)
            .await;
    }

    inbound.abort_open().await;
    let _ = notices
        .send(LinkNotice::Closed {
            remote: remote.clone(),
        })
        .await;
    debug!(remote = %remote, "link driver stopped");
}

/// Pump events until the transport connects. Returns `false` when the link
/// died first; a link that cannot connect within the timeout is closed.
async fn signaling(
    remote: &str,
    transport: &Arc<dyn PeerTransport>,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    connect_timeout: Duration,
    cancel: &CancellationToken,
    notices: &mpsc::Sender<LinkNotice>,
) -> bool {
    let deadline = tokio::time::sleep(connect_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                transport.close();
                return false;
            }
            _ = &mut deadline => {
                warn!(remote = %remote, timeout = ?connect_timeout, "connect timeout, closing link");
                transport.close();
                return false;
            }
            ev = events.recv() => match ev {
                Some(TransportEvent::SignalOut(payload)) => {
                    let _ = notices
                        .send(LinkNotice::SignalOut {
                            remote: remote.to_string(),
                            payload,
                        })
                        .await;
                }
                Some(TransportEvent::Connected) => {
                    let _ = notices
                        .send(LinkNotice::Connected {
                            remote: remote.to_string(),
                        })
                        .await;
                    return true;
                }
                Some(TransportEvent::Error(e)) => {
                    warn!(remote = %remote, "transport error during signaling: {}", e);
                    transport.close();
                    return false;
                }
                Some(TransportEvent::Closed) | None => return false,
                // No frames before Connected.
                Some(TransportEvent::Data(_)) | Some(TransportEvent::Writable) => {}
            }
        }
    }
}

async fn connected(
    remote: &str,
    transport: &Arc<dyn PeerTransport>,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    writable: &watch::Sender<u64>,
    cancel: &CancellationToken,
    notices: &mpsc::Sender<LinkNotice>,
    inbound: &mut InboundFiles,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                transport.close();
                return;
            }
            ev = events.recv() => match ev {
                Some(TransportEvent::Data(frame)) => match decode_link_frame(&frame) {
                    Ok(LinkFrame::Control(control)) => inbound.handle_control(control).await,
                    Ok(LinkFrame::Chunk(bytes)) => inbound.handle_chunk(&bytes).await,
                    Err(e) => {
                        warn!(remote = %remote, "dropping malformed link frame: {}", e);
                    }
                },
                Some(TransportEvent::Writable) => {
                    // Bump the generation; every parked sender re-checks.
                    writable.send_modify(|generation| *generation += 1);
                }
                Some(TransportEvent::SignalOut(payload)) => {
                    let _ = notices
                        .send(LinkNotice::SignalOut {
                            remote: remote.to_string(),
                            payload,
                        })
                        .await;
                }
                Some(TransportEvent::Connected) => {}
                Some(TransportEvent::Error(e)) => {
                    warn!(remote = %remote, "transport error: {}", e);
                    transport.close();
                    return;
                }
                Some(TransportEvent::Closed) | None => return,
            }
        }
    }
}
