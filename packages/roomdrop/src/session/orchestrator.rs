//! Peer session actor.
//!
//! One task owns the link map and multiplexes three event sources: frames
//! from the relay, notices from link drivers, and caller commands. Callers
//! talk to it through a [`SessionHandle`]; observers subscribe to the
//! [`SessionEvent`] broadcast.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::link::{LinkNotice, LinkState, spawn_driver};
use super::relay_client::{self, RelayEvent, RelayHandle};
use super::transfer::{
    self, InboundFiles, TransferDirection, TransferSnapshot, TransferStatus, TransferTable,
};
use super::transport::{LinkFactory, PeerTransport};
use crate::config::SessionConfig;
use crate::proto::{ClientFrame, ServerFrame};

/// Coarse observations for UIs and tests.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RelayUp,
    RelayDown,
    PeerConnected { id: String },
    PeerClosed { id: String },
    TransferUpdate(TransferSnapshot),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer {0} is not connected")]
    PeerNotConnected(String),
    #[error("cannot read {path}: {source}")]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("{0} has no usable file name")]
    BadFileName(PathBuf),
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: String,
    pub state: LinkState,
}

enum SessionCommand {
    SendFile {
        peer: String,
        path: PathBuf,
        respond_to: oneshot::Sender<Result<String, SessionError>>,
    },
    Peers {
        respond_to: oneshot::Sender<Vec<PeerInfo>>,
    },
    Transfers {
        respond_to: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Queue a file for transfer to `peer`. Returns the transfer id; progress
    /// arrives as `TransferUpdate` events and through [`Self::transfers`].
    pub async fn send_file(
        &self,
        peer: &str,
        path: impl Into<PathBuf>,
    ) -> Result<String, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SendFile {
                peer: peer.to_string(),
                path: path.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Peers { respond_to: tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn transfers(&self) -> Result<Vec<TransferSnapshot>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Transfers { respond_to: tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Tear down every link and stop the relay loop. Idempotent; a second
    /// call finds the session already gone.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct Link {
    transport: Arc<dyn PeerTransport>,
    state: LinkState,
    cancel: CancellationToken,
    /// Writable generation; the driver bumps it, transfer tasks subscribe.
    writable: watch::Sender<u64>,
}

/// The session actor. Constructed through [`PeerSession::spawn`].
pub struct PeerSession {
    config: SessionConfig,
    factory: Arc<dyn LinkFactory>,
    relay: RelayHandle,
    relay_events: mpsc::Receiver<RelayEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    notices_rx: mpsc::Receiver<LinkNotice>,
    notices_tx: mpsc::Sender<LinkNotice>,
    links: HashMap<String, Link>,
    table: Arc<TransferTable>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl PeerSession {
    pub fn spawn(config: SessionConfig, factory: Arc<dyn LinkFactory>) -> SessionHandle {
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(256);
        let table = TransferTable::new(events.clone(), config.retention);

        let (relay, relay_events) = relay_client::spawn(
            config.relay_url.clone(),
            config.participant_id.clone(),
            config.reconnect_delay,
            cancel.clone(),
        );

        let (commands_tx, commands) = mpsc::channel(32);
        let (notices_tx, notices_rx) = mpsc::channel(64);

        let actor = PeerSession {
            config,
            factory,
            relay,
            relay_events,
            commands,
            notices_rx,
            notices_tx,
            links: HashMap::new(),
            table,
            events: events.clone(),
            cancel,
        };
        tokio::spawn(actor.run());

        SessionHandle {
            sender: commands_tx,
            events,
        }
    }

    async fn run(mut self) {
        info!(id = %self.config.participant_id, "peer session started");

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // Every handle is gone; nothing can command us anymore.
                    None => break,
                },
                Some(event) = self.relay_events.recv() => {
                    self.handle_relay_event(event);
                }
                Some(notice) = self.notices_rx.recv() => {
                    self.handle_notice(notice);
                }
            }
        }

        self.cancel.cancel();
        let remotes: Vec<String> = self.links.keys().cloned().collect();
        for remote in remotes {
            self.close_link(&remote);
        }
        info!(id = %self.config.participant_id, "peer session stopped");
    }

    /// Returns `true` when the session should stop.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::SendFile {
                peer,
                path,
                respond_to,
            } => {
                let _ = respond_to.send(self.start_send(peer, path).await);
            }
            SessionCommand::Peers { respond_to } => {
                let peers = self
                    .links
                    .iter()
                    .map(|(id, link)| PeerInfo {
                        id: id.clone(),
                        state: link.state,
                    })
                    .collect();
                let _ = respond_to.send(peers);
            }
            SessionCommand::Transfers { respond_to } => {
                let _ = respond_to.send(self.table.snapshots().await);
            }
            SessionCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Open => {
                let _ = self.events.send(SessionEvent::RelayUp);
            }
            RelayEvent::Down => {
                // Established links outlive a relay outage; only signaling
                // for new links is paused.
                let _ = self.events.send(SessionEvent::RelayDown);
            }
            RelayEvent::Frame(frame) => self.handle_relay_frame(frame),
        }
    }

    fn handle_relay_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::AllPeers { peers } => {
                debug!(count = peers.len(), "received peer snapshot");
                for peer in peers {
                    if !self.links.contains_key(&peer) {
                        self.open_link(peer, true);
                    }
                }
            }
            ServerFrame::PeerJoined { id } => {
                if !self.links.contains_key(&id) {
                    self.open_link(id, false);
                }
            }
            ServerFrame::Signal { from, signal } => match self.links.get(&from) {
                Some(link) => link.transport.feed_signal(signal),
                None => {
                    debug!(from = %from, "signal for unknown link, dropping");
                }
            },
            ServerFrame::PeerLeft { id } => {
                debug!(peer = %id, "peer left the room");
                self.close_link(&id);
            }
        }
    }

    fn handle_notice(&mut self, notice: LinkNotice) {
        match notice {
            LinkNotice::SignalOut { remote, payload } => {
                self.relay.send(ClientFrame::Signal {
                    to: remote,
                    from: self.config.participant_id.clone(),
                    signal: payload,
                });
            }
            LinkNotice::Connected { remote } => {
                if let Some(link) = self.links.get_mut(&remote) {
                    link.state = LinkState::Connected;
                    info!(peer = %remote, "peer connected");
                    let _ = self.events.send(SessionEvent::PeerConnected { id: remote });
                }
            }
            LinkNotice::Closed { remote } => {
                self.close_link(&remote);
            }
        }
    }

    fn open_link(&mut self, remote: String, initiate: bool) {
        let (transport, transport_events) = if initiate {
            self.factory.initiate(&remote)
        } else {
            self.factory.accept(&remote)
        };
        let cancel = self.cancel.child_token();
        let (writable, _) = watch::channel(0u64);
        let inbound = InboundFiles::new(
            remote.clone(),
            self.config.download_dir.clone(),
            self.table.clone(),
        );
        spawn_driver(
            remote.clone(),
            transport.clone(),
            transport_events,
            self.config.connect_timeout,
            writable.clone(),
            cancel.clone(),
            self.notices_tx.clone(),
            inbound,
        );
        debug!(peer = %remote, initiate, "link opened");
        self.links.insert(
            remote,
            Link {
                transport,
                state: LinkState::Signaling,
                cancel,
                writable,
            },
        );
    }

    /// Tear a link down. Safe to call for a link that is already gone, so
    /// `peer-left`, transport close and shutdown can all race here.
    fn close_link(&mut self, remote: &str) {
        let Some(link) = self.links.remove(remote) else {
            return;
        };
        link.cancel.cancel();
        link.transport.close();
        info!(peer = %remote, "link closed");
        let _ = self.events.send(SessionEvent::PeerClosed {
            id: remote.to_string(),
        });
    }

    async fn start_send(&mut self, peer: String, path: PathBuf) -> Result<String, SessionError> {
        let link = match self.links.get(&peer) {
            Some(link) if link.state == LinkState::Connected => link,
            _ => return Err(SessionError::PeerNotConnected(peer)),
        };

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|source| SessionError::FileUnreadable {
                path: path.clone(),
                source,
            })?;
        if !meta.is_file() {
            return Err(SessionError::NotAFile(path));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SessionError::BadFileName(path.clone()))?;

        let transfer_id = Uuid::new_v4().to_string();
        self.table
            .insert(TransferSnapshot {
                id: transfer_id.clone(),
                peer: peer.clone(),
                name: name.clone(),
                size: meta.len(),
                bytes_moved: 0,
                direction: TransferDirection::Outbound,
                status: TransferStatus::Pending,
            })
            .await;

        info!(peer = %peer, transfer = %transfer_id, name = %name, size = meta.len(), "starting file transfer");
        tokio::spawn(transfer::send_file(
            transfer_id.clone(),
            name,
            meta.len(),
            path,
            link.transport.clone(),
            link.writable.subscribe(),
            link.cancel.clone(),
            self.table.clone(),
            self.config.chunk_size,
        ));

        Ok(transfer_id)
    }
}
