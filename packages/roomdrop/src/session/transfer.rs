//! Transfer engine: chunked file movement over an established peer link.
//!
//! Outbound transfers run as their own tasks and push frames through the
//! link's transport, pausing on backpressure. Inbound reassembly lives in the
//! link driver, which exclusively owns the destination file. Both sides
//! report into the shared [`TransferTable`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::orchestrator::SessionEvent;
use super::transport::PeerTransport;
use crate::proto::{ControlFrame, encode_chunk, encode_control};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    /// Outbound, announced but no payload moved yet.
    Pending,
    /// Outbound, payload flowing.
    Active,
    /// Inbound, payload flowing.
    Receiving,
    Completed,
    Aborted,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Aborted)
    }
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub id: String,
    pub peer: String,
    pub name: String,
    pub size: u64,
    pub bytes_moved: u64,
    pub direction: TransferDirection,
    pub status: TransferStatus,
}

impl TransferSnapshot {
    /// Completion percentage. An empty file is complete the moment it exists.
    pub fn progress(&self) -> u8 {
        if self.size == 0 {
            100
        } else {
            ((self.bytes_moved.min(self.size) * 100) / self.size) as u8
        }
    }
}

/// Status and progress for every observed transfer.
///
/// Status updates are monotonic: once a transfer reaches `Completed` or
/// `Aborted` it stays there. Terminal entries linger for the retention
/// window so observers can read the outcome, then disappear.
pub struct TransferTable {
    entries: Arc<Mutex<HashMap<String, TransferSnapshot>>>,
    events: broadcast::Sender<SessionEvent>,
    retention: Duration,
}

impl TransferTable {
    pub fn new(events: broadcast::Sender<SessionEvent>, retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
            retention,
        })
    }

    pub async fn insert(&self, snapshot: TransferSnapshot) {
        self.publish(snapshot.clone());
        self.entries.lock().await.insert(snapshot.id.clone(), snapshot);
    }

    /// Record moved bytes, clamped to the declared size.
    pub async fn record_bytes(&self, id: &str, bytes_moved: u64) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }
        entry.bytes_moved = bytes_moved.min(entry.size);
        self.publish(entry.clone());
    }

    /// Move a transfer to `status`. Regressions out of a terminal state are
    /// ignored; entering one schedules removal after the retention window.
    pub async fn advance(&self, id: &str, status: TransferStatus) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        if entry.status.is_terminal() || entry.status == status {
            return;
        }
        entry.status = status;
        if status == TransferStatus::Completed {
            entry.bytes_moved = entry.size;
        }
        self.publish(entry.clone());

        if status.is_terminal() {
            let entries = self.entries.clone();
            let retention = self.retention;
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                entries.lock().await.remove(&id);
            });
        }
    }

    pub async fn snapshots(&self) -> Vec<TransferSnapshot> {
        self.entries.lock().await.values().cloned().collect()
    }

    fn publish(&self, snapshot: TransferSnapshot) {
        let _ = self.events.send(SessionEvent::TransferUpdate(snapshot));
    }
}

/// Push one frame, waiting out backpressure. Returns `false` if the link was
/// torn down before the transport accepted the frame.
///
/// The writable generation is marked seen before each attempt, so a bump
/// landing between a refused `send` and the wait still wakes this sender.
async fn deliver(
    transport: &Arc<dyn PeerTransport>,
    writable: &mut watch::Receiver<u64>,
    cancel: &CancellationToken,
    frame: &[u8],
) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        writable.borrow_and_update();
        if transport.send(frame) {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = writable.changed() => {
                // Err means the link driver is gone.
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Stream one file to the peer: file-start, chunks, file-end.
///
/// The snapshot (Pending) is already in the table when this task starts; the
/// caller verified the file and link beforehand. Any failure past that point
/// surfaces as `Aborted`, never as an error return.
#[allow(clippy::too_many_arguments)]
pub async fn send_file(
    transfer_id: String,
    name: String,
    size: u64,
    path: PathBuf,
    transport: Arc<dyn PeerTransport>,
    mut writable: watch::Receiver<u64>,
    cancel: CancellationToken,
    table: Arc<TransferTable>,
    chunk_size: usize,
) {
    let file_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    let start = ControlFrame::FileStart {
        name: name.clone(),
        size,
        file_type,
        file_id: transfer_id.clone(),
    };
    let frame = match encode_control(&start) {
        Ok(f) => f,
        Err(e) => {
            warn!(transfer = %transfer_id, "failed to encode file-start: {}", e);
            table.advance(&transfer_id, TransferStatus::Aborted).await;
            return;
        }
    };
    if !deliver(&transport, &mut writable, &cancel, &frame).await {
        table.advance(&transfer_id, TransferStatus::Aborted).await;
        return;
    }
    table.advance(&transfer_id, TransferStatus::Active).await;

    let mut file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(transfer = %transfer_id, path = %path.display(), "failed to open file: {}", e);
            table.advance(&transfer_id, TransferStatus::Aborted).await;
            return;
        }
    };

    let mut buf = vec![0u8; chunk_size];
    let mut sent: u64 = 0;
    while sent < size {
        // Reads are capped at the declared size; a file that grew since it
        // was announced is cut off there.
        let want = (size - sent).min(chunk_size as u64) as usize;
        let n = match read_chunk(&mut file, &mut buf[..want]).await {
            Ok(n) => n,
            Err(e) => {
                warn!(transfer = %transfer_id, "read failed: {}", e);
                table.advance(&transfer_id, TransferStatus::Aborted).await;
                return;
            }
        };
        if n < want {
            warn!(transfer = %transfer_id, "file shrank below its declared size, aborting");
            table.advance(&transfer_id, TransferStatus::Aborted).await;
            return;
        }
        if !deliver(&transport, &mut writable, &cancel, &encode_chunk(&buf[..n])).await {
            table.advance(&transfer_id, TransferStatus::Aborted).await;
            return;
        }
        sent += n as u64;
        table.record_bytes(&transfer_id, sent).await;
    }

    let end = ControlFrame::FileEnd {
        file_id: transfer_id.clone(),
    };
    match encode_control(&end) {
        Ok(frame) if deliver(&transport, &mut writable, &cancel, &frame).await => {
            table.advance(&transfer_id, TransferStatus::Completed).await;
            info!(transfer = %transfer_id, name = %name, bytes = sent, "file sent");
        }
        _ => {
            table.advance(&transfer_id, TransferStatus::Aborted).await;
        }
    }
}

/// Fill `buf` from the file, stopping early only at EOF.
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Strip any path structure from a sender-provided file name.
fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

/// Pick a destination that does not clobber an existing download: `name`,
/// then `name (1)`, `name (2)`, keeping the extension in place.
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !tokio::fs::try_exists(&first).await.unwrap_or(false) {
        return first;
    }
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let candidate = dir.join(match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        });
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

struct OpenFile {
    id: String,
    path: PathBuf,
    file: File,
    size: u64,
    received: u64,
}

/// Inbound reassembly for one link. At most one file is open at a time; a
/// second file-start replaces the current one, aborting it.
pub struct InboundFiles {
    peer: String,
    download_dir: PathBuf,
    table: Arc<TransferTable>,
    open: Option<OpenFile>,
}

impl InboundFiles {
    pub fn new(peer: String, download_dir: PathBuf, table: Arc<TransferTable>) -> Self {
        Self {
            peer,
            download_dir,
            table,
            open: None,
        }
    }

    pub async fn handle_control(&mut self, frame: ControlFrame) {
        match frame {
            ControlFrame::FileStart {
                name,
                size,
                file_type: _,
                file_id,
            } => {
                if self.open.is_some() {
                    warn!(peer = %self.peer, "file-start while a file is open, replacing");
                    self.abort_open().await;
                }
                let name = sanitize_name(&name);
                self.table
                    .insert(TransferSnapshot {
                        id: file_id.clone(),
                        peer: self.peer.clone(),
                        name: name.clone(),
                        size,
                        bytes_moved: 0,
                        direction: TransferDirection::Inbound,
                        status: TransferStatus::Receiving,
                    })
                    .await;

                if let Err(e) = tokio::fs::create_dir_all(&self.download_dir).await {
                    warn!(dir = %self.download_dir.display(), "cannot create download dir: {}", e);
                    self.table.advance(&file_id, TransferStatus::Aborted).await;
                    return;
                }
                let path = unique_path(&self.download_dir, &name).await;
                match File::create(&path).await {
                    Ok(file) => {
                        debug!(peer = %self.peer, transfer = %file_id, path = %path.display(), "receiving file");
                        self.open = Some(OpenFile {
                            id: file_id,
                            path,
                            file,
                            size,
                            received: 0,
                        });
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "cannot create file: {}", e);
                        self.table.advance(&file_id, TransferStatus::Aborted).await;
                    }
                }
            }
            ControlFrame::FileEnd { file_id } => {
                match &self.open {
                    Some(open) if open.id == file_id => {}
                    Some(open) => {
                        warn!(peer = %self.peer, expected = %open.id, got = %file_id, "file-end id mismatch, ignoring");
                        return;
                    }
                    None => {
                        warn!(peer = %self.peer, "file-end with no open file, ignoring");
                        return;
                    }
                }
                // Checked above, the open file matches.
                if let Some(mut open) = self.open.take() {
                    if let Err(e) = open.file.flush().await {
                        warn!(transfer = %open.id, "flush failed: {}", e);
                        self.remove_partial(open).await;
                        return;
                    }
                    info!(peer = %self.peer, transfer = %open.id, bytes = open.received, "file received");
                    self.table.advance(&open.id, TransferStatus::Completed).await;
                }
            }
        }
    }

    pub async fn handle_chunk(&mut self, bytes: &[u8]) {
        let Some(open) = self.open.as_mut() else {
            warn!(peer = %self.peer, "chunk with no open file, dropping");
            return;
        };
        if open.received + bytes.len() as u64 > open.size {
            warn!(transfer = %open.id, declared = open.size, "chunk overruns the declared size, aborting");
            if let Some(open) = self.open.take() {
                self.remove_partial(open).await;
            }
            return;
        }
        if let Err(e) = open.file.write_all(bytes).await {
            warn!(transfer = %open.id, "write failed: {}", e);
            if let Some(open) = self.open.take() {
                self.remove_partial(open).await;
            }
            return;
        }
        open.received += bytes.len() as u64;
        let (id, received) = (open.id.clone(), open.received);
        self.table.record_bytes(&id, received).await;
    }

    /// Abort whatever is open, deleting the partial file. Idempotent.
    pub async fn abort_open(&mut self) {
        if let Some(open) = self.open.take() {
            debug!(peer = %self.peer, transfer = %open.id, "aborting inbound transfer");
            self.remove_partial(open).await;
        }
    }

    async fn remove_partial(&self, open: OpenFile) {
        drop(open.file);
        if let Err(e) = tokio::fs::remove_file(&open.path).await {
            warn!(path = %open.path.display(), "failed to remove partial file: {}", e);
        }
        self.table.advance(&open.id, TransferStatus::Aborted).await;
    }
}
