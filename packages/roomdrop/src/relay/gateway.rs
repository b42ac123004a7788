//! Connection gateway: accepts WebSocket upgrades and hands each connection
//! to its room.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use super::directory::RoomDirectory;
use super::room::Room;
use crate::proto::{ClientFrame, ServerFrame, decode_client_frame};

/// Build the relay router. The room id is taken from the request path and is
/// opaque from here on.
pub fn router(directory: Arc<RoomDirectory>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/rooms/{room}", get(upgrade))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(directory)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(directory): State<Arc<RoomDirectory>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, directory, room_id))
}

/// This connection's registration. The room is resolved through the
/// directory at join time; holding it here is safe because a room with a
/// member is never retired.
struct Joined {
    room: Arc<Mutex<Room>>,
    id: String,
    epoch: u64,
}

/// Drive one relay connection until it closes.
///
/// The connection is anonymous until its `join` frame arrives; a connection
/// that closes before joining leaves no trace in the room.
pub async fn handle_socket(socket: WebSocket, directory: Arc<RoomDirectory>, room_id: String) {
    debug!(room = %room_id, "relay connection opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound sink for this participant; the room broadcasts into it.
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(64);

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    error!("failed to serialize relay frame: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut joined: Option<Joined> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Some(frame) = decode_client_frame(&text) else {
                        continue;
                    };
                    match frame {
                        ClientFrame::Join { id } => {
                            // Re-join under a new id is an explicit
                            // leave-then-join, not an in-place mutation.
                            if let Some(prev) = joined.take() {
                                if prev.id != id {
                                    prev.room.lock().await.handle_leave(&prev.id, prev.epoch);
                                    directory.retire_if_empty(&room_id).await;
                                }
                            }
                            let (room, epoch) =
                                directory.join(&room_id, id.clone(), tx.clone()).await;
                            joined = Some(Joined { room, id, epoch });
                        }
                        ClientFrame::Signal { to, from, signal } => match &joined {
                            Some(j) => j.room.lock().await.handle_signal(from, &to, signal),
                            None => match directory.find(&room_id).await {
                                Some(room) => {
                                    room.lock().await.handle_signal(from, &to, signal);
                                }
                                None => {
                                    debug!(room = %room_id, "signal into an empty room, dropping");
                                }
                            },
                        },
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(room = %room_id, "client closed connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(room = %room_id, "relay socket error: {}", e);
                    break;
                }
                // The relay carries control JSON only; binary frames and
                // pings are ignored here (axum answers pings itself).
                Some(Ok(_)) => {}
            },
            _ = &mut send_task => break,
        }
    }
    send_task.abort();

    // Close and error share this path: a leave is a leave.
    if let Some(j) = joined {
        j.room.lock().await.handle_leave(&j.id, j.epoch);
        directory.retire_if_empty(&room_id).await;
    }
    debug!(room = %room_id, "relay connection closed");
}
