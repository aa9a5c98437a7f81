//! WebSocket signaling endpoint
//!
//! This handler adapts an axum WebSocket to the `StreamMessage` trait. All
//! protocol logic lives in `SignalingHandler::run()`.
//!
//! The peer is registered before the upgrade, so a full room or a server in
//! fatal state is reported as a plain HTTP error instead of an upgraded socket
//! that closes immediately.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitStream, SinkExt, StreamExt};
use relaymesh_sfu::RoomId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::handler::{MessageSender, SignalingHandler, StreamMessage};
use crate::http::{AppError, AppResult, AppState};
use crate::protocol::{JsonCodec, ServerMessage};

/// Signaling frames are small; cap them well below axum's default
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Outbound frames buffered per connection before the client counts as too slow
const OUTBOUND_BUFFER: usize = 1000;

/// WebSocket stream implementation of `StreamMessage` trait
struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    sender: WebSocketMessageSender,
    is_alive: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl StreamMessage for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) => return None,
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                None => return None,
                Some(Ok(_)) => {
                    // Ignore binary, ping and pong frames
                }
            }
        }
    }

    fn send(&self, message: ServerMessage) -> Result<(), String> {
        MessageSender::send(&self.sender, message)
    }

    fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }
}

/// WebSocket message sender implementation
struct WebSocketMessageSender {
    sender: mpsc::Sender<String>,
}

impl MessageSender for WebSocketMessageSender {
    fn send(&self, message: ServerMessage) -> Result<(), String> {
        let text = JsonCodec::encode_server_message(&message)?;

        // try_send: a client that stops reading must not stall the room
        self.sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                "Channel full: WebSocket client too slow to consume messages".to_string()
            }
            mpsc::error::TrySendError::Closed(_) => {
                "Channel closed: WebSocket client disconnected".to_string()
            }
        })
    }
}

/// `GET /ws/{room_id}`: signaling channel for a named room
pub async fn room_websocket_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    if room_id.trim().is_empty() {
        return Err(AppError::bad_request("Room name must not be empty"));
    }
    upgrade(state, RoomId::from(room_id), ws).await
}

/// `GET /mediasoup`: signaling channel for the default room
pub async fn default_room_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let room_id = state.default_room.clone();
    upgrade(state, room_id, ws).await
}

async fn upgrade(
    state: AppState,
    room_id: RoomId,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let handler = SignalingHandler::open(Arc::clone(&state.supervisor), &room_id).await?;

    let supervisor = Arc::clone(&state.supervisor);
    let peer_id = handler.peer_id().clone();

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(move |e| {
            warn!(peer_id = %peer_id, error = %e, "WebSocket upgrade failed");
            tokio::spawn(async move {
                supervisor.disconnect(&peer_id).await;
            });
        })
        .on_upgrade(move |socket| handle_socket(socket, handler)))
}

async fn handle_socket(socket: WebSocket, handler: SignalingHandler) {
    let peer_id = handler.peer_id().clone();
    let room_id = handler.room_id().clone();
    info!(peer_id = %peer_id, room_id = %room_id, "WebSocket connection established");

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let is_alive = Arc::new(AtomicBool::new(true));

    let (mut sink, receiver) = socket.split();

    // Server messages -> WebSocket
    let is_alive_clone = Arc::clone(&is_alive);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                error!("Failed to send WebSocket message: {}", e);
                is_alive_clone.store(false, Ordering::Relaxed);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut stream = WebSocketStream {
        receiver,
        sender: WebSocketMessageSender { sender: tx },
        is_alive,
    };

    if let Err(e) = handler.run(&mut stream).await {
        error!(peer_id = %peer_id, "Signaling handler error: {}", e);
    }

    // Dropping the stream closes the outbound queue; the writer flushes and closes the socket
    drop(stream);
    let _ = writer.await;

    info!(peer_id = %peer_id, room_id = %room_id, "WebSocket connection closed");
}
