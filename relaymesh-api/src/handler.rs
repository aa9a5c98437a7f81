//! Signaling protocol handler
//!
//! Transport-agnostic per-channel loop. The transport layer (WebSocket, or an
//! in-memory channel in tests) only provides a [`StreamMessage`]
//! implementation; request dispatch, push events and teardown live here.
//!
//! Requests of one channel run concurrently, each on its own task. Each
//! response is correlated with its request by id, so a slow engine call never
//! holds up unrelated requests. A request still running when the channel goes
//! away is left to finish; the manager discards its result at commit time.

use futures::stream::{FuturesUnordered, StreamExt};
use relaymesh_sfu::{
    ConnectionSupervisor, PeerEvent, PeerId, PeerSession, RoomId, SfuError, SfuManager,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::protocol::{
    ClientMessage, ClientRequest, JsonCodec, ServerMessage, BAD_REQUEST, INTERNAL_ERROR,
};

/// How often a quiet channel is checked for liveness
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Trait for sending server messages to clients
pub trait MessageSender: Send + Sync {
    fn send(&self, message: ServerMessage) -> Result<(), String>;
}

/// Bidirectional IO of one signaling channel
#[async_trait::async_trait]
pub trait StreamMessage: Send {
    /// Receive the next text frame
    ///
    /// Returns None when the connection is closed
    async fn recv(&mut self) -> Option<Result<String, String>>;

    fn send(&self, message: ServerMessage) -> Result<(), String>;

    fn is_alive(&self) -> bool;
}

/// What a request needs to run on its own, detached from the channel loop
#[derive(Clone)]
struct RequestContext {
    supervisor: Arc<ConnectionSupervisor>,
    peer_id: PeerId,
}

impl RequestContext {
    fn manager(&self) -> &SfuManager {
        self.supervisor.manager()
    }

    async fn execute(&self, request: ClientRequest) -> Result<Value, SfuError> {
        let manager = self.manager();
        let peer_id = &self.peer_id;
        match request {
            ClientRequest::GetCapabilities => {
                let capabilities = manager.rtp_capabilities(peer_id).await?;
                // `rtpCapabilities` is kept for clients written against older servers
                Ok(json!({
                    "capabilities": capabilities,
                    "rtpCapabilities": capabilities,
                }))
            }
            ClientRequest::CreateTransport { direction } => {
                let info = manager.create_transport(peer_id, direction).await?;
                Ok(to_value(&info))
            }
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                manager
                    .connect_transport(peer_id, &transport_id, &dtls_parameters)
                    .await?;
                Ok(json!({}))
            }
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let producer_id = manager
                    .produce(peer_id, &transport_id, kind, &rtp_parameters)
                    .await?;
                Ok(json!({ "producerId": producer_id }))
            }
            ClientRequest::Consume {
                producer_id,
                transport_id,
                rtp_capabilities,
            } => {
                let consumer = manager
                    .consume(
                        peer_id,
                        producer_id.as_ref(),
                        transport_id.as_ref(),
                        &rtp_capabilities,
                    )
                    .await?;
                Ok(to_value(&consumer))
            }
            ClientRequest::ResumeConsumer { consumer_id } => {
                manager.resume_consumer(peer_id, &consumer_id).await?;
                Ok(json!({}))
            }
            ClientRequest::CloseTransport { transport_id } => {
                manager.close_transport(peer_id, &transport_id).await?;
                Ok(json!({}))
            }
            ClientRequest::CloseProducer { producer_id } => {
                manager.close_producer(peer_id, &producer_id).await?;
                Ok(json!({}))
            }
            ClientRequest::CloseConsumer { consumer_id } => {
                manager.close_consumer(peer_id, &consumer_id).await?;
                Ok(json!({}))
            }
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

async fn handle_request(ctx: RequestContext, message: ClientMessage) -> ServerMessage {
    let ClientMessage { id, request } = message;
    let method = request.method();
    debug!(peer_id = %ctx.peer_id, id, method, "Handling request");

    match ctx.execute(request).await {
        Ok(data) => ServerMessage::ok(id, data),
        Err(e) => {
            if e.is_fatal() {
                error!(peer_id = %ctx.peer_id, id, method, error = %e, "Request hit a fatal failure");
                ctx.supervisor.report_fatal(e.to_string());
            } else {
                info!(peer_id = %ctx.peer_id, id, method, error = %e, "Request failed");
            }
            ServerMessage::from_error(id, &e)
        }
    }
}

/// Answer for a request whose task ended without a response
fn failed_request(id: u64, error: &JoinError) -> ServerMessage {
    if error.is_panic() {
        ServerMessage::error(id, INTERNAL_ERROR, "request handler panicked")
    } else {
        ServerMessage::error(id, INTERNAL_ERROR, "request was cancelled")
    }
}

/// Per-channel signaling handler
pub struct SignalingHandler {
    supervisor: Arc<ConnectionSupervisor>,
    session: PeerSession,
}

impl SignalingHandler {
    /// Register a new peer in `room_id`. Fails before any frame is exchanged
    /// if the room cannot take it.
    pub async fn open(
        supervisor: Arc<ConnectionSupervisor>,
        room_id: &RoomId,
    ) -> Result<Self, SfuError> {
        let session = supervisor.connect(room_id).await?;
        Ok(Self {
            supervisor,
            session,
        })
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.session.peer_id
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.session.room_id
    }

    /// Run the channel until either side closes it, then tear the peer down
    pub async fn run<S: StreamMessage>(self, stream: &mut S) -> Result<(), String> {
        let Self {
            supervisor,
            session,
        } = self;
        let PeerSession {
            peer_id,
            room_id,
            mut events,
        } = session;

        let result = Self::message_loop(&supervisor, &peer_id, &room_id, &mut events, stream).await;

        supervisor.disconnect(&peer_id).await;
        info!(peer_id = %peer_id, room_id = %room_id, "Signaling channel closed");
        result
    }

    async fn message_loop<S: StreamMessage>(
        supervisor: &Arc<ConnectionSupervisor>,
        peer_id: &PeerId,
        room_id: &RoomId,
        events: &mut mpsc::Receiver<PeerEvent>,
        stream: &mut S,
    ) -> Result<(), String> {
        stream.send(ServerMessage::Connected {
            peer_id: peer_id.clone(),
            room_id: room_id.clone(),
        })?;

        let ctx = RequestContext {
            supervisor: Arc::clone(supervisor),
            peer_id: peer_id.clone(),
        };
        let mut in_flight = FuturesUnordered::new();
        let terminated = supervisor.terminated();
        tokio::pin!(terminated);
        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = stream.recv() => {
                    match frame {
                        Some(Ok(text)) => match JsonCodec::decode_client_message(&text) {
                            Ok(message) => {
                                let id = message.id;
                                let task = tokio::spawn(handle_request(ctx.clone(), message));
                                in_flight.push(async move { (id, task.await) });
                            }
                            Err(bad) => {
                                warn!(peer_id = %peer_id, reason = %bad.reason, "Malformed signaling frame");
                                stream.send(ServerMessage::error(
                                    bad.id.unwrap_or(0),
                                    BAD_REQUEST,
                                    bad.reason,
                                ))?;
                            }
                        },
                        Some(Err(e)) => {
                            warn!(peer_id = %peer_id, error = %e, "Error receiving frame");
                            break;
                        }
                        None => {
                            debug!(peer_id = %peer_id, "Client closed the channel");
                            break;
                        }
                    }
                }

                Some((id, joined)) = in_flight.next(), if !in_flight.is_empty() => {
                    let response = joined.unwrap_or_else(|e| {
                        error!(peer_id = %peer_id, id, error = %e, "Request task failed");
                        failed_request(id, &e)
                    });
                    stream.send(response)?;
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let message = ServerMessage::from(event);
                    let disconnect = matches!(message, ServerMessage::Disconnected { .. });
                    stream.send(message)?;
                    if disconnect {
                        info!(peer_id = %peer_id, "Server requested disconnect");
                        break;
                    }
                }

                () = &mut terminated => {
                    break;
                }

                _ = heartbeat.tick() => {
                    if !stream.is_alive() {
                        info!(peer_id = %peer_id, "Connection no longer alive");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
