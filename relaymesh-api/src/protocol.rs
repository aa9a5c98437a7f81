//! Signaling wire protocol
//!
//! Every frame is a JSON text message. Client requests carry a numeric `id`
//! and a `method`; the server answers each request with a `response` carrying
//! the same `id`. Everything else the server sends is a push event with no
//! request attached.

use relaymesh_sfu::{
    ConsumerId, Direction, DtlsParameters, MediaKind, PeerEvent, PeerId, ProducerId, RoomId,
    RtpCapabilities, RtpParameters, SfuError, TransportId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code for frames that could not be decoded
pub const BAD_REQUEST: &str = "bad_request";

/// Error code for requests that died without producing an answer
pub const INTERNAL_ERROR: &str = "internal";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientMessage {
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "method",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    GetCapabilities,
    CreateTransport {
        direction: Direction,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        /// Newest producer of another peer when absent
        #[serde(default)]
        producer_id: Option<ProducerId>,
        /// The peer's receive transport when absent
        #[serde(default)]
        transport_id: Option<TransportId>,
        #[serde(alias = "capabilities")]
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    CloseTransport {
        transport_id: TransportId,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    CloseConsumer {
        consumer_id: ConsumerId,
    },
}

impl ClientRequest {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetCapabilities => "get-capabilities",
            Self::CreateTransport { .. } => "create-transport",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::CloseTransport { .. } => "close-transport",
            Self::CloseProducer { .. } => "close-producer",
            Self::CloseConsumer { .. } => "close-consumer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Connected {
        peer_id: PeerId,
        room_id: RoomId,
    },
    Disconnected {
        reason: String,
    },
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    TransportClosed {
        transport_id: TransportId,
    },
}

impl ServerMessage {
    #[must_use]
    pub const fn ok(id: u64, data: Value) -> Self {
        Self::Response {
            id,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn error(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            data: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    #[must_use]
    pub fn from_error(id: u64, err: &SfuError) -> Self {
        Self::Response {
            id,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }
}

impl From<PeerEvent> for ServerMessage {
    fn from(event: PeerEvent) -> Self {
        match event {
            PeerEvent::NewProducer {
                producer_id,
                peer_id,
                kind,
            } => Self::NewProducer {
                producer_id,
                peer_id,
                kind,
            },
            PeerEvent::ProducerClosed { producer_id } => Self::ProducerClosed { producer_id },
            PeerEvent::ConsumerClosed {
                consumer_id,
                producer_id,
            } => Self::ConsumerClosed {
                consumer_id,
                producer_id,
            },
            PeerEvent::TransportClosed { transport_id } => Self::TransportClosed { transport_id },
            PeerEvent::Disconnected { reason } => Self::Disconnected { reason },
        }
    }
}

/// A text frame that is not a valid request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    /// Request id, if one could be recovered from the frame
    pub id: Option<u64>,
    pub reason: String,
}

/// JSON encoding of signaling frames
pub struct JsonCodec;

impl JsonCodec {
    pub fn decode_client_message(text: &str) -> Result<ClientMessage, MalformedFrame> {
        serde_json::from_str(text).map_err(|e| MalformedFrame {
            id: serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_u64)),
            reason: e.to_string(),
        })
    }

    pub fn encode_server_message(message: &ServerMessage) -> Result<String, String> {
        serde_json::to_string(message).map_err(|e| format!("Failed to encode server message: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_requests() {
        let msg = JsonCodec::decode_client_message(r#"{"id":1,"method":"get-capabilities"}"#)
            .unwrap();
        assert_eq!(msg.id, 1);
        assert_eq!(msg.request, ClientRequest::GetCapabilities);

        let msg = JsonCodec::decode_client_message(
            r#"{"id":2,"method":"create-transport","direction":"recv"}"#,
        )
        .unwrap();
        assert_eq!(
            msg.request,
            ClientRequest::CreateTransport {
                direction: Direction::Receive
            }
        );

        let msg = JsonCodec::decode_client_message(
            r#"{"id":3,"method":"resume-consumer","consumerId":"c1"}"#,
        )
        .unwrap();
        assert_eq!(msg.request.method(), "resume-consumer");
    }

    #[test]
    fn test_decode_consume_with_defaults() {
        let msg = JsonCodec::decode_client_message(
            r#"{"id":7,"method":"consume","capabilities":{"codecs":[]}}"#,
        )
        .unwrap();
        match msg.request {
            ClientRequest::Consume {
                producer_id,
                transport_id,
                rtp_capabilities,
            } => {
                assert!(producer_id.is_none());
                assert!(transport_id.is_none());
                assert!(rtp_capabilities.codecs.is_empty());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames_keep_their_id() {
        let err = JsonCodec::decode_client_message(r#"{"id":9,"method":"teleport"}"#).unwrap_err();
        assert_eq!(err.id, Some(9));

        let err = JsonCodec::decode_client_message("not json").unwrap_err();
        assert_eq!(err.id, None);
    }

    #[test]
    fn test_encode_server_messages() {
        let text = JsonCodec::encode_server_message(&ServerMessage::ok(4, json!({"producerId": "p"})))
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "response", "id": 4, "data": {"producerId": "p"}}));

        let err = SfuError::Incompatible("nope".to_string());
        let text = JsonCodec::encode_server_message(&ServerMessage::from_error(5, &err)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["error"]["code"], "incompatible");
        assert!(value.get("data").is_none());

        let event = ServerMessage::from(PeerEvent::ProducerClosed {
            producer_id: ProducerId::from("p1"),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "producer-closed", "producerId": "p1"}));
    }
}
