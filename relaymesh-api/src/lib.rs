// RelayMesh API Library
//
// Signaling protocol, the per-channel handler and the HTTP/WebSocket surface

pub mod handler;
pub mod http;
pub mod protocol;

// Re-export commonly used types
pub use handler::{MessageSender, SignalingHandler, StreamMessage};
pub use http::{create_router, AppState};
pub use protocol::{ClientMessage, ClientRequest, ErrorBody, JsonCodec, ServerMessage};
