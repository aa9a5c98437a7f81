// Module: http
// HTTP surface: greeting, health checks and the WebSocket signaling endpoints

pub mod error;
pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use relaymesh_sfu::{ConnectionSupervisor, RoomId};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<ConnectionSupervisor>,
    /// Room joined through the legacy single-room endpoint
    pub default_room: RoomId,
}

impl AppState {
    #[must_use]
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        let default_room = RoomId::from(supervisor.manager().config().default_room.as_str());
        Self {
            supervisor,
            default_room,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(root))
        .merge(health::create_health_router())
        // WebSocket signaling endpoints
        .route("/ws/{room_id}", get(websocket::room_websocket_handler))
        .route("/mediasoup", get(websocket::default_room_websocket_handler));

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

async fn root() -> &'static str {
    "Hello from relaymesh!"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use relaymesh_sfu::{EngineEvent, LoopbackEngine, SfuConfig, SfuManager};
    use tower::ServiceExt;

    async fn state() -> (AppState, Arc<LoopbackEngine>) {
        let engine = Arc::new(LoopbackEngine::new());
        let manager = SfuManager::start(SfuConfig::default(), engine.clone())
            .await
            .unwrap();
        (AppState::new(ConnectionSupervisor::new(manager)), engine)
    }

    async fn get_text(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let (state, _engine) = state().await;
        assert_eq!(state.default_room.as_str(), "mediasoup");

        let (status, body) = get_text(create_router(state.clone()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello from relaymesh!");

        let (status, body) = get_text(create_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reports_fatal_failure() {
        let (state, engine) = state().await;
        let worker = engine.worker_ids().remove(0);
        state
            .supervisor
            .handle_engine_event(EngineEvent::WorkerDied {
                worker_id: worker,
                reason: "crashed".to_string(),
            })
            .await;

        let (status, body) = get_text(create_router(state), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("crashed"));
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (state, _engine) = state().await;
        state.supervisor.connect(&RoomId::from("a")).await.unwrap();

        let (status, body) = get_text(create_router(state), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["active_rooms"], 1);
        assert_eq!(stats["total_peers"], 1);
    }
}
