//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::http::auth::AuthError;
use crate::relay::session_ws_handler;
use crate::util::time::uptime_secs;

/// Build the relay router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS]);

    // Long-lived sockets must not fall under the request timeout
    let http_routes = Router::new()
        .route("/health", get(health_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(10)));

    let ws_routes = Router::new().route("/sessions/:session_id/ws", get(session_ws_handler));

    Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    connected_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.sessions.active_sessions(),
        connected_players: state.sessions.connected_players(),
    })
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        match self {
            AppError::Unauthorized(e) => e.into_response(),
            AppError::Internal(msg) => {
                let body = serde_json::json!({
                    "error": msg
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::RelayConfig;

    fn state() -> AppState {
        AppState::new(RelayConfig {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".into(),
            log_json: false,
            relay_secret: "secret".into(),
            log_dir: None,
            max_records: 100,
            session_grace: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let state = state();
        let (_room, _blue) = state.sessions.join("room").unwrap();

        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["activeSessions"], 1);
        assert_eq!(json["connectedPlayers"], 1);
    }
}
