use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::state::AppState;

/// Structured health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: ConnectionCounts,
    pub lobbies: LobbyCounts,
}

#[derive(Debug, Serialize)]
pub struct ConnectionCounts {
    pub websocket: usize,
    pub registered: usize,
}

#[derive(Debug, Serialize)]
pub struct LobbyCounts {
    /// Records in the lobby store, including ones awaiting purge.
    pub stored: usize,
    /// Lobbies with a running actor.
    pub active: usize,
}

/// Returns server status, connection counts and lobby counts as JSON.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: ConnectionCounts {
            websocket: state.ws_connection_count.load(Ordering::Relaxed),
            registered: state.transport.connection_count().await,
        },
        lobbies: LobbyCounts {
            stored: state.registry.len().await,
            active: state.orchestrator.active_count().await,
        },
    })
}

/// Readiness check. Not ready once shutdown has begun, so load balancers
/// stop routing new sockets here while games drain.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready: shutting down");
    }
    (StatusCode::OK, "ready")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes() {
        let resp = HealthResponse {
            status: "healthy",
            version: "0.1.0",
            connections: ConnectionCounts {
                websocket: 5,
                registered: 4,
            },
            lobbies: LobbyCounts {
                stored: 2,
                active: 1,
            },
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"healthy\""));
        assert!(json.contains("\"websocket\":5"));
        assert!(json.contains("\"active\":1"));
    }
}
