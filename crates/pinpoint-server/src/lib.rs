pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod orchestrator;
pub mod persistence;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod transport;
pub mod ws;

use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use config::ServerConfig;
use state::{AppState, Backends};

/// Build the Axum router and application state, and start the transport
/// event dispatcher.
pub fn build_app(config: ServerConfig, backends: Backends) -> (Router<()>, AppState) {
    let (state, events) = AppState::new(config, backends);
    state.hub.spawn_dispatcher(events);

    // REST routes (behind identity middleware)
    let api_routes = Router::new()
        .route("/lobbies", post(api::create_lobby))
        .route("/lobbies/{id}", get(api::get_lobby))
        .route("/lobbies/{id}/join", post(api::join_lobby))
        .route("/lobbies/{id}/start", post(api::start_lobby))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::identity_middleware,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.config.limits.request_timeout(),
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/ws/lobbies/{id}", get(ws::ws_handler))
        .nest("/api/v1", api_routes)
        .layer(cors)
        .with_state(state.clone());

    (app, state)
}

/// Background task that purges expired lobbies and stops their actors.
/// Exits when shutdown begins.
pub fn spawn_reaper(state: AppState) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.config.lobbies.reap_interval_secs.max(1));
    let token = state.shutdown.token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {},
            }
            match state.registry.purge_expired().await {
                Ok(purged) => {
                    for id in &purged {
                        state.orchestrator.stop(id).await;
                    }
                    if !purged.is_empty() {
                        tracing::info!(count = purged.len(), "Purged expired lobbies");
                    }
                },
                Err(e) => tracing::warn!(error = %e, "Lobby purge failed"),
            }
        }
        tracing::debug!("Reaper stopped");
    })
}
