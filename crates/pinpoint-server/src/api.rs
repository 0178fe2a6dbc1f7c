use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use pinpoint_core::catalog::TargetSelection;
use pinpoint_core::error::GameError;
use pinpoint_core::identity::Identity;
use pinpoint_core::lobby::{Lobby, LobbyId};
use pinpoint_core::player::ConnectionStatus;

use crate::error::AppError;
use crate::state::AppState;

/// Optional overrides on top of the configured lobby defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CreateLobbyBody {
    pub round_count: Option<u8>,
    pub round_time_limit_secs: Option<u64>,
    pub max_players: Option<u8>,
    pub target: Option<TargetSelection>,
}

#[derive(Debug, Serialize)]
pub struct LobbyResponse {
    pub lobby: Lobby,
    /// Where to open the WebSocket for this lobby.
    pub ws_path: String,
}

impl LobbyResponse {
    fn new(lobby: Lobby) -> Self {
        let ws_path = format!("/ws/lobbies/{}", lobby.id);
        Self { lobby, ws_path }
    }
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub lobby_id: LobbyId,
    pub start_delay_ms: u64,
}

fn parse_lobby_id(raw: &str) -> Result<LobbyId, AppError> {
    LobbyId::parse(raw).ok_or_else(|| AppError(GameError::not_found(format!("lobby {raw}"))))
}

/// POST /api/v1/lobbies: create a lobby hosted by the caller.
pub async fn create_lobby(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateLobbyBody>,
) -> Result<(StatusCode, Json<LobbyResponse>), AppError> {
    let mut settings = state.config.lobbies.default_settings();
    if let Some(n) = body.round_count {
        settings.round_count = n;
    }
    if let Some(secs) = body.round_time_limit_secs {
        settings.round_time_limit_ms = secs.saturating_mul(1000);
    }
    if let Some(n) = body.max_players {
        settings.max_players = n;
    }
    if let Some(target) = body.target {
        settings.target = target;
    }

    let lobby = state.registry.create_lobby(&identity, settings).await?;
    state.orchestrator.spawn_lobby(lobby.clone()).await;
    Ok((StatusCode::CREATED, Json(LobbyResponse::new(lobby))))
}

/// GET /api/v1/lobbies/{id}
pub async fn get_lobby(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LobbyResponse>, AppError> {
    let id = parse_lobby_id(&id)?;
    let lobby = state.registry.get_lobby(&id).await?;
    Ok(Json(LobbyResponse::new(lobby)))
}

/// POST /api/v1/lobbies/{id}/join. Reserves a seat. The caller counts as
/// disconnected until their socket attaches.
pub async fn join_lobby(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<Json<LobbyResponse>, AppError> {
    let id = parse_lobby_id(&id)?;
    state.orchestrator.require(&id).await?;
    let (lobby, admission) = state
        .registry
        .join_lobby(&id, &identity, ConnectionStatus::Disconnected)
        .await?;
    tracing::info!(lobby = %id, user_id = identity.user_id, ?admission, "Seat reserved");
    Ok(Json(LobbyResponse::new(lobby)))
}

/// POST /api/v1/lobbies/{id}/start (host only).
pub async fn start_lobby(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    let id = parse_lobby_id(&id)?;
    state.orchestrator.require(&id).await?.start(identity.user_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            lobby_id: id,
            start_delay_ms: state.config.lobbies.start_delay_ms,
        }),
    ))
}
