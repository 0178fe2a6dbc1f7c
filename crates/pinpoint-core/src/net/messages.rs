use serde::{Deserialize, Serialize};

use crate::lobby::{Lobby, LobbyState};
use crate::player::{Participant, UserId};
use crate::round::{GameOutcome, LeaderboardEntry, RoundScore, Target};

/// Inbound `type` discriminators. The set is closed: anything else is
/// rejected by the decoder.
pub mod client_types {
    pub const GUESS: &str = "guess";
    pub const START: &str = "start";
    pub const ABORT: &str = "abort";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const LEAVE: &str = "leave";

    pub const ALL: &[&str] = &[GUESS, START, ABORT, HEARTBEAT, LEAVE];
}

/// Client -> server messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Guess(GuessMsg),
    Start,
    Abort,
    Heartbeat,
    Leave,
}

impl ClientMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Guess(_) => client_types::GUESS,
            Self::Start => client_types::START,
            Self::Abort => client_types::ABORT,
            Self::Heartbeat => client_types::HEARTBEAT,
            Self::Leave => client_types::LEAVE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuessMsg {
    /// Zero-based index of the round the guess is meant for.
    pub round: u32,
    pub lat: f64,
    pub lng: f64,
}

/// Server -> client messages, encoded as `{"type": .., "payload": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    LobbySnapshot(LobbySnapshotMsg),
    Presence(PresenceMsg),
    GameStarting(GameStartingMsg),
    RoundStarted(RoundStartedMsg),
    GuessAccepted(GuessAcceptedMsg),
    PlayerGuessed(PlayerGuessedMsg),
    RoundResult(RoundResultMsg),
    GameFinished(GameFinishedMsg),
    Error(ErrorMsg),
}

/// Full lobby view sent to a connection right after it is bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbySnapshotMsg {
    pub lobby: Lobby,
    /// Present when a round is currently accepting guesses.
    pub active_round: Option<RoundStartedMsg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceChange {
    Joined,
    Rejoined,
    Disconnected,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMsg {
    pub user_id: UserId,
    pub change: PresenceChange,
    pub host_user_id: UserId,
    pub state: LobbyState,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStartingMsg {
    pub round_count: u8,
    pub start_delay_ms: u64,
}

/// Round-start broadcast. Carries only the target id: coordinates are
/// revealed in the round result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStartedMsg {
    pub round: u32,
    pub round_count: u8,
    pub location_id: String,
    pub started_at_ms: u64,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuessAcceptedMsg {
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerGuessedMsg {
    pub round: u32,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResultMsg {
    pub round: u32,
    pub target: Target,
    pub scores: Vec<RoundScore>,
    pub leaderboard: Vec<LeaderboardEntry>,
    /// True when the round closed because everyone guessed.
    pub early: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameFinishedMsg {
    pub outcome: GameOutcome,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub rounds_played: u32,
    /// Set when the lobby was force-terminated by an internal failure.
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub message: String,
    pub code: String,
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::LobbySnapshot(_) => "lobby_snapshot",
            Self::Presence(_) => "presence",
            Self::GameStarting(_) => "game_starting",
            Self::RoundStarted(_) => "round_started",
            Self::GuessAccepted(_) => "guess_accepted",
            Self::PlayerGuessed(_) => "player_guessed",
            Self::RoundResult(_) => "round_result",
            Self::GameFinished(_) => "game_finished",
            Self::Error(_) => "error",
        }
    }

    pub fn error(err: &crate::error::GameError) -> Self {
        Self::Error(ErrorMsg {
            message: err.to_string(),
            code: err.code().to_string(),
        })
    }
}
