use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::TargetSelection;
use crate::error::GameError;
use crate::player::{ConnectionStatus, Participant, UserId};

/// Characters used for lobby ids: uppercase letters and digits without the
/// easily confused `I`, `O`, `0` and `1`. 32 symbols, 5 bits each.
const LOBBY_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Opaque, fixed-length, unguessable lobby identifier (80 bits of entropy).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LobbyId(String);

impl LobbyId {
    pub const LEN: usize = 16;

    /// Draw a fresh id from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..Self::LEN)
            .map(|_| LOBBY_ID_ALPHABET[rng.random_range(0..LOBBY_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Parse a client-supplied id. Lowercase input is accepted and
    /// normalized; anything else outside the alphabet is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        if upper.len() != Self::LEN {
            return None;
        }
        if !upper.bytes().all(|b| LOBBY_ID_ALPHABET.contains(&b)) {
            return None;
        }
        Some(Self(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LobbyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Round state machine. `LobbyWaiting` is entered on creation and
/// `GameFinished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LobbyState {
    LobbyWaiting,
    RoundPending,
    RoundActive,
    RoundScoring,
    GameFinished,
}

impl LobbyState {
    pub fn is_terminal(self) -> bool {
        self == Self::GameFinished
    }

    pub fn is_started(self) -> bool {
        self != Self::LobbyWaiting
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: LobbyState) -> bool {
        use LobbyState::*;
        match (self, next) {
            (GameFinished, _) => false,
            (_, GameFinished) => true,
            (LobbyWaiting, RoundPending)
            | (RoundPending, RoundActive)
            | (RoundActive, RoundScoring)
            | (RoundScoring, RoundPending) => true,
            _ => false,
        }
    }
}

/// Host-chosen match settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbySettings {
    pub round_count: u8,
    pub round_time_limit_ms: u64,
    pub max_players: u8,
    pub target: TargetSelection,
}

impl Default for LobbySettings {
    fn default() -> Self {
        Self {
            round_count: 5,
            round_time_limit_ms: 30_000,
            max_players: 8,
            target: TargetSelection::default(),
        }
    }
}

/// Upper bounds for host-supplied settings.
pub const MAX_ROUND_COUNT: u8 = 20;
pub const MAX_ROUND_TIME_LIMIT_MS: u64 = 10 * 60 * 1000;
pub const MAX_PLAYERS_LIMIT: u8 = 64;

impl LobbySettings {
    pub fn round_time_limit(&self) -> Duration {
        Duration::from_millis(self.round_time_limit_ms)
    }

    pub fn validate(&self) -> Result<(), GameError> {
        if self.round_count == 0 || self.round_count > MAX_ROUND_COUNT {
            return Err(GameError::MalformedInput(format!(
                "round_count must be 1..={MAX_ROUND_COUNT}"
            )));
        }
        if self.round_time_limit_ms == 0 || self.round_time_limit_ms > MAX_ROUND_TIME_LIMIT_MS {
            return Err(GameError::MalformedInput(format!(
                "round_time_limit_ms must be 1..={MAX_ROUND_TIME_LIMIT_MS}"
            )));
        }
        if self.max_players == 0 || self.max_players > MAX_PLAYERS_LIMIT {
            return Err(GameError::MalformedInput(format!(
                "max_players must be 1..={MAX_PLAYERS_LIMIT}"
            )));
        }
        Ok(())
    }
}

/// Outcome of admitting a user into a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new participant was appended.
    Joined,
    /// An existing participant was marked connected again.
    Rejoined,
}

/// Lobby metadata and membership. Participants keep insertion order.
///
/// The sliding expiry is tracked by the store holding the lobby, not by the
/// lobby value itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lobby {
    pub id: LobbyId,
    pub host_user_id: UserId,
    pub settings: LobbySettings,
    pub state: LobbyState,
    pub created_at_ms: u64,
    pub participants: Vec<Participant>,
}

impl Lobby {
    pub fn new(id: LobbyId, host: Participant, settings: LobbySettings, created_at_ms: u64) -> Self {
        Self {
            id,
            host_user_id: host.user_id,
            settings,
            state: LobbyState::LobbyWaiting,
            created_at_ms,
            participants: vec![host],
        }
    }

    pub fn participant(&self, user_id: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn connected_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_connected()).count()
    }

    pub fn connected_user_ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.participants
            .iter()
            .filter(|p| p.is_connected())
            .map(|p| p.user_id)
    }

    /// Admit a user. Existing participants may always come back while the
    /// game is not finished; new ones only while waiting and below capacity.
    /// A disconnected re-admission never downgrades a connected participant.
    pub fn admit(&mut self, participant: Participant) -> Result<Admission, GameError> {
        if self.state.is_terminal() {
            return Err(GameError::invalid_state("game already finished"));
        }
        if let Some(existing) = self.participant_mut(participant.user_id) {
            if participant.is_connected() {
                existing.connection = ConnectionStatus::Connected;
            }
            return Ok(Admission::Rejoined);
        }
        if self.state.is_started() {
            return Err(GameError::AlreadyStarted);
        }
        if self.participants.len() >= self.settings.max_players as usize {
            return Err(GameError::Full);
        }
        self.participants.push(participant);
        Ok(Admission::Joined)
    }

    /// Remove a participant. Returns false if they were not present. If the
    /// host leaves, the earliest-joined remaining participant takes over.
    pub fn remove(&mut self, user_id: UserId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.user_id != user_id);
        let removed = self.participants.len() != before;
        if removed
            && self.host_user_id == user_id
            && let Some(next) = self.participants.first()
        {
            self.host_user_id = next.user_id;
        }
        removed
    }

    /// Update a participant's connection status. Returns false if absent.
    pub fn set_connection(&mut self, user_id: UserId, status: ConnectionStatus) -> bool {
        match self.participant_mut(user_id) {
            Some(p) => {
                p.connection = status;
                true
            },
            None => false,
        }
    }
}
