use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::Region;
use crate::error::GameError;
use crate::lobby::{LobbyId, LobbySettings};
use crate::player::{Participant, UserId};
use crate::scoring;

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn validate(&self) -> Result<(), GameError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(GameError::MalformedInput("lat must be within -90..=90".into()));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(GameError::MalformedInput("lng must be within -180..=180".into()));
        }
        Ok(())
    }
}

/// The location a round asks players to find.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub location_id: String,
    pub coordinates: Coordinates,
    pub region: Region,
}

/// A participant's answer for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guess {
    pub coordinates: Coordinates,
    pub submitted_at_ms: u64,
    /// Arrival order within the round, used to break score ties.
    pub order: u32,
}

/// Per-player outcome of a closed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundScore {
    pub user_id: UserId,
    pub display_name: String,
    pub points: u32,
    /// `None` when the participant did not guess.
    pub distance_km: Option<f64>,
    pub rank: u32,
}

/// One timed guess-and-score cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub index: u32,
    pub target: Target,
    pub started_at_ms: u64,
    pub deadline_ms: u64,
    pub guesses: BTreeMap<UserId, Guess>,
    pub scores: Option<Vec<RoundScore>>,
}

impl Round {
    pub fn new(index: u32, target: Target, started_at_ms: u64, time_limit_ms: u64) -> Self {
        Self {
            index,
            target,
            started_at_ms,
            deadline_ms: started_at_ms + time_limit_ms,
            guesses: BTreeMap::new(),
            scores: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.scores.is_some()
    }

    pub fn has_guessed(&self, user_id: UserId) -> bool {
        self.guesses.contains_key(&user_id)
    }

    /// Record a participant's first guess. Later submissions are rejected
    /// and leave the original untouched.
    pub fn record_guess(
        &mut self,
        user_id: UserId,
        coordinates: Coordinates,
        now_ms: u64,
    ) -> Result<&Guess, GameError> {
        if self.is_closed() {
            return Err(GameError::invalid_state("round already closed"));
        }
        coordinates.validate()?;
        if self.guesses.contains_key(&user_id) {
            return Err(GameError::conflict("already guessed this round"));
        }
        let order = self.guesses.len() as u32;
        let guess = self.guesses.entry(user_id).or_insert(Guess {
            coordinates,
            submitted_at_ms: now_ms,
            order,
        });
        Ok(&*guess)
    }

    /// Whether every listed user has a guess recorded.
    pub fn all_guessed<I: IntoIterator<Item = UserId>>(&self, users: I) -> bool {
        let mut any = false;
        for uid in users {
            any = true;
            if !self.guesses.contains_key(&uid) {
                return false;
            }
        }
        any
    }

    /// Score the round exactly once.
    pub fn close(&mut self, participants: &[Participant]) -> Result<&[RoundScore], GameError> {
        if self.is_closed() {
            return Err(GameError::Fatal(format!("round {} scored twice", self.index)));
        }
        let scores = scoring::score_round(&self.target, &self.guesses, participants);
        Ok(self.scores.insert(scores).as_slice())
    }

    pub fn summary(&self) -> RoundSummary {
        RoundSummary {
            index: self.index,
            target: self.target.clone(),
            scores: self.scores.clone().unwrap_or_default(),
        }
    }
}

/// Closed-round record kept for the game summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub index: u32,
    pub target: Target,
    pub scores: Vec<RoundScore>,
}

/// Row of the running leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub score: u32,
    pub rank: u32,
}

/// How a game session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameOutcome {
    Completed,
    Aborted,
    Failed,
}

/// Durable record of a finished game, written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSummary {
    pub lobby_id: LobbyId,
    pub host_user_id: UserId,
    pub settings: LobbySettings,
    pub outcome: GameOutcome,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub rounds: Vec<RoundSummary>,
    pub leaderboard: Vec<LeaderboardEntry>,
}
