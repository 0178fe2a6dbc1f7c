//! Typed identity claims produced by the external credential verifier.

use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::player::UserId;

/// Which kind of credential a claim set belongs to. Only `access` tokens
/// may open a game connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Claim set carried by a bearer credential.
///
/// Field names follow the issuer's contract. Every field is required, so a
/// claim set with a missing or mistyped field fails to deserialize as a
/// whole instead of being half-read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "userID")]
    pub user_id: UserId,
    pub username: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// Expiry (seconds since epoch).
    pub exp: u64,
}

/// A verified participant identity, stable for the life of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub session_id: String,
    pub user_id: UserId,
    pub username: String,
}

impl Claims {
    /// Convert validated claims into an [`Identity`], rejecting anything that
    /// is not an access token.
    pub fn into_identity(self) -> Result<Identity, GameError> {
        if self.token_type != TokenType::Access {
            return Err(GameError::Unauthorized(
                "access token required".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(GameError::Unauthorized("empty username".to_string()));
        }
        Ok(Identity {
            session_id: self.session_id,
            user_id: self.user_id,
            username: self.username,
        })
    }
}
