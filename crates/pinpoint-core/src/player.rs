use serde::{Deserialize, Serialize};

/// Stable user identifier issued by the identity provider.
pub type UserId = i64;

/// Whether a participant currently has a live connection bound to the lobby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connected,
    Disconnected,
}

/// One authenticated player inside a lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub connection: ConnectionStatus,
    pub cumulative_score: u32,
}

impl Participant {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            connection: ConnectionStatus::Connected,
            cumulative_score: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionStatus::Connected
    }
}

/// Maximum display name length accepted from the identity provider.
pub const MAX_DISPLAY_NAME_LEN: usize = 32;

/// Trim and bound a display name, dropping control characters.
pub fn sanitize_display_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_DISPLAY_NAME_LEN)
        .collect()
}
