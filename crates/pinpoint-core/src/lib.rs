pub mod catalog;
pub mod error;
pub mod identity;
pub mod lobby;
pub mod net;
pub mod player;
pub mod round;
pub mod scoring;
pub mod time;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use crate::catalog::{Location, LocationCatalog, Region};
    use crate::identity::Identity;
    use crate::lobby::{Lobby, LobbyId, LobbySettings};
    use crate::player::{Participant, UserId};
    use crate::round::Coordinates;

    /// Create `n` participants with sequential ids starting at 1.
    pub fn make_participants(n: usize) -> Vec<Participant> {
        (0..n)
            .map(|i| Participant::new(i as UserId + 1, format!("Player{}", i + 1)))
            .collect()
    }

    /// Identity for user `id`, named `user{id}`.
    pub fn identity(id: UserId) -> Identity {
        Identity {
            session_id: format!("sess-{id}"),
            user_id: id,
            username: format!("user{id}"),
        }
    }

    /// Settings with the given round count and per-round limit.
    pub fn settings(round_count: u8, round_time_limit_ms: u64) -> LobbySettings {
        LobbySettings {
            round_count,
            round_time_limit_ms,
            ..LobbySettings::default()
        }
    }

    /// A waiting lobby hosted by user 1 with `n` participants total.
    pub fn lobby_with(n: usize, settings: LobbySettings) -> Lobby {
        let mut participants = make_participants(n.max(1)).into_iter();
        let mut lobby = Lobby::new(
            LobbyId::generate(),
            participants.next().unwrap_or_else(|| Participant::new(1, "Player1")),
            settings,
            0,
        );
        lobby.participants.extend(participants);
        lobby
    }

    /// Catalog with exactly one location per entry, all at known points.
    pub struct FixedCatalog {
        locations: Vec<Location>,
    }

    impl FixedCatalog {
        pub fn new(points: &[(&str, f64, f64)]) -> Self {
            let locations = points
                .iter()
                .map(|&(id, lat, lng)| Location {
                    id: id.to_string(),
                    name: id.to_string(),
                    region: Region::Europe,
                    coordinates: Coordinates { lat, lng },
                })
                .collect();
            Self { locations }
        }
    }

    impl LocationCatalog for FixedCatalog {
        fn locations(&self) -> &[Location] {
            &self.locations
        }
    }
}
