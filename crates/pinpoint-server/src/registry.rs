//! Lobby lifecycle over a [`LobbyStore`]: creation, membership and the
//! sliding expiry window.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use pinpoint_core::error::GameError;
use pinpoint_core::identity::Identity;
use pinpoint_core::lobby::{Admission, Lobby, LobbyId, LobbySettings};
use pinpoint_core::player::{ConnectionStatus, Participant, UserId, sanitize_display_name};
use pinpoint_core::time::now_ms;

use crate::retry::{RetryPolicy, with_backoff};
use crate::store::{CasOutcome, LobbyStore, Versioned};

/// Compare-and-swap attempts before a write is reported as contended.
const MAX_CAS_ATTEMPTS: usize = 32;

/// Id draws before creation gives up.
const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct LobbyRegistry {
    store: Arc<dyn LobbyStore>,
    ttl: Duration,
    retry: RetryPolicy,
}

impl LobbyRegistry {
    pub fn new(store: Arc<dyn LobbyStore>, ttl: Duration, retry: RetryPolicy) -> Self {
        Self { store, ttl, retry }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a lobby hosted by `host`, retrying on the (astronomically
    /// unlikely) id collision. The host counts as disconnected until a
    /// socket binds.
    pub async fn create_lobby(
        &self,
        host: &Identity,
        settings: LobbySettings,
    ) -> Result<Lobby, GameError> {
        settings.validate()?;
        let participant = participant_for(host, ConnectionStatus::Disconnected)?;
        for _ in 0..MAX_ID_ATTEMPTS {
            let lobby = Lobby::new(LobbyId::generate(), participant.clone(), settings.clone(), now_ms());
            let expires_at = Instant::now() + self.ttl;
            let inserted = with_backoff(&self.retry, "insert lobby", || {
                self.store.insert_if_absent(lobby.clone(), expires_at)
            })
            .await?;
            if inserted {
                tracing::info!(lobby = %lobby.id, host = host.user_id, "Lobby created");
                return Ok(lobby);
            }
            tracing::warn!(lobby = %lobby.id, "Lobby id collision, drawing again");
        }
        Err(GameError::StorageUnavailable(
            "could not allocate a unique lobby id".to_string(),
        ))
    }

    /// Admit `user` into the lobby, or rejoin them if they are already a
    /// participant. `status` is `Connected` when a live socket is attaching
    /// and `Disconnected` for a seat reserved over REST. Refreshes the expiry.
    pub async fn join_lobby(
        &self,
        id: &LobbyId,
        user: &Identity,
        status: ConnectionStatus,
    ) -> Result<(Lobby, Admission), GameError> {
        let participant = participant_for(user, status)?;
        self.mutate(id, true, |lobby| lobby.admit(participant.clone()))
            .await
    }

    /// Remove a participant. Unknown lobbies and absent users are a no-op.
    /// Returns the lobby as it stands afterwards, or None if it no longer
    /// exists; the last participant leaving deletes the lobby.
    pub async fn leave_lobby(&self, id: &LobbyId, user_id: UserId) -> Result<Option<Lobby>, GameError> {
        let (lobby, removed) = match self.mutate(id, false, |lobby| Ok(lobby.remove(user_id))).await {
            Ok(v) => v,
            Err(GameError::NotFound(_) | GameError::Expired) => return Ok(None),
            Err(e) => return Err(e),
        };
        if removed {
            tracing::info!(lobby = %id, user_id, host = lobby.host_user_id, "Participant left lobby");
        }
        if lobby.participants.is_empty() {
            self.remove(id).await?;
            return Ok(None);
        }
        Ok(Some(lobby))
    }

    /// Push the sliding expiry forward from now.
    pub async fn refresh_expiry(&self, id: &LobbyId) -> Result<(), GameError> {
        self.mutate(id, true, |_| Ok(())).await.map(|_| ())
    }

    /// Read-only snapshot.
    pub async fn get_lobby(&self, id: &LobbyId) -> Result<Lobby, GameError> {
        self.read(id).await.map(|r| r.value)
    }

    /// Apply an orchestrator-owned change (state, connection status,
    /// scores) atomically. Does not touch the expiry.
    pub async fn update<F>(&self, id: &LobbyId, mut f: F) -> Result<Lobby, GameError>
    where
        F: FnMut(&mut Lobby) -> Result<(), GameError>,
    {
        self.mutate(id, false, |lobby| f(lobby)).await.map(|(lobby, ())| lobby)
    }

    pub async fn remove(&self, id: &LobbyId) -> Result<bool, GameError> {
        with_backoff(&self.retry, "remove lobby", || self.store.remove(id)).await
    }

    /// Drop every expired lobby. Returns the ids removed.
    pub async fn purge_expired(&self) -> Result<Vec<LobbyId>, GameError> {
        self.store.purge_expired(Instant::now()).await
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    async fn read(&self, id: &LobbyId) -> Result<Versioned<Lobby>, GameError> {
        with_backoff(&self.retry, "get lobby", || self.store.get(id)).await
    }

    /// Read-modify-write loop. `f` runs against a fresh copy on every
    /// attempt, and its error aborts the loop without writing.
    async fn mutate<T, F>(&self, id: &LobbyId, refresh: bool, mut f: F) -> Result<(Lobby, T), GameError>
    where
        F: FnMut(&mut Lobby) -> Result<T, GameError>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.read(id).await?;
            let mut next = current.value.clone();
            let out = f(&mut next)?;
            let expires_at = if refresh {
                Instant::now() + self.ttl
            } else {
                current.expires_at
            };
            let outcome = with_backoff(&self.retry, "swap lobby", || {
                self.store
                    .compare_and_swap(id, current.version, next.clone(), expires_at)
            })
            .await?;
            match outcome {
                CasOutcome::Swapped(_) => return Ok((next, out)),
                CasOutcome::VersionMismatch => {
                    tracing::debug!(lobby = %id, "Concurrent lobby write, retrying");
                },
                CasOutcome::Missing => return Err(GameError::not_found(format!("lobby {id}"))),
            }
        }
        Err(GameError::Transient(format!("lobby {id} write contention")))
    }
}

fn participant_for(identity: &Identity, status: ConnectionStatus) -> Result<Participant, GameError> {
    let name = sanitize_display_name(&identity.username);
    if name.is_empty() {
        return Err(GameError::MalformedInput("display name is empty".to_string()));
    }
    let mut participant = Participant::new(identity.user_id, name);
    participant.connection = status;
    Ok(participant)
}
