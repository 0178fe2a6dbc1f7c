//! Key-value storage abstraction for lobby records.
//!
//! The store owns versioning and hard TTL expiry. Everything that needs
//! atomic read-modify-write goes through [`LobbyStore::compare_and_swap`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use pinpoint_core::error::GameError;
use pinpoint_core::lobby::{Lobby, LobbyId};

/// A stored value plus its write version and expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub expires_at: Instant,
    pub value: T,
}

impl<T> Versioned<T> {
    /// Expired once `now` reaches `expires_at`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the new version.
    Swapped(u64),
    /// Someone else wrote first.
    VersionMismatch,
    /// The key is gone (removed or purged).
    Missing,
}

#[async_trait]
pub trait LobbyStore: Send + Sync {
    /// Fetch a live record. Fails `NotFound` for unknown ids and `Expired`
    /// for records whose TTL has elapsed but which have not been purged yet.
    async fn get(&self, id: &LobbyId) -> Result<Versioned<Lobby>, GameError>;

    /// Insert at version 1 unless the key exists. Returns false on collision.
    async fn insert_if_absent(&self, lobby: Lobby, expires_at: Instant) -> Result<bool, GameError>;

    /// Replace the record if its version still equals `expected`. The stored
    /// expiry never moves backwards.
    async fn compare_and_swap(
        &self,
        id: &LobbyId,
        expected: u64,
        lobby: Lobby,
        expires_at: Instant,
    ) -> Result<CasOutcome, GameError>;

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, id: &LobbyId) -> Result<bool, GameError>;

    /// Delete every record expired at `now`, returning their ids.
    async fn purge_expired(&self, now: Instant) -> Result<Vec<LobbyId>, GameError>;

    /// Number of stored records, expired or not.
    async fn len(&self) -> usize;
}

/// In-process store backed by a locked map.
#[derive(Default)]
pub struct MemoryLobbyStore {
    records: RwLock<HashMap<LobbyId, Versioned<Lobby>>>,
}

impl MemoryLobbyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LobbyStore for MemoryLobbyStore {
    async fn get(&self, id: &LobbyId) -> Result<Versioned<Lobby>, GameError> {
        let records = self.records.read().await;
        let record = records
            .get(id)
            .ok_or_else(|| GameError::not_found(format!("lobby {id}")))?;
        if record.is_expired(Instant::now()) {
            return Err(GameError::Expired);
        }
        Ok(record.clone())
    }

    async fn insert_if_absent(&self, lobby: Lobby, expires_at: Instant) -> Result<bool, GameError> {
        let mut records = self.records.write().await;
        if records.contains_key(&lobby.id) {
            return Ok(false);
        }
        records.insert(
            lobby.id.clone(),
            Versioned {
                version: 1,
                expires_at,
                value: lobby,
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        id: &LobbyId,
        expected: u64,
        lobby: Lobby,
        expires_at: Instant,
    ) -> Result<CasOutcome, GameError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(CasOutcome::Missing);
        };
        if record.version != expected {
            return Ok(CasOutcome::VersionMismatch);
        }
        record.version += 1;
        record.expires_at = record.expires_at.max(expires_at);
        record.value = lobby;
        Ok(CasOutcome::Swapped(record.version))
    }

    async fn remove(&self, id: &LobbyId) -> Result<bool, GameError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn purge_expired(&self, now: Instant) -> Result<Vec<LobbyId>, GameError> {
        let mut records = self.records.write().await;
        let expired: Vec<LobbyId> = records
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            records.remove(id);
        }
        Ok(expired)
    }

    async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}
