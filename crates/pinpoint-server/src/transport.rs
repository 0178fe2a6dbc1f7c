//! Live connection bookkeeping and group fan-out.
//!
//! Each connection owns a bounded outbound queue drained by its socket
//! writer. Broadcasts push into those queues concurrently, and a member
//! whose queue stays full past the write budget is dropped instead of
//! holding up the rest of the group.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pinpoint_core::error::GameError;
use pinpoint_core::lobby::LobbyId;
use pinpoint_core::net::messages::ServerMessage;
use pinpoint_core::net::protocol::{ProtocolError, encode_server_message};
use pinpoint_core::player::UserId;

pub type ConnectionId = Uuid;

/// Outbound queue feeding one socket writer.
pub type ConnectionSender = mpsc::Sender<Bytes>;

/// Fixed per-connection metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    /// Broadcast group (= lobby id) once bound.
    pub group: Option<LobbyId>,
}

impl ConnectionInfo {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            username: username.into(),
            group: None,
        }
    }
}

/// Membership changes, delivered to the single session dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Bound {
        connection_id: ConnectionId,
        user_id: UserId,
        group: LobbyId,
    },
    Disconnected {
        connection_id: ConnectionId,
        user_id: UserId,
        group: Option<LobbyId>,
    },
}

struct ConnectionEntry {
    info: ConnectionInfo,
    sender: ConnectionSender,
    cancel: CancellationToken,
}

pub struct BroadcastTransport {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    write_timeout: Duration,
}

impl BroadcastTransport {
    pub fn new(write_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            connections: RwLock::new(HashMap::new()),
            events,
            write_timeout,
        };
        (transport, rx)
    }

    /// Track a new connection. Registering an id twice is a no-op and
    /// returns false.
    pub async fn register(
        &self,
        info: ConnectionInfo,
        sender: ConnectionSender,
        cancel: CancellationToken,
    ) -> bool {
        let mut conns = self.connections.write().await;
        if conns.contains_key(&info.connection_id) {
            return false;
        }
        tracing::debug!(connection = %info.connection_id, user_id = info.user_id, "Connection registered");
        conns.insert(
            info.connection_id,
            ConnectionEntry {
                info,
                sender,
                cancel,
            },
        );
        true
    }

    /// Drop a connection and cancel its socket tasks. Unknown ids are a
    /// no-op. The map removal here is the only place `Disconnected` is
    /// emitted, so it fires once per connection however many callers race.
    pub async fn unregister(&self, connection_id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&connection_id);
        let Some(entry) = removed else {
            return false;
        };
        entry.cancel.cancel();
        tracing::debug!(
            connection = %connection_id,
            user_id = entry.info.user_id,
            group = ?entry.info.group,
            "Connection unregistered"
        );
        let _ = self.events.send(TransportEvent::Disconnected {
            connection_id,
            user_id: entry.info.user_id,
            group: entry.info.group,
        });
        true
    }

    /// Move a connection into `group`, replacing any previous group.
    pub async fn set_group(&self, connection_id: ConnectionId, group: LobbyId) -> Result<(), GameError> {
        let mut conns = self.connections.write().await;
        let entry = conns
            .get_mut(&connection_id)
            .ok_or_else(|| GameError::not_found(format!("connection {connection_id}")))?;
        entry.info.group = Some(group.clone());
        let user_id = entry.info.user_id;
        drop(conns);
        let _ = self.events.send(TransportEvent::Bound {
            connection_id,
            user_id,
            group,
        });
        Ok(())
    }

    pub async fn info(&self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|e| e.info.clone())
    }

    /// Deliver to every member of `group`.
    pub async fn broadcast(&self, group: &LobbyId, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        self.fan_out(group, None, msg).await
    }

    /// Deliver to every member of `group` except `exclude`.
    pub async fn broadcast_except(
        &self,
        group: &LobbyId,
        exclude: ConnectionId,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        self.fan_out(group, Some(exclude), msg).await
    }

    /// Deliver to one connection. Returns false if it is gone or was dropped
    /// for failing the write.
    pub async fn send_to(&self, connection_id: ConnectionId, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let frame = Bytes::from(encode_server_message(msg)?);
        let sender = {
            let conns = self.connections.read().await;
            match conns.get(&connection_id) {
                Some(e) => e.sender.clone(),
                None => return Ok(false),
            }
        };
        if sender.send_timeout(frame, self.write_timeout).await.is_err() {
            tracing::warn!(connection = %connection_id, "Dropping connection after failed write");
            self.unregister(connection_id).await;
            return Ok(false);
        }
        Ok(true)
    }

    async fn fan_out(
        &self,
        group: &LobbyId,
        exclude: Option<ConnectionId>,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = Bytes::from(encode_server_message(msg)?);
        let targets: Vec<(ConnectionId, ConnectionSender)> = {
            let conns = self.connections.read().await;
            conns
                .values()
                .filter(|e| e.info.group.as_ref() == Some(group))
                .filter(|e| Some(e.info.connection_id) != exclude)
                .map(|e| (e.info.connection_id, e.sender.clone()))
                .collect()
        };

        let timeout = self.write_timeout;
        let results = join_all(targets.into_iter().map(|(id, sender)| {
            let frame = frame.clone();
            async move { (id, sender.send_timeout(frame, timeout).await) }
        }))
        .await;

        let mut delivered = 0;
        for (id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        connection = %id,
                        lobby = %group,
                        kind = msg.type_name(),
                        error = %e,
                        "Dropping slow or closed connection"
                    );
                    self.unregister(id).await;
                },
            }
        }
        Ok(delivered)
    }

    pub async fn group_size(&self, group: &LobbyId) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|e| e.info.group.as_ref() == Some(group))
            .count()
    }

    /// Connections `user_id` has bound to `group`.
    pub async fn user_connections(&self, group: &LobbyId, user_id: UserId) -> Vec<ConnectionId> {
        self.connections
            .read()
            .await
            .values()
            .filter(|e| e.info.user_id == user_id && e.info.group.as_ref() == Some(group))
            .map(|e| e.info.connection_id)
            .collect()
    }

    pub async fn is_user_bound(&self, group: &LobbyId, user_id: UserId) -> bool {
        !self.user_connections(group, user_id).await.is_empty()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Unregister every connection in `group`.
    pub async fn close_group(&self, group: &LobbyId) -> usize {
        let ids: Vec<ConnectionId> = {
            let conns = self.connections.read().await;
            conns
                .values()
                .filter(|e| e.info.group.as_ref() == Some(group))
                .map(|e| e.info.connection_id)
                .collect()
        };
        for id in &ids {
            self.unregister(*id).await;
        }
        ids.len()
    }

    /// Unregister everything. Used at shutdown.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        for id in &ids {
            self.unregister(*id).await;
        }
        ids.len()
    }
}
