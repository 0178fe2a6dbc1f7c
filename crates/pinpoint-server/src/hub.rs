//! Binds live connections to lobbies and routes their traffic.
//!
//! The hub is the seam between sockets and lobby actors: it admits a new
//! connection through the registry, joins it to the lobby's broadcast group,
//! turns inbound frames into [`LobbyEvent`]s, and forwards transport
//! connect/disconnect events to the owning actor.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pinpoint_core::error::GameError;
use pinpoint_core::identity::Identity;
use pinpoint_core::lobby::LobbyId;
use pinpoint_core::net::messages::{ClientMessage, ServerMessage};
use pinpoint_core::net::protocol::decode_client_message;
use pinpoint_core::player::{ConnectionStatus, UserId};
use pinpoint_core::round::Coordinates;

use crate::orchestrator::{LobbyEvent, LobbyHandle, Orchestrator};
use crate::registry::LobbyRegistry;
use crate::transport::{BroadcastTransport, ConnectionId, ConnectionInfo, TransportEvent};

/// A connection that has been admitted and bound to a lobby group.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub lobby: LobbyHandle,
    /// Cancelled when the transport drops the connection.
    pub cancel: CancellationToken,
}

pub struct Attached {
    pub session: Session,
    /// Frames queued for the socket writer.
    pub outbound: mpsc::Receiver<Bytes>,
}

/// What the socket should do after an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Continue,
    Close,
}

#[derive(Clone)]
pub struct SessionHub {
    registry: LobbyRegistry,
    transport: Arc<BroadcastTransport>,
    orchestrator: Orchestrator,
    buffer: usize,
}

impl SessionHub {
    pub fn new(
        registry: LobbyRegistry,
        transport: Arc<BroadcastTransport>,
        orchestrator: Orchestrator,
        buffer: usize,
    ) -> Self {
        Self {
            registry,
            transport,
            orchestrator,
            buffer: buffer.max(1),
        }
    }

    pub fn transport(&self) -> &Arc<BroadcastTransport> {
        &self.transport
    }

    /// Admit `identity` into `lobby_id` and bind a fresh connection to the
    /// lobby's group. Older connections of the same user in that lobby are
    /// superseded once the new one is bound.
    pub async fn attach(&self, lobby_id: &LobbyId, identity: &Identity) -> Result<Attached, GameError> {
        let lobby = self.orchestrator.require(lobby_id).await?;
        let (_, admission) = self
            .registry
            .join_lobby(lobby_id, identity, ConnectionStatus::Connected)
            .await?;

        let previous = self.transport.user_connections(lobby_id, identity.user_id).await;
        let info = ConnectionInfo::new(identity.user_id, identity.username.clone());
        let connection_id = info.connection_id;
        let (tx, outbound) = mpsc::channel(self.buffer);
        let cancel = CancellationToken::new();
        self.transport.register(info, tx, cancel.clone()).await;
        if let Err(e) = self.transport.set_group(connection_id, lobby_id.clone()).await {
            self.transport.unregister(connection_id).await;
            return Err(e);
        }
        for old in previous {
            tracing::info!(lobby = %lobby_id, user_id = identity.user_id, connection = %old, "Superseding older connection");
            self.transport.unregister(old).await;
        }

        tracing::info!(
            lobby = %lobby_id,
            user_id = identity.user_id,
            connection = %connection_id,
            ?admission,
            "Connection attached"
        );
        Ok(Attached {
            session: Session {
                connection_id,
                user_id: identity.user_id,
                lobby,
                cancel,
            },
            outbound,
        })
    }

    pub async fn detach(&self, connection_id: ConnectionId) {
        self.transport.unregister(connection_id).await;
    }

    /// Handle one inbound text frame. Failures are reported to the sending
    /// connection only.
    pub async fn dispatch(&self, conn: &Session, text: &str) -> Inbound {
        let msg = match decode_client_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(connection = %conn.connection_id, error = %e, "Rejected inbound frame");
                self.reply_error(conn.connection_id, &e.into()).await;
                return Inbound::Continue;
            },
        };
        tracing::debug!(connection = %conn.connection_id, kind = msg.type_name(), "Inbound message");

        let user_id = conn.user_id;
        let result = match msg {
            ClientMessage::Guess(g) => {
                conn.lobby
                    .submit_guess(
                        user_id,
                        conn.connection_id,
                        g.round,
                        Coordinates { lat: g.lat, lng: g.lng },
                    )
                    .await
            },
            ClientMessage::Start => conn.lobby.start(user_id).await,
            ClientMessage::Abort => conn.lobby.abort(user_id).await,
            ClientMessage::Heartbeat => conn.lobby.heartbeat(user_id),
            ClientMessage::Leave => {
                if let Err(e) = conn.lobby.leave(user_id).await {
                    tracing::debug!(connection = %conn.connection_id, error = %e, "Leave after lobby closed");
                }
                return Inbound::Close;
            },
        };

        if let Err(e) = result {
            self.reply_error(conn.connection_id, &e).await;
        }
        Inbound::Continue
    }

    async fn reply_error(&self, connection_id: ConnectionId, err: &GameError) {
        if let Err(e) = self
            .transport
            .send_to(connection_id, &ServerMessage::error(err))
            .await
        {
            tracing::error!(connection = %connection_id, error = %e, "Failed to encode error reply");
        }
    }

    /// Forward transport events to the owning lobby actors until the
    /// transport is dropped.
    pub fn spawn_dispatcher(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let (group, lobby_event) = match event {
                    TransportEvent::Bound {
                        connection_id,
                        user_id,
                        group,
                    } => (
                        group,
                        LobbyEvent::ParticipantConnected {
                            user_id,
                            connection_id,
                        },
                    ),
                    TransportEvent::Disconnected {
                        connection_id,
                        user_id,
                        group: Some(group),
                    } => (
                        group,
                        LobbyEvent::ParticipantDisconnected {
                            user_id,
                            connection_id,
                        },
                    ),
                    TransportEvent::Disconnected { group: None, .. } => continue,
                };
                match orchestrator.handle(&group).await {
                    Some(handle) => {
                        if handle.send(lobby_event).is_err() {
                            tracing::debug!(lobby = %group, "Lobby closed before event delivery");
                        }
                    },
                    None => tracing::debug!(lobby = %group, "No running lobby for transport event"),
                }
            }
            tracing::debug!("Transport event stream closed");
        })
    }
}
