use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use pinpoint_core::catalog::LocationCatalog;

use crate::auth::{IdentityVerifier, JwtVerifier};
use crate::config::ServerConfig;
use crate::hub::SessionHub;
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::persistence::ResultStore;
use crate::registry::LobbyRegistry;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownCoordinator;
use crate::store::LobbyStore;
use crate::transport::{BroadcastTransport, TransportEvent};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: LobbyRegistry,
    pub transport: Arc<BroadcastTransport>,
    pub orchestrator: Orchestrator,
    pub hub: SessionHub,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub results: Arc<dyn ResultStore>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// Pluggable backends. Everything else is derived from the config.
pub struct Backends {
    pub store: Arc<dyn LobbyStore>,
    pub results: Arc<dyn ResultStore>,
    pub catalog: Arc<dyn LocationCatalog>,
}

impl AppState {
    /// Wire the service graph. The returned receiver carries transport
    /// events and must be handed to [`SessionHub::spawn_dispatcher`].
    pub fn new(config: ServerConfig, backends: Backends) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let retry = RetryPolicy::from(&config.retry);
        let registry = LobbyRegistry::new(backends.store, config.lobbies.ttl(), retry.clone());
        let (transport, events) = BroadcastTransport::new(config.limits.broadcast_write_timeout());
        let transport = Arc::new(transport);
        let orchestrator = Orchestrator::new(OrchestratorDeps {
            registry: registry.clone(),
            transport: Arc::clone(&transport),
            results: Arc::clone(&backends.results),
            catalog: backends.catalog,
            start_delay: config.lobbies.start_delay(),
            retry,
        });
        let hub = SessionHub::new(
            registry.clone(),
            Arc::clone(&transport),
            orchestrator.clone(),
            config.limits.connection_buffer,
        );
        let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(
            config.auth.jwt_secret.as_bytes(),
            config.auth.issuer.clone(),
        ));

        let state = Self {
            config: Arc::new(config),
            registry,
            transport,
            orchestrator,
            hub,
            verifier,
            results: backends.results,
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        };
        (state, events)
    }
}

/// RAII guard over the live WebSocket count.
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    /// Take a slot if fewer than `max` are in use.
    pub fn try_acquire(count: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self {
                count: Arc::clone(count),
            })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}
