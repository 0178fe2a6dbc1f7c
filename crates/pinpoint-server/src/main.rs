use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pinpoint_core::catalog::BuiltinCatalog;
use pinpoint_server::config::ServerConfig;
use pinpoint_server::persistence::{JsonlResultStore, MemoryResultStore, ResultStore};
use pinpoint_server::shutdown::closer;
use pinpoint_server::state::Backends;
use pinpoint_server::store::MemoryLobbyStore;
use pinpoint_server::{build_app, spawn_reaper};

#[tokio::main]
async fn main() {
    init_tracing();

    let config = ServerConfig::load();
    if let Err(errors) = config.validate() {
        for e in &errors {
            tracing::error!(error = %e, "Invalid configuration");
        }
        std::process::exit(2);
    }

    let results: Arc<dyn ResultStore> = match config.persistence.results_path.as_deref() {
        Some(path) => match JsonlResultStore::open(path).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(error = %e, "Cannot open results file");
                std::process::exit(1);
            },
        },
        None => Arc::new(MemoryResultStore::new()),
    };

    let listen_addr = config.listen_addr.clone();
    let grace = Duration::from_millis(config.shutdown.grace_ms);
    let deadline = Duration::from_millis(config.shutdown.deadline_ms);

    let (app, state) = build_app(
        config,
        Backends {
            store: Arc::new(MemoryLobbyStore::new()),
            results: Arc::clone(&results),
            catalog: Arc::new(BuiltinCatalog::new()),
        },
    );
    let reaper = spawn_reaper(state.clone());

    let results_closer = Arc::clone(&results);
    state
        .shutdown
        .register("results", closer(move || async move { results_closer.close().await }))
        .await;
    let transport = Arc::clone(&state.transport);
    state
        .shutdown
        .register(
            "transport",
            closer(move || async move {
                let closed = transport.close_all().await;
                tracing::info!(closed, "Closed remaining connections");
                Ok(())
            }),
        )
        .await;

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %listen_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        },
    };
    tracing::info!(addr = %listen_addr, "Pinpoint server listening");

    let token = state.shutdown.token();
    tokio::spawn(watch_signals(token.clone()));

    // Games are drained before axum waits on open connections, so every
    // lobby gets its final broadcast and then closes its sockets.
    let orchestrator = state.orchestrator.clone();
    let drained = async move {
        token.cancelled().await;
        tracing::info!("Shutting down");
        let remaining = orchestrator.drain(grace).await;
        if remaining > 0 {
            tracing::warn!(remaining, "Some lobbies did not finish in time");
        }
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(drained).await {
        tracing::error!(error = %e, "Server error");
    }
    if let Err(e) = reaper.await {
        tracing::debug!(error = %e, "Reaper ended abnormally");
    }
    if let Err(e) = state.shutdown.shutdown(deadline).await {
        tracing::error!(error = %e, "Unclean shutdown");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PINPOINT_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Cancel `token` on ctrl-c or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received ctrl-c"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
    token.cancel();
}
