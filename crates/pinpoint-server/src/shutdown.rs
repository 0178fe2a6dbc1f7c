//! Ordered teardown of long-lived resources.
//!
//! Resources register a closer as they come up. [`ShutdownCoordinator::shutdown`]
//! runs the closers in reverse registration order, so anything started
//! later (and possibly depending on earlier resources) is closed first.

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use pinpoint_core::error::GameError;

pub type Closer = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), GameError>> + Send>;

/// Box an async closure as a [`Closer`].
pub fn closer<F, Fut>(f: F) -> Closer
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), GameError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    #[error("shutdown deadline passed with steps pending: {}", pending.join(", "))]
    Incomplete { pending: Vec<String> },
    #[error("shutdown steps failed: {}", failed.join(", "))]
    Failed { failed: Vec<String> },
}

#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    closers: Mutex<Vec<(String, Closer)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins. Hand it to the HTTP server and
    /// background loops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown without closing anything yet.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub async fn register(&self, name: impl Into<String>, closer: Closer) {
        let name = name.into();
        tracing::debug!(step = %name, "Registered shutdown step");
        self.closers.lock().await.push((name, closer));
    }

    /// Run every registered closer, newest first, within `deadline`. A closer
    /// that fails is logged and does not stop the ones after it.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.trigger();
        let mut steps = std::mem::take(&mut *self.closers.lock().await);
        steps.reverse();

        let mut pending: Vec<String> = steps.iter().map(|(name, _)| name.clone()).collect();
        let mut failed = Vec::new();
        let run = async {
            for (name, close) in steps {
                tracing::info!(step = %name, "Closing");
                if let Err(e) = close().await {
                    tracing::error!(step = %name, error = %e, "Shutdown step failed");
                    failed.push(name);
                }
                pending.remove(0);
            }
        };

        if tokio::time::timeout(deadline, run).await.is_err() {
            tracing::warn!(?pending, "Shutdown deadline passed");
            return Err(ShutdownError::Incomplete { pending });
        }
        if !failed.is_empty() {
            return Err(ShutdownError::Failed { failed });
        }
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
