//! Application state management

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::handoff::IntakeHandoff;
use crate::upload::{ChunkStore, FinalizeCoordinator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    chunk_store: ChunkStore,
    coordinator: FinalizeCoordinator,
    intake: Arc<dyn IntakeHandoff>,
    token_verifier: Arc<dyn TokenVerifier>,
    request_limiter: Arc<Semaphore>,
}

impl AppState {
    /// Create a new application state
    ///
    /// The intake and token verifier are injected so tests and alternative
    /// deployments can swap them.
    pub fn new(
        config: Config,
        chunk_store: ChunkStore,
        coordinator: FinalizeCoordinator,
        intake: Arc<dyn IntakeHandoff>,
        token_verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let permits = config.server.max_concurrent_requests.max(1);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                chunk_store,
                coordinator,
                intake,
                token_verifier,
                request_limiter: Arc::new(Semaphore::new(permits)),
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the chunk store
    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    /// Get the finalize coordinator
    pub fn coordinator(&self) -> &FinalizeCoordinator {
        &self.inner.coordinator
    }

    /// Get the intake hand-off
    pub fn intake(&self) -> &dyn IntakeHandoff {
        self.inner.intake.as_ref()
    }

    pub fn token_verifier(&self) -> &dyn TokenVerifier {
        self.inner.token_verifier.as_ref()
    }

    /// Semaphore bounding concurrently served requests
    pub fn request_limiter(&self) -> &Arc<Semaphore> {
        &self.inner.request_limiter
    }
}
