//! Hosting Relay Server
//!
//! Accepts large files as independently retriable chunks, verifies the
//! assembled content against the declared digest and hands verified uploads
//! to the intake.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hosting_relay::auth::JwtVerifier;
use hosting_relay::config::Config;
use hosting_relay::handoff::DirectoryIntake;
use hosting_relay::routes;
use hosting_relay::state::AppState;
use hosting_relay::upload::{
    ChunkStore, FinalizeCoordinator, VerificationQueue, WorkerConfig, WorkerPool, INTAKE_DIR,
    UPLOAD_DIR,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "hosting_relay=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!("Starting Hosting Relay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Staging directory: {}", config.staging.dir.display());

    let chunk_store = ChunkStore::open(config.staging.dir.join(UPLOAD_DIR))
        .await
        .context("failed to open chunk store")?;
    let intake = Arc::new(
        DirectoryIntake::new(config.staging.dir.join(INTAKE_DIR))
            .await
            .context("failed to open intake directory")?,
    );

    // Verification workers share one stop signal with the HTTP server
    let cancel = CancellationToken::new();
    let (queue, receiver) = VerificationQueue::bounded(config.verification.queue_depth);
    let pool = WorkerPool::spawn(
        WorkerConfig {
            workers: config.verification.workers,
            shutdown_grace: config.verification.shutdown_grace(),
        },
        receiver,
        chunk_store.clone(),
        intake.clone(),
        cancel.clone(),
    );

    let coordinator = FinalizeCoordinator::new(
        chunk_store.clone(),
        queue,
        config.verification.finalize_timeout(),
    );
    let verifier = Arc::new(JwtVerifier::new(
        config.auth.jwt_secret.as_bytes(),
        config.auth.jwt_issuer.as_deref(),
    ));

    let app_state = AppState::new(config.clone(), chunk_store, coordinator, intake, verifier);
    let app = routes::router(app_state);

    let host: std::net::IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid SERVER_HOST: {}", config.server.host))?;
    let addr = SocketAddr::from((host, config.server.port));
    tracing::info!("Hosting Relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let server_cancel = cancel.clone();
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_cancel.cancelled_owned())
            .await
    };
    tokio::pin!(server);

    let mut pool_task = tokio::spawn(pool.wait());

    tokio::select! {
        result = &mut server => {
            result.context("server error")?;
            cancel.cancel();
            pool_task.await.context("verification pool panicked")??;
        }
        result = &mut pool_task => {
            cancel.cancel();
            match result {
                Ok(Ok(())) => server.await.context("server error")?,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Verification pool failed, terminating");
                    return Err(e.into());
                }
                Err(e) => return Err(anyhow::anyhow!("verification pool panicked: {}", e)),
            }
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
