use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crucible::config::Config;
use crucible::executor::Executor;
use crucible::languages::Registry;
use crucible::limiter::RateLimiter;
use crucible::queue::JobQueue;
use crucible::sandbox::{DockerSandbox, Sandbox};
use crucible::server::{self, AppState};
use crucible::worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("crucible=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env()?);
    info!(
        port = config.port,
        workers = config.worker_count,
        queue_capacity = config.queue_capacity,
        "starting crucible"
    );

    let registry = Arc::new(Registry::with_defaults()?);
    info!(
        languages = registry.list().len(),
        "loaded language registry"
    );

    let sandbox: Arc<dyn Sandbox> =
        Arc::new(DockerSandbox::new().context("failed to connect to the container engine")?);
    ensure_images(&registry, sandbox.as_ref())
        .await
        .context("failed to ensure language images")?;

    let executor = Arc::new(Executor::new(registry, sandbox));

    let (queue, job_rx) = JobQueue::new(config.queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = worker::spawn_pool(config.worker_count, executor, job_rx, shutdown_rx);

    let limiter = Arc::new(RateLimiter::new(
        config.global_rps,
        config.per_client_rps,
        config.per_client_burst,
        config.max_concurrent,
    ));
    let cleanup = limiter
        .clone()
        .spawn_cleanup(Duration::from_secs(config.cleanup_interval_secs));

    let state = AppState {
        config: config.clone(),
        queue,
        limiter,
    };
    let app = server::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server failed")?;

    // The router (and with it the queue sender) is gone; tell the workers
    // and give in-flight jobs a bounded window to finish.
    info!("draining workers");
    let _ = shutdown_tx.send(true);
    cleanup.abort();
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    if tokio::time::timeout(grace, futures_util::future::join_all(workers))
        .await
        .is_err()
    {
        warn!("shutdown grace expired with jobs still in flight");
    }
    info!("shut down");

    Ok(())
}

/// Pull every image the registry references before serving.
async fn ensure_images(registry: &Registry, sandbox: &dyn Sandbox) -> Result<()> {
    let images: HashSet<String> = registry.list().into_iter().map(|l| l.image).collect();
    for image in images {
        sandbox
            .ensure_image(&image)
            .await
            .with_context(|| format!("image {image} unavailable"))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
