use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vmctl_controller::config::{Args, LogFormat, Settings, StoreSettings};
use vmctl_controller::leader;
use vmctl_controller::provider_manager::ProviderManager;
use vmctl_controller::queue::WorkQueue;
use vmctl_controller::routes::{self, AppState};
use vmctl_controller::{
    commands, Controller, ControllerHealth, ControllerSettings, MemoryStore, PgStore, Reconciler,
    ReconcilerConfig, ResourceStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let settings = Settings::from_args(args)?;
    init_tracing(&settings.log_level, settings.log_format);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let (store, pool) = match &settings.store {
        StoreSettings::Memory => {
            warn!("using in-memory store; records are lost on restart");
            let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
            (store, None)
        }
        StoreSettings::Postgres { database_url } => {
            let pg = PgStore::connect(database_url)
                .await
                .context("failed to connect to Postgres")?;
            pg.run_migrations()
                .await
                .context("failed to run migrations")?;
            let pool = pg.pool().clone();
            let store: Arc<dyn ResourceStore> = Arc::new(pg);
            (store, Some(pool))
        }
    };

    let provider = ProviderManager::get_provider(&settings.provider)?;
    provider
        .verify_credentials()
        .await
        .context("provider rejected the configured credentials")?;

    let queue = Arc::new(WorkQueue::new());
    let health = Arc::new(ControllerHealth::new());
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        provider,
        ReconcilerConfig {
            wait_timeout: settings.wait_timeout,
            ..ReconcilerConfig::default()
        },
    ));

    let app = routes::create_router(Arc::new(AppState {
        store: store.clone(),
        queue: queue.clone(),
        health: health.clone(),
    }));
    let listener = tokio::net::TcpListener::bind(settings.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.http_addr))?;
    info!(addr = %settings.http_addr, "controller listening");
    let http = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        })
    };

    if let Some(redis_url) = &settings.redis_url {
        let client = redis::Client::open(redis_url.as_str()).context("invalid REDIS_URL")?;
        let (queue, store, shutdown) = (queue.clone(), store.clone(), shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = commands::run(client, queue, store, shutdown).await {
                error!(error = %e, "command listener stopped");
            }
        });
    }

    let lock = match (&settings.leader_election_id, &pool) {
        (Some(election_id), Some(pool)) => {
            match leader::acquire(pool, election_id, Duration::from_secs(5), &shutdown)
                .await
                .context("leader election failed")?
            {
                Some(lock) => Some(lock),
                None => {
                    info!("shutdown before acquiring leadership");
                    http.await??;
                    return Ok(());
                }
            }
        }
        (Some(_), None) => {
            warn!("leader election needs the postgres store; running without it");
            None
        }
        (None, _) => None,
    };
    health.set_leader(true);

    let controller = Controller::new(
        reconciler,
        store,
        queue,
        health.clone(),
        ControllerSettings {
            workers: settings.workers,
            resync_interval: settings.resync_interval,
        },
    );
    let result = controller.run(shutdown.clone()).await;
    // Stop the HTTP server even when the controller failed on startup.
    shutdown.cancel();
    health.set_leader(false);

    if let Some(lock) = lock {
        if let Err(e) = lock.release().await {
            warn!(error = %e, "failed to release leadership");
        }
    }
    http.await??;
    result.context("controller failed")?;
    info!("controller stopped");
    Ok(())
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
