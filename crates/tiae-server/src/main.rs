//! TIAE server entry point.

use std::process::ExitCode;
use std::sync::Arc;

use thiserror::Error;
use tiae_core::effects::PostCommit;
use tiae_db::{ConnectionRegistry, DbError};
use tiae_server::{AppConfig, ConfigError, ControlPlane};
use tiae_sync::adapters::{
    AdminClientProvider, HttpAdminProvider, InMemoryObjectStore, InMemoryOrchestrator,
    KubeRestOrchestrator, Orchestrator, TracingEmailSender,
};
use tiae_sync::{
    AdapterError, AuthorizationSynchronizer, Dispatcher, EventBus, ObjectStoreConfig, ProxySync,
    RegistryDirectory, watch_incidents,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Control(#[from] tiae_core::TiaeError),

    #[error("signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tiae=info"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();

    info!("Starting TIAE server...");
    match run().await {
        Ok(()) => {
            info!("TIAE server stopped.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "TIAE server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = AppConfig::from_env()?;
    if let Some(idp) = &config.identity_provider {
        info!(url = %idp.url, "Identity provider configured");
    }

    let registry = Arc::new(ConnectionRegistry::connect(config.db.clone()).await?);
    let shutdown = CancellationToken::new();

    let orchestrator: Arc<dyn Orchestrator> = if config.in_cluster {
        Arc::new(KubeRestOrchestrator::in_cluster(
            &config.sync.namespace,
            config.sync.call_timeout,
        )?)
    } else {
        warn!("Not running in a cluster, orchestrator state is kept in memory");
        Arc::new(InMemoryOrchestrator::new())
    };
    let object_store: Arc<dyn AdminClientProvider> = match &config.object_store {
        ObjectStoreConfig::Http { url, token } => {
            info!(%url, "Object-store IAM via admin gateway");
            Arc::new(HttpAdminProvider::new(
                url.clone(),
                token.clone(),
                config.sync.call_timeout,
            )?)
        }
        ObjectStoreConfig::InMemory => {
            warn!("Object-store IAM is kept in memory and lost on exit");
            Arc::new(InMemoryObjectStore::new())
        }
    };
    let directory = Arc::new(RegistryDirectory::new(registry.clone()));
    let synchronizer = Arc::new(AuthorizationSynchronizer::new(object_store, directory.clone()));
    let proxy = Arc::new(ProxySync::new(
        orchestrator.clone(),
        directory.clone(),
        config.sync.config_map_name.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        synchronizer,
        proxy,
        orchestrator,
        Arc::new(TracingEmailSender),
        directory,
        EventBus::new(config.sync.event_capacity),
        config.sync.clone(),
        shutdown.clone(),
    ));
    let control = Arc::new(ControlPlane::new(
        registry.clone(),
        config.auth.clone(),
        &config.invite,
        dispatcher.clone(),
    ));

    let incidents = tokio::spawn(watch_incidents(
        dispatcher.events().subscribe(),
        shutdown.clone(),
    ));

    control.setup_db().await?;
    control.setup_migrate().await?;
    dispatcher.dispatch(vec![PostCommit::SyncProxyConfig]).await;

    let sweeper = {
        let control = control.clone();
        let shutdown = shutdown.clone();
        let period = config.session_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = control.expire_stale_sessions().await {
                            warn!(error = %err, "Session sweep failed");
                        }
                    }
                }
            }
        })
    };

    info!(
        namespace = %config.sync.namespace,
        sweep_interval_secs = config.session_sweep_interval.as_secs(),
        "Migrations applied, session sweeper running; waiting for shutdown"
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "Session sweeper did not stop cleanly");
    }
    if let Err(err) = incidents.await {
        warn!(error = %err, "Incident watcher did not stop cleanly");
    }
    registry.shutdown().await;
    Ok(())
}
