//! # Conveyor Server
//!
//! Runs one dispatcher process: loads configuration, hosts the dispatcher
//! on a reactor and stops it cleanly on Ctrl+C or SIGTERM.

use anyhow::Context;
use conveyor_config::{AppConfig, ConfigLoader};
use conveyor_dispatcher::{
    register_metrics, CallableRegistry, Dispatcher, DispatcherEvent, DispatcherSettings, MemoryStore, ReactorConfig,
    Store, StoreKeys, TokioReactor,
};
use conveyor_server::callables::register_builtin;
use conveyor_server::startup::{init_logging, print_banner, print_startup_info};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config = match load_config().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.observability);
    print_banner();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    if let Err(e) = run(config).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn load_config() -> anyhow::Result<AppConfig> {
    let loader = ConfigLoader::from_default_location()?;
    Ok(loader.get().await)
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    if config.observability.metrics_enabled {
        register_metrics();
    }

    let store: Arc<dyn Store> = Arc::new(MemoryStore::with_pool_size(config.store.pool_size));
    let reactor = Arc::new(
        TokioReactor::start(ReactorConfig::from(&config.dispatcher)).context("Failed to start reactor")?,
    );

    let callables = Arc::new(CallableRegistry::new());
    register_builtin(&callables);

    let settings = DispatcherSettings::try_from(&config.dispatcher)?;
    let dispatcher = Dispatcher::builder()
        .store(store)
        .reactor(reactor.clone())
        .settings(settings)
        .callables(callables)
        .keys(StoreKeys::new(config.store.key_prefix.clone()))
        .build()
        .context("Failed to build dispatcher")?;

    print_startup_info(&dispatcher);
    let event_log = tokio::spawn(log_events(dispatcher.subscribe()));
    dispatcher.start();

    shutdown_signal().await;

    // Before-shutdown hooks deactivate the dispatcher on the reactor thread
    let stopping = reactor.clone();
    tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("Reactor shutdown task failed")??;
    event_log.abort();

    let status = dispatcher.status_info();
    info!(dispatcher_id = %dispatcher.uuid(), status = %status.status, "Dispatcher shutdown complete");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<DispatcherEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                match event {
                    DispatcherEvent::JobStarted { .. }
                    | DispatcherEvent::JobSucceeded { .. }
                    | DispatcherEvent::JobFailed { .. } => {
                        debug!(event = event.name(), payload = %payload, "Dispatcher event");
                    }
                    _ => info!(event = event.name(), payload = %payload, "Dispatcher event"),
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped = skipped, "Event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
