//! Relay server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use relay_common::{Config, Entrypoint, Environment, ProcessManifest};
use relay_queue::{DispatcherOptions, HttpTaskHandler, QueueRegistry};
use relay_server::{AppState, app, drain_on};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn main() -> anyhow::Result<()> {
    // Load configuration (also reads .env, which may set RUST_LOG)
    let config = Config::load().context("failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tower_http=debug".into()),
        )
        .init();

    let manifest = config
        .dispatcher
        .process_manifest
        .as_ref()
        .map(ProcessManifest::from_file)
        .transpose()
        .context("failed to load process manifest")?;
    let entrypoint = manifest
        .as_ref()
        .map(ProcessManifest::entrypoint)
        .transpose()?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = config
        .dispatcher
        .workers
        .or_else(|| entrypoint.as_ref().map(Entrypoint::pool_size))
    {
        runtime.worker_threads(threads.max(1));
    }

    runtime
        .build()
        .context("failed to build runtime")?
        .block_on(serve(config, manifest, entrypoint))
}

async fn serve(
    config: Config,
    manifest: Option<ProcessManifest>,
    entrypoint: Option<Entrypoint>,
) -> anyhow::Result<()> {
    info!("Starting relay server...");

    let env = manifest
        .as_ref()
        .map(ProcessManifest::environment)
        .unwrap_or_default();
    if let Some(manifest) = &manifest {
        info!(
            service = %manifest.service,
            instances = manifest.instances(),
            env_variables = env.len(),
            "Loaded process manifest"
        );
    }

    // Load queues
    let registry = QueueRegistry::from_file(&config.dispatcher.queue_manifest)
        .with_context(|| format!("failed to load {}", config.dispatcher.queue_manifest.display()))?;
    info!(queues = registry.len(), "Loaded queue manifest");

    // Every queue's target must route somewhere before anything is accepted
    let user_agent = format!("relay/{}", env!("CARGO_PKG_VERSION"));
    let handler = HttpTaskHandler::new(&config.targets, &env, &user_agent)?;
    handler.check_targets(registry.targets())?;

    let options = DispatcherOptions::from(&config.dispatcher);
    if options.inline {
        warn!("Inline mode enabled: tasks run on submission and are not retried");
    }
    let state = AppState::new(Arc::new(registry), Arc::new(handler), options);

    let dispatcher = state.dispatcher.clone();
    let dispatcher_task = tokio::spawn(async move { dispatcher.run().await });

    let addr = listen_addr(&config, entrypoint.as_ref(), &env)?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(drain_on(state.clone(), shutdown_signal()))
        .await?;

    // Wait for in-flight tasks; a serve error may have skipped the signal
    state.dispatcher.shutdown();
    if let Err(e) = dispatcher_task.await {
        error!(error = %e, "Dispatcher task failed");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Address from the entrypoint's `--bind`, else the configured one.
fn listen_addr(
    config: &Config,
    entrypoint: Option<&Entrypoint>,
    env: &Environment,
) -> anyhow::Result<SocketAddr> {
    let (host, port) = match entrypoint.and_then(|e| e.bind.as_ref()) {
        Some(bind) => {
            let port = bind.resolve_port(|var| {
                env.get(var)
                    .map(str::to_string)
                    .or_else(|| std::env::var(var).ok())
            })?;
            (bind.host_or(&config.server.host), port)
        }
        None => (config.server.host.as_str(), config.server.port),
    };

    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))
}
