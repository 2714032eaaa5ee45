//! Atomic swap coordinator - hashlock/timelock escrow coordination across two chains
//!
//! Runs the orchestrator over the configured chains, exposes Prometheus
//! metrics and optionally drives a demo swap.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use atomic_swap_coordinator::chain::ChainManager;
use atomic_swap_coordinator::config::{DemoConfig, Settings};
use atomic_swap_coordinator::coordination::Orchestrator;
use atomic_swap_coordinator::metrics::MetricsServer;
use atomic_swap_coordinator::state::{EventJournal, SwapRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting atomic swap coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Restore or create swap state
    let journal_path = settings.journal.path.as_ref().filter(|_| settings.journal.enabled);
    let registry = match journal_path {
        Some(path) => {
            let registry = if path.exists() {
                SwapRegistry::restore(path)?
            } else {
                SwapRegistry::with_journal(EventJournal::open(path)?)
            };
            info!("Journaling swap state to {:?}", path);
            Arc::new(registry)
        }
        None => Arc::new(SwapRegistry::new()),
    };

    // Initialize chain manager (one client per configured chain)
    let chain_manager = Arc::new(ChainManager::from_settings(&settings));
    info!("Chains connected: {:?}", chain_manager.connected_chains());

    // Initialize orchestrator
    let orchestrator = Arc::new(Orchestrator::new(
        settings.coordinator.clone(),
        settings.timelocks.clone(),
        registry,
        chain_manager,
    ));
    orchestrator.resume_monitors().await;
    let orchestrator_handle = orchestrator.spawn();
    info!("Orchestrator initialized");

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    if let Some(demo) = settings.demo.clone().filter(|d| d.enabled) {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = run_demo(&orchestrator, demo).await {
                error!("Demo swap failed: {}", e);
            }
        });
    }

    info!("Atomic swap coordinator is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    orchestrator.shutdown();
    match orchestrator_handle.await {
        Ok(Err(e)) => error!("Orchestrator error: {}", e),
        Err(e) => error!("Orchestrator task failed: {}", e),
        Ok(Ok(())) => {}
    }

    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Atomic swap coordinator stopped");
    Ok(())
}

/// Initiate the configured swap and withdraw its destination escrow
async fn run_demo(orchestrator: &Orchestrator, demo: DemoConfig) -> Result<()> {
    let secret = demo.swap.secret.clone();
    let swap_id = orchestrator.initiate_swap(demo.swap).await?;
    info!("Demo swap {} initiated", swap_id);

    let tx = orchestrator.complete_withdrawal(&swap_id, &secret).await?;
    let record = orchestrator.get_status(&swap_id).await?;
    info!(
        "Demo swap {} withdrawn on destination (tx {}); status {}, stage {}, synchronized {}",
        swap_id,
        tx.hash,
        record.status,
        record.stage,
        orchestrator.is_synchronized(&swap_id).await?
    );
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atomic_swap_coordinator=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
