use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use compute_market::config::ProviderConfig;
use compute_market::ledger::{Ledger, RestLedger};
use compute_market::service::ComputeService;

/// Console logging, plus a daily rolling file when `MARKET_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("MARKET_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "compute-provider.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = ProviderConfig::from_env().context("Invalid configuration")?;

    eprintln!("compute-provider v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {} (max {} jobs)", config.market.workers, config.market.max_jobs);
    eprintln!("   Ledger: {}", config.ledger.rest_url);
    eprintln!("   Service address: {}", config.payment.service_address);

    let ledger: Arc<dyn Ledger> =
        Arc::new(RestLedger::new(&config.ledger).context("Failed to build ledger client")?);
    let service = ComputeService::start(&config, Arc::clone(&ledger));

    // ── Provider bridge ─────────────────────────────────────────────────
    let bridge = if config.bridge_enabled() {
        let bridge = service.bridge(config.bridge.clone());
        if let Err(e) = bridge.register().await {
            tracing::warn!(error = %e, "Provider registration failed, continuing");
        }
        eprintln!("   Contract: {}", config.bridge.contract_address);
        Some(tokio::spawn(bridge.run()))
    } else {
        eprintln!("   Contract bridge: disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    let report = service.shutdown(config.market.shutdown_grace).await;
    if let Some(bridge) = bridge {
        let _ = bridge.await;
    }
    if report.abandoned > 0 {
        eprintln!("Abandoned {} background tasks", report.abandoned);
    }
    Ok(())
}
