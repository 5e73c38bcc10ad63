//! Bridge Relayer - durable lock-and-mint relay between EVM chains
//!
//! For every configured direction the relayer watches the source bridge for
//! lock/burn events and mints the same amount on the destination bridge,
//! exactly once per event, across restarts, RPC outages and reorgs.

use anyhow::{anyhow, Result};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod state;
mod tx;

#[cfg(test)]
mod testing;

use chain::{ChainClient, ChainProvider};
use config::{DirectionConfig, LedgerBackend, LedgerConfig, LogFormat, Settings};
use coordination::{DirectionSettings, RelayCoordinator};
use error::{RelayerError, RelayerResult};
use events::function_selector;
use metrics::MetricsServer;
use state::{IdempotencyLedger, JsonFileStore, LedgerStore, PgLedgerStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration; any problem here exits before touching a chain
    let settings = Settings::load()?;
    init_logging(&settings.logging.format);

    info!("Starting Bridge Relayer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Loaded configuration for {} directions (instance {})",
        settings.enabled_directions().len(),
        settings.relayer.instance_id
    );

    let wallet = settings.wallet.load_wallet()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut ledgers = BTreeMap::new();
    let mut coordinators = Vec::new();

    for direction in settings.enabled_directions() {
        match start_direction(&settings, direction, &wallet).await {
            Ok((coordinator, ledger)) => {
                coordinators.push(coordinator);
                ledgers.insert(direction.name.clone(), ledger);
            }
            Err(e) if e.is_fatal_at_startup() => return Err(e.into()),
            Err(e) => error!("[{}] Direction not started: {}", direction.name, e),
        }
    }
    if coordinators.is_empty() {
        return Err(anyhow!("no direction could be started"));
    }

    // Start API server
    let api_handle = if settings.api.enabled {
        let config = settings.api.clone();
        let state = api::AppState::new(ledgers);
        Some(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

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

    // Start one coordinator per direction
    let mut running = JoinSet::new();
    for coordinator in coordinators {
        let name = coordinator.direction().to_string();
        let shutdown = shutdown_rx.clone();
        running.spawn(async move { (name, coordinator.run(shutdown).await) });
    }

    info!("Bridge Relayer is running");
    if settings.api.enabled {
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    let mut failed = false;
    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received, stopping..."),
        Some(joined) = running.join_next() => {
            failed = true;
            report_coordinator(joined);
            warn!("A coordinator stopped unexpectedly, stopping the others");
        }
    }

    // Graceful shutdown: coordinators finish in-progress ledger writes
    let _ = shutdown_tx.send(true);
    while let Some(joined) = running.join_next().await {
        failed |= report_coordinator(joined);
    }

    if let Some(h) = api_handle {
        h.abort();
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Bridge Relayer stopped");
    if failed {
        return Err(anyhow!("relay coordinator failed"));
    }
    Ok(())
}

/// Connect both chains of a direction, check the bridge and open its ledger
async fn start_direction(
    settings: &Settings,
    direction: &DirectionConfig,
    wallet: &LocalWallet,
) -> RelayerResult<(RelayCoordinator, Arc<IdempotencyLedger>)> {
    let source_config = settings.chain(&direction.source)?.clone();
    let destination_config = settings.chain(&direction.destination)?.clone();
    let expected_token = destination_config.expected_token()?;

    let source = Arc::new(ChainProvider::connect(source_config, &settings.relayer, None).await?);
    let destination = Arc::new(
        ChainProvider::connect(destination_config, &settings.relayer, Some(wallet.clone())).await?,
    );
    if let Some(signer) = destination.signer_address() {
        info!("[{}] Minting as {:?}", direction.name, signer);
    }
    if let Some(expected) = expected_token {
        verify_bridge_token(destination.as_ref(), expected).await?;
    }

    let ledger = Arc::new(
        open_ledger(&settings.ledger, &direction.name, settings.relayer.max_attempts).await?,
    );
    let coordinator = RelayCoordinator::new(
        DirectionSettings::from_config(settings, direction)?,
        source,
        destination,
        ledger.clone(),
    );

    Ok((coordinator, ledger))
}

/// Log a finished coordinator; true if it failed
fn report_coordinator(
    joined: std::result::Result<(String, RelayerResult<()>), tokio::task::JoinError>,
) -> bool {
    match joined {
        Ok((_, Ok(()))) => false,
        Ok((name, Err(e))) => {
            error!("[{}] Coordinator error: {}", name, e);
            true
        }
        Err(e) => {
            error!("Coordinator task failed: {}", e);
            true
        }
    }
}

async fn open_ledger(
    config: &LedgerConfig,
    direction: &str,
    max_attempts: u32,
) -> RelayerResult<IdempotencyLedger> {
    let store: Box<dyn LedgerStore> = match config.backend {
        LedgerBackend::File => {
            let store = JsonFileStore::new(&config.dir, direction);
            info!("[{}] Ledger file {}", direction, store.path().display());
            Box::new(store)
        }
        LedgerBackend::Postgres => {
            let url = config.database_url.as_deref().unwrap_or_default();
            let store = PgLedgerStore::connect(url, config.max_connections, direction).await?;
            store.run_migrations().await?;
            store.health_check().await?;
            info!("[{}] Database connection established", direction);
            Box::new(store)
        }
    };

    IdempotencyLedger::open(direction, store, max_attempts).await
}

/// Refuse to mint through a bridge bound to another token
async fn verify_bridge_token(client: &dyn ChainClient, expected: Address) -> RelayerResult<()> {
    let data = client
        .call_bridge(Bytes::from(function_selector("token()").to_vec()))
        .await?;
    if data.len() < 32 {
        return Err(RelayerError::Config(format!(
            "Bridge on chain {} returned no token address",
            client.chain_id()
        )));
    }

    let actual = Address::from_slice(&data[12..32]);
    if actual != expected {
        return Err(RelayerError::Config(format!(
            "Bridge on chain {} mints {:?}, expected {:?}",
            client.chain_id(),
            actual,
            expected
        )));
    }

    info!("Bridge on chain {} mints {:?}", client.chain_id(), actual);
    Ok(())
}

fn init_logging(format: &LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_relayer=debug,sqlx=warn,hyper=warn")
    });
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChain;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn token_check_accepts_matching_bridge() {
        let chain = FakeChain::destination(11155111);
        let token = Address::from_low_u64_be(0x70c);
        chain.set_token(token);

        assert_ok!(verify_bridge_token(&chain, token).await);
        let err = assert_err!(verify_bridge_token(&chain, Address::from_low_u64_be(0xbad)).await);
        assert!(matches!(err, RelayerError::Config(_)));
    }

    #[tokio::test]
    async fn token_check_needs_a_reachable_chain() {
        let chain = FakeChain::destination(11155111);
        chain.set_offline(true);
        let err = assert_err!(verify_bridge_token(&chain, Address::zero()).await);
        assert!(matches!(err, RelayerError::Connection { .. }));
    }

    #[tokio::test]
    async fn file_ledger_reopens_with_state() {
        let dir = TempDir::new().unwrap();
        let config = LedgerConfig {
            dir: dir.path().to_path_buf(),
            ..LedgerConfig::default()
        };

        let ledger = open_ledger(&config, "helios-to-sepolia", 5).await.unwrap();
        ledger
            .record_seen(&crate::testing::sample_event(0xabc, 0, 3))
            .await
            .unwrap();
        ledger.advance_watermark(9).await.unwrap();
        drop(ledger);

        let reopened = open_ledger(&config, "helios-to-sepolia", 5).await.unwrap();
        assert_eq!(reopened.watermark().await, Some(9));
        assert_eq!(reopened.stats().await.seen, 1);
        assert!(dir.path().join("helios-to-sepolia.json").exists());
    }
}
