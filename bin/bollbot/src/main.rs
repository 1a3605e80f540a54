use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, ExchangeClient, LiveCell, StateStore, TradingMode};
use engine::{FuturesClient, KlineStream, Pipeline, SignalExecutor};
use paper::PaperClient;
use store::SqliteStore;
use strategy::StrategyFileConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env().context("Invalid configuration")?;

    // ── Logging ──────────────────────────────────────────────────────────────
    // RUST_LOG wins over LOG_LEVEL when both are set.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.log_level).context("Invalid LOG_LEVEL")?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        symbol = %cfg.symbol,
        interval = %cfg.interval,
        mode = %cfg.trading_mode,
        "BollBot starting"
    );

    let strategy_file = StrategyFileConfig::load_or_default(&cfg.strategy_config_path)
        .context("Invalid strategy config")?;

    // ── Database ──────────────────────────────────────────────────────────────
    let db = Arc::new(
        SqliteStore::connect(&cfg.database_url)
            .await
            .context("Failed to open database")?,
    );
    let store: Arc<dyn StateStore> = db.clone();

    // ── Exchange client (injected based on SIMULATE_TRADING) ─────────────────
    let exchange_client: Arc<dyn ExchangeClient> = match cfg.trading_mode {
        TradingMode::Live => {
            info!("Live trading mode, using FuturesClient");
            let client = FuturesClient::new(&cfg.symbol, cfg.rest.clone(), strategy_file.execution)
                .context("Failed to build futures client")?;
            client.apply_leverage().await;
            Arc::new(client)
        }
        TradingMode::Paper => {
            info!(balance = cfg.simulate_balance, "Paper trading mode, using PaperClient");
            Arc::new(PaperClient::new(cfg.simulate_balance, strategy_file.execution))
        }
    };

    // ── Pipeline ──────────────────────────────────────────────────────────────
    let live = LiveCell::new();
    let executor = SignalExecutor::new(exchange_client, store.clone(), cfg.trading_mode);
    let mut pipeline = Pipeline::restore(
        &strategy_file,
        store,
        executor,
        live.clone(),
        cfg.position_sync,
    )
    .await
    .context("Failed to restore strategy state")?;

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    // ── Dashboard API ─────────────────────────────────────────────────────────
    match cfg.dashboard_token.clone() {
        Some(token) => {
            let api_state = api::AppState {
                store: db,
                live,
                config: Arc::new(api::DashboardConfig {
                    symbol: cfg.symbol.clone(),
                    interval: cfg.interval.clone(),
                    mode: cfg.trading_mode,
                    position_sync: cfg.position_sync,
                    execution: strategy_file.execution,
                }),
                dashboard_token: token,
            };
            let port = cfg.dashboard_port;
            let api_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = api::serve(api_state, port, api_shutdown).await {
                    error!(error = %e, "Dashboard stopped");
                }
            });
        }
        None => warn!("DASHBOARD_TOKEN not set, dashboard disabled"),
    }

    // ── Market stream ─────────────────────────────────────────────────────────
    let stream = KlineStream::new(cfg.stream.clone()).context("Invalid stream settings")?;
    stream.run(&mut pipeline, shutdown_rx).await?;

    info!("BollBot stopped");
    Ok(())
}
