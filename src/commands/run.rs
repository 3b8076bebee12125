//! Run command: start the engine and drive it until Ctrl+C

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use grid_hedge_engine::config::DataSource;
use grid_hedge_engine::exchange::{Exchange, ExchangeClient, SimulatedExchange};
use grid_hedge_engine::notify::Notifier;
use grid_hedge_engine::state_manager::create_state_manager;
use grid_hedge_engine::{Config, Engine};

pub struct RunOptions {
    pub config_path: String,
    pub state_dir: Option<String>,
    pub interval: Option<u64>,
    pub simulated: bool,
    pub live: bool,
}

pub fn run(options: RunOptions) -> Result<()> {
    let mut config = super::load_config(&options.config_path, options.state_dir)?;
    if let Some(interval) = options.interval {
        config.engine.tick_interval_secs = interval.max(1);
    }
    if options.simulated {
        config.engine.data_source = DataSource::Simulated;
    } else if options.live {
        config.engine.data_source = DataSource::Live;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config))
}

fn build_exchange(config: &Config) -> Result<Arc<dyn Exchange>> {
    match config.engine.data_source {
        DataSource::Live => {
            if config.exchange.api_key.is_none() || config.exchange.api_secret.is_none() {
                anyhow::bail!("Live mode needs BYBIT_API_KEY and BYBIT_API_SECRET");
            }
            let client = ExchangeClient::from_config(&config.exchange)
                .context("Failed to build exchange client")?;
            Ok(Arc::new(client))
        }
        DataSource::Simulated => {
            let seed = config
                .engine
                .simulation_seed
                .unwrap_or_else(|| Utc::now().timestamp_millis().unsigned_abs());
            info!("Simulated feed seed: {}", seed);
            Ok(Arc::new(SimulatedExchange::new(seed)))
        }
    }
}

async fn run_async(config: Config) -> Result<()> {
    let mode = match config.engine.data_source {
        DataSource::Live => "LIVE",
        DataSource::Simulated => "SIMULATED",
    };

    info!("==============================================================");
    info!("  GRID & HEDGE ENGINE - {} MODE", mode);
    info!("  Symbols: {}", config.symbols.iter().map(|s| s.symbol.as_str()).collect::<Vec<_>>().join(", "));
    info!("  Tick interval: {}s, flush every {}s", config.engine.tick_interval_secs, config.engine.flush_interval_secs);
    info!("  State dir: {}", config.engine.state_dir);
    info!("==============================================================");

    if config.engine.data_source == DataSource::Live {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 10 seconds to abort...");
        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    let exchange = build_exchange(&config)?;
    let store = Arc::new(create_state_manager(&config.engine.state_dir)?);
    let (notifier, _delivery) = Notifier::spawn(&config.notify);

    let engine = Engine::new(&config, exchange, store, notifier)?;

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating shutdown..."),
            Err(e) => {
                warn!("Error setting up signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    engine.run(shutdown).await?;

    // Let queued alerts drain before the runtime goes away
    sleep(Duration::from_millis(500)).await;
    info!("Engine session ended.");
    Ok(())
}
