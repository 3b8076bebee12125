//! Trades command: print the trade log or export it as CSV

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use grid_hedge_engine::state_manager::create_state_manager;
use grid_hedge_engine::TradeRecord;

pub fn run(
    config_path: String,
    state_dir: Option<String>,
    symbol: Option<String>,
    csv_path: Option<PathBuf>,
) -> Result<()> {
    let config = super::load_config(&config_path, state_dir)?;
    let store = create_state_manager(&config.engine.state_dir)?;

    let mut trades: Vec<TradeRecord> = store
        .load_all()?
        .into_iter()
        .filter(|s| symbol.as_deref().map_or(true, |wanted| s.symbol.as_str() == wanted))
        .flat_map(|s| s.trades)
        .collect();
    trades.sort_by_key(|t| t.closed_at);

    if let Some(path) = csv_path {
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for trade in &trades {
            writer.serialize(trade)?;
        }
        writer.flush()?;
        info!("Exported {} trades to {}", trades.len(), path.display());
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<6} {:<6} {:>12} {:>12} {:>12} {:>9}  {}",
        "Closed", "Symbol", "Leg", "Side", "Size", "Entry", "Exit", "P&L %", "Reason"
    );
    for t in &trades {
        println!(
            "{:<20} {:<10} {:<6} {:<6} {:>12.6} {:>12.4} {:>12.4} {:>+9.2}  {}",
            t.closed_at.format("%Y-%m-%d %H:%M:%S"),
            t.symbol.as_str(),
            format!("{:?}", t.leg),
            t.side.to_string(),
            t.size,
            t.entry_price,
            t.exit_price,
            t.profit_percent,
            t.reason
        );
    }
    println!("\n{} trades", trades.len());
    Ok(())
}
