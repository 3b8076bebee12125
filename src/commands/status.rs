//! Status command: print persisted per-symbol state

use anyhow::Result;

use grid_hedge_engine::state_manager::create_state_manager;

pub fn run(config_path: String, state_dir: Option<String>) -> Result<()> {
    let config = super::load_config(&config_path, state_dir)?;
    let store = create_state_manager(&config.engine.state_dir)?;

    for symbol_config in &config.symbols {
        let snapshot = store.load_or_default(&symbol_config.symbol())?;
        let perf = &snapshot.performance;

        println!("\n{}", "=".repeat(60));
        println!("{}  [{}]", snapshot.symbol, snapshot.book.state());
        println!("{}", "=".repeat(60));

        match &snapshot.book.main {
            Some(main) => println!(
                "Main:   {} {:.6} @ {:.4} | stop {} | dca {}",
                main.side,
                main.size,
                main.entry_price,
                main.stop_loss.map_or("-".to_string(), |s| format!("{:.4}", s)),
                main.dca_count
            ),
            None => println!("Main:   -"),
        }
        match &snapshot.book.hedge {
            Some(hedge) => println!(
                "Hedge:  {} {:.6} @ {:.4} | stop {}",
                hedge.side,
                hedge.size,
                hedge.entry_price,
                hedge.stop_loss.map_or("-".to_string(), |s| format!("{:.4}", s))
            ),
            None => println!("Hedge:  -"),
        }
        match &snapshot.grid {
            Some(grid) => println!(
                "Grid:   gen {} | centre {:.4} | spacing {:.3}% | {} levels | inventory {:.6}",
                grid.generation,
                grid.center,
                grid.spacing * 100.0,
                grid.levels.len(),
                grid.inventory()
            ),
            None => println!("Grid:   -"),
        }
        println!("Orders: {} live", snapshot.live_orders.len());
        println!(
            "Trades: {} | win rate {:.1}% | avg {:+.2}% | best {:+.2}% | worst {:+.2}% | volume {:.2}",
            perf.total_trades,
            perf.win_rate,
            perf.avg_profit_percent,
            if perf.total_trades > 0 { perf.best_profit_percent } else { 0.0 },
            if perf.total_trades > 0 { perf.worst_profit_percent } else { 0.0 },
            perf.total_volume
        );
        if let Some(updated) = snapshot.updated_at {
            println!("Saved:  {}", updated.to_rfc3339());
        }
    }

    Ok(())
}
