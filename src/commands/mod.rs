//! CLI subcommands

pub mod run;
pub mod status;
pub mod trades;

use anyhow::{Context, Result};
use grid_hedge_engine::Config;

/// Load the config file and apply a state-dir override
pub fn load_config(config_path: &str, state_dir: Option<String>) -> Result<Config> {
    dotenv::dotenv().ok();
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(dir) = state_dir {
        config.engine.state_dir = dir;
    }
    Ok(config)
}
