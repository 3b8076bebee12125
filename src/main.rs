//! Grid & hedge engine - main entry point
//!
//! This binary provides three subcommands:
//! - run: Start the trading engine (simulated or live)
//! - status: Show persisted per-symbol state and performance
//! - trades: Print or export the trade log

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "grid-hedge-engine")]
#[command(about = "Adaptive grid and hedge trading engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine until Ctrl+C
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/grid_hedge.json")]
        config: String,

        /// State directory (overrides config file)
        #[arg(long)]
        state_dir: Option<String>,

        /// Tick interval in seconds (overrides config file)
        #[arg(long)]
        interval: Option<u64>,

        /// Use the simulated price feed and paper venue
        #[arg(long, conflicts_with = "live")]
        simulated: bool,

        /// Trade against the configured exchange (CAUTION - REAL MONEY!)
        #[arg(long)]
        live: bool,
    },

    /// Show persisted state for every symbol
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/grid_hedge.json")]
        config: String,

        /// State directory (overrides config file)
        #[arg(long)]
        state_dir: Option<String>,
    },

    /// Print the trade log, optionally exporting it as CSV
    Trades {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/grid_hedge.json")]
        config: String,

        /// State directory (overrides config file)
        #[arg(long)]
        state_dir: Option<String>,

        /// Only this symbol
        #[arg(short, long)]
        symbol: Option<String>,

        /// Write the trades to this CSV file instead of printing them
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // Same format without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Status { .. } => "status",
        Commands::Trades { .. } => "trades",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            state_dir,
            interval,
            simulated,
            live,
        } => commands::run::run(commands::run::RunOptions {
            config_path: config,
            state_dir,
            interval,
            simulated,
            live,
        }),

        Commands::Status { config, state_dir } => commands::status::run(config, state_dir),

        Commands::Trades {
            config,
            state_dir,
            symbol,
            csv,
        } => commands::trades::run(config, state_dir, symbol, csv),
    }
}
