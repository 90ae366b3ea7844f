// Grid Trading Engine - CLI
// Single entry point: workspace setup, pre-flight validation, grid preview and the paper-trading loop

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use grid_trading_engine::{Config, ConfigError, TradingError};

// Load command modules from cli directory
#[path = "../cli/config_commands.rs"]
mod config_commands;
#[path = "../cli/run_commands.rs"]
mod run_commands;

#[derive(Parser)]
#[command(name = "grid-bot")]
#[command(version)]
#[command(about = "Grid Trading Decision Engine", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (TOML, or JSON with a .json extension)
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run pre-flight checks against the configuration
    Validate {
        /// Also check that the market data API is reachable
        #[arg(long)]
        online: bool,
    },

    /// Print the grid a pair would use at a given price
    Plan {
        /// Trading pair as configured (e.g. BTC/USDT)
        pair: String,

        /// Reference price for the grid centre
        #[arg(short, long)]
        price: f64,
    },

    /// Run the engine against live market data with paper execution
    Run {
        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,

        /// Fixed AI confidence supplied to every pair
        #[arg(long)]
        ai_confidence: Option<f64>,

        /// Deliver alerts to Telegram instead of the log
        #[arg(long)]
        telegram: bool,

        /// Seed for the paper gateway's simulated fills
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging first (before the engine starts so config errors are visible)
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::from_file(&cli.config)
            .map(|config| config.logging.log_level)
            .unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Grid Trading Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("📁 Config: {}", cli.config);

    let result = match cli.command {
        // Init doesn't require config (it creates it)
        Commands::Init { force } => config_commands::init_config(&cli.config, force),

        Commands::Validate { online } => config_commands::validate_config(&cli.config, online).await,

        Commands::Plan { pair, price } => {
            let config = load_config_or_exit(&cli.config);
            config_commands::plan_grid(&config, &pair, price)
        }

        Commands::Run { cycles, ai_confidence, telegram, seed } => {
            let config = load_config_or_exit(&cli.config);
            let options = run_commands::RunOptions { cycles, ai_confidence, telegram, seed };
            run_commands::run_engine(config, options).await
        }
    };

    if let Err(e) = result {
        exit_with(&e);
    }
}

/// Print the error with its hints and exit non-zero
fn exit_with(e: &TradingError) -> ! {
    error!("❌ Command failed [{}]", e.category());
    for line in e.user_message().lines() {
        error!("{}", line);
    }
    std::process::exit(1);
}

/// Load config or exit with helpful error message
fn load_config_or_exit(path: &str) -> Config {
    Config::from_file(path).unwrap_or_else(|e: ConfigError| exit_with(&TradingError::from(e)))
}
