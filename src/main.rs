use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use ejection_trader::execution::StrategyConfig;
use ejection_trader::feed::{load_bars, synthetic_bars};
use ejection_trader::replay::run_replay;

#[derive(Parser, Debug)]
#[command(name = "ejection-trader")]
#[command(about = "Momentum-ejection trading engine with broker reconciliation")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Strategy config (JSON); defaults apply for missing fields
    #[arg(short, long, global = true, env = "EJECTION_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay bars from a CSV file against the simulated broker
    Replay {
        /// CSV with timestamp,open,high,low,close
        #[arg(short, long)]
        bars: PathBuf,

        /// Leading bars treated as historical (warm-up only)
        #[arg(long, default_value = "0")]
        historical: usize,
    },

    /// Run a session over a seeded synthetic random walk
    Demo {
        /// Number of one-minute bars
        #[arg(short, long, default_value = "1440")]
        bars: usize,

        /// Random seed
        #[arg(short, long, default_value = "7")]
        seed: u64,

        /// Starting price
        #[arg(long, default_value = "20000.0")]
        start_price: f64,
    },
}

fn load_config(path: Option<&Path>) -> Result<StrategyConfig> {
    match path {
        Some(path) => {
            info!("Loading config from {:?}", path);
            StrategyConfig::load(path)
        }
        None => {
            let config = StrategyConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ejection_trader=info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    info!(
        "Instrument: {} | Fast/Slow: {}/{} | Trigger: {:.4} | SL/TP: {}/{} ticks | Grid: {}",
        config.instrument,
        config.fast_period,
        config.slow_period,
        config.ejection_trigger,
        config.stop_loss_ticks,
        config.take_profit_ticks,
        if config.use_grid_entry {
            format!("{} x {} ticks", config.grid_steps, config.grid_step_ticks)
        } else {
            "off".to_string()
        }
    );

    let bars = match args.command {
        Commands::Replay { bars, historical } => load_bars(&bars, historical)?,
        Commands::Demo {
            bars,
            seed,
            start_price,
        } => {
            let start = Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).single().unwrap_or_else(Utc::now);
            synthetic_bars(seed, bars, start_price, start, 60)
        }
    };

    let summary = run_replay(config, &bars).await?;
    info!("Session {} complete", summary.session_id);
    info!("{}", summary.summary());

    Ok(())
}
