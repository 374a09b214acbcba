//! # fl2sitl
//!
//! Replay a flight log into an INAV SITL instance.
//!
//! ```text
//! fl2sitl --config fl2sitl.toml --auto-arm -v flight.jsonl
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use fl2sitl::bridge;
use fl2sitl::config::Config;

/// Default configuration file, used when present
const DEFAULT_CONFIG: &str = "fl2sitl.toml";

#[derive(Parser, Debug)]
#[command(
    name = "fl2sitl",
    version,
    about = "Replay flight logs through INAV SITL"
)]
struct Cli {
    /// Flight log to replay (JSON lines)
    log: PathBuf,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not start the simulator; wait for one started by hand
    #[arg(long)]
    no_start: bool,

    /// Arm and disarm when the log does
    #[arg(long)]
    auto_arm: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// EEPROM image for the simulator
    #[arg(long)]
    eeprom: Option<String>,

    /// Local UDP address for the simulator datarefs
    #[arg(long)]
    listen: Option<String>,

    /// Flight controller MSP address (host:port)
    #[arg(long)]
    link: Option<String>,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::load_or_default(DEFAULT_CONFIG)?,
        };

        if self.no_start {
            config.simulator.auto_start = false;
        }
        if self.auto_arm {
            config.replay.auto_arm = true;
        }
        config.logging.verbosity = config.logging.verbosity.max(self.verbose);
        if let Some(eeprom) = &self.eeprom {
            config.simulator.eeprom = Some(eeprom.clone());
        }
        if let Some(listen) = &self.listen {
            config.simulator.listen = listen.clone();
        }
        if let Some(link) = &self.link {
            config.link.address = link.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Default filter directive for a verbosity level
fn filter_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "info,fl2sitl=debug",
        _ => "trace",
    }
}

/// Set up tracing; `RUST_LOG` overrides the verbosity level
///
/// The returned guard flushes the log file and must live until exit.
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config.logging.verbosity)));

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    let _log_guard = init_logging(&config)?;

    info!("fl2sitl v{} starting...", env!("CARGO_PKG_VERSION"));

    bridge::run(&config, &cli.log)
        .await
        .with_context(|| format!("replaying {}", cli.log.display()))?;
    Ok(())
}
