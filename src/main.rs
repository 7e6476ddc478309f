use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lhystudios_runtime::config::ControllerConfig;
use lhystudios_runtime::lhystudios::{Board, SimulatedBoard, UsbDriver};

/// Lhystudios laser controller runtime
#[derive(Parser, Debug)]
#[command(name = "lhystudios-runtime")]
#[command(version)]
#[command(about = "Streams motion jobs received over zenoh to a Lhystudios board")]
struct Args {
    /// Controller board, e.g. M2, B1, LASER-A
    #[arg(short, long)]
    board: Option<Board>,

    /// JSON controller config; command-line flags override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Skip the device and synthesize status replies
    #[arg(long)]
    mock: bool,

    /// USB device index
    #[arg(short, long)]
    index: Option<usize>,

    /// Open attempts before reporting the connection as failing
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Leave the rail unlocked after rapid moves
    #[arg(long)]
    no_autolock: bool,
}

impl Args {
    fn controller_config(
        &self,
    ) -> Result<ControllerConfig, Box<dyn std::error::Error + Send + Sync>> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_json_file(path)?,
            None => ControllerConfig::default(),
        };
        if let Some(board) = self.board {
            config.board = board;
        }
        if let Some(index) = self.index {
            config.usb_index = index;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_open_attempts = attempts;
        }
        config.mock |= self.mock;
        if self.no_autolock {
            config.autolock = false;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = match args.controller_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(2);
        }
    };

    // No hardware backend is linked in; the simulated board stands in for it
    let driver: Option<Box<dyn UsbDriver>> = if config.mock {
        info!("Mock mode: no device");
        None
    } else {
        warn!("No USB backend available, using simulated board");
        Some(Box::new(SimulatedBoard::new()))
    };

    if let Err(e) = lhystudios_runtime::runtime::run(config, driver).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "lhystudios-runtime",
            "--board",
            "laser-b1",
            "--mock",
            "--no-autolock",
            "--max-attempts",
            "7",
        ]);
        let config = args.controller_config().expect("config");
        assert_eq!(config.board, Board::LaserB1);
        assert!(config.mock);
        assert!(!config.autolock);
        assert_eq!(config.max_open_attempts, 7);
        assert_eq!(config.usb_index, 0);
    }
}
