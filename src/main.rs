//! ransomwatch - host-based ransomware early-detection and containment
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon in the foreground (interactive prompts)
//! sudo ransomwatch start --foreground
//!
//! # Inspect tracked processes and recent alerts
//! sudo ransomwatch status
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use ransomwatch::config::Config;
use ransomwatch::daemon;

#[derive(Parser)]
#[command(name = "ransomwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ransomwatch/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ransomwatch daemon
    Start {
        /// Run in foreground (don't daemonize; decision prompts are
        /// answered on this terminal)
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the ransomwatch daemon
    Stop,

    /// Check daemon status: tracked processes, recent alerts, whitelist
    Status,

    /// View activity logs
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },

    /// Show effective configuration
    Config,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// Not #[tokio::main]: `start` has to fork before any runtime thread
// exists, so it builds its own runtime after the fork. The client
// commands get a runtime here.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        if cli.config.exists() {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
        info!("using default configuration");
        Config::default()
    });

    match cli.command {
        Commands::Start { foreground } => {
            info!("starting ransomwatch daemon...");
            daemon::start(config, foreground)?;
        }

        Commands::Stop => {
            client_runtime()?.block_on(daemon::stop(&config))?;
        }

        Commands::Status => {
            client_runtime()?.block_on(daemon::status(&config))?;
        }

        Commands::Logs { lines, follow } => {
            client_runtime()?.block_on(daemon::show_logs(&config, lines, follow))?;
        }

        Commands::Config => {
            println!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}

fn client_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}
