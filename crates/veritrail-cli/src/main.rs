//! veritrail — automated compliance evidence collection.
//!
//! CLI front end over `veritrail-core`: configure credentials, collect
//! evidence into the tamper-evident ledger, inspect gaps, verify chain
//! integrity, and render reports.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod platform;

/// veritrail — automated compliance evidence collection
#[derive(Parser, Debug)]
#[command(name = "veritrail")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.veritrail/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set up configuration and store platform credentials
    Init {
        /// Directory-platform tenant ID
        #[arg(long)]
        tenant_id: Option<String>,

        /// Application (client) ID
        #[arg(long)]
        client_id: Option<String>,
    },

    /// Collect compliance evidence from configured sources
    Collect {
        /// Specific control IDs to collect (collects all if omitted)
        #[arg(long = "control")]
        controls: Vec<String>,

        /// Show the task plan without collecting anything
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of tasks in flight (overrides config)
        #[arg(long)]
        jobs: Option<usize>,
    },

    /// Show controls that are not fully compliant
    Gaps {
        /// Output format
        #[arg(long, value_parser = ["table", "json"], default_value = "table")]
        format: String,
    },

    /// Verify evidence integrity by walking every hash chain
    Verify,

    /// Generate a compliance report
    Report {
        /// Output directory
        #[arg(long, default_value = "./audit-pack")]
        output: PathBuf,

        /// Report format
        #[arg(long, value_parser = ["html", "json"], default_value = "html")]
        format: String,
    },

    /// Test connectivity of every registered collector
    Healthcheck,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("veritrail={0},veritrail_core={0}", cli.log_level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(veritrail_core::config::default_config_path);

    match cli.command {
        Commands::Init {
            tenant_id,
            client_id,
        } => commands::init::run(&config_path, tenant_id, client_id),
        Commands::Collect {
            controls,
            dry_run,
            jobs,
        } => commands::collect::run(&config_path, &controls, dry_run, jobs),
        Commands::Gaps { format } => commands::gaps::run(&config_path, &format),
        Commands::Verify => commands::verify::run(&config_path),
        Commands::Report { output, format } => {
            commands::report::run(&config_path, &output, &format)
        }
        Commands::Healthcheck => commands::healthcheck::run(&config_path),
    }
}
