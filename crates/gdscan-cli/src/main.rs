//! gdscan CLI - scan files for a pattern through GPU memory

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gdscan_config::{BackendKind, LogFormat, LoggingSection, ScanConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

/// Exit status for session-level failures
const EXIT_SESSION_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "gdscan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device backend, overrides the configuration
    #[arg(long, global = true, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan files for a pattern
    Scan(commands::scan::ScanArgs),
    /// Show the selected device
    Info,
}

fn parse_backend(s: &str) -> std::result::Result<BackendKind, String> {
    s.parse().map_err(|e: gdscan_config::ConfigError| e.to_string())
}

fn load_config(path: Option<&std::path::Path>, backend: Option<BackendKind>) -> Result<ScanConfig> {
    let mut config = match path {
        Some(path) => ScanConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ScanConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("Invalid GDSCAN_* environment override")?;
    if let Some(backend) = backend {
        config.device.backend = backend;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Verbosity flags win, then `RUST_LOG`, then the configured level
fn init_tracing(verbose: u8, logging: &LoggingSection) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str())),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref(), cli.backend) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {:#}", err);
            return ExitCode::from(EXIT_SESSION_ERROR);
        }
    };
    init_tracing(cli.verbose, &config.logging);

    let outcome = match cli.command {
        Commands::Scan(args) => commands::scan::execute(&args, &config),
        Commands::Info => commands::info::execute(&config).map(|()| ExitCode::SUCCESS),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(EXIT_SESSION_ERROR)
        }
    }
}
