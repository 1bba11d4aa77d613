//! piawg: WireGuard profiles for Private Internet Access
//!
//! Main entry point. Initializes the global allocator, parses the command
//! line, sets up logging, and dispatches to the subcommand handlers.

mod commands;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use commands::{CreateConfigArgs, ShowRegionsArgs};
use piawg_vpn::{NegotiateError, Settings};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "piawg")]
#[command(about = "Generate WireGuard profiles for Private Internet Access", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Case sensitive region searching (default)
    #[arg(long, global = true, overrides_with = "no_case_sensitive")]
    case_sensitive: bool,

    /// Case insensitive region searching
    #[arg(long, global = true, overrides_with = "case_sensitive")]
    no_case_sensitive: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Region list URL
    #[arg(long, global = true, hide = true)]
    server_list: Option<String>,

    /// PIA root CA bundle (PEM)
    #[arg(long, global = true)]
    ca_cert: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available regions
    ShowRegions(ShowRegionsArgs),

    /// Negotiate a tunnel and write a WireGuard profile
    CreateConfig(CreateConfigArgs),
}

impl Cli {
    /// Settings file (if any) with command-line overrides applied
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_toml_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Settings::default(),
        };

        if self.no_case_sensitive {
            settings.case_sensitive = false;
        } else if self.case_sensitive {
            settings.case_sensitive = true;
        }
        if let Some(url) = &self.server_list {
            settings.server_list_url = url.clone();
        }
        if let Some(path) = &self.ca_cert {
            settings.ca_cert_path = path.clone();
        }

        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings()?;
    debug!("Settings: {:?}", settings);

    match &cli.command {
        Commands::ShowRegions(args) => commands::show_regions(&settings, args).await,
        Commands::CreateConfig(args) => commands::create_config(&settings, args).await,
    }
}

/// 2 for mistakes in what the user supplied, 1 for everything else
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<NegotiateError>() {
        Some(e) if e.is_user_error() => 2,
        _ => 1,
    }
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level(verbose)))
        .context("Failed to initialize logging filter")?;

    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            registry
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            registry
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
