//! vaultd - per-user vault storage server
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vaultkeep::cli::{Cli, Commands};
use vaultkeep::config::ConfigManager;
use vaultkeep::VaultResult;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> VaultResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Parse before logging starts so the log format can come from the file;
    // validation runs after so its warnings are not lost
    let config = config_manager.load_raw().await?;
    init_logging(cli.verbose, &config.general.log_format);
    let config = config.validated();
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Serve(args) => vaultkeep::cli::commands::serve(args, &config).await,
        Commands::Config(args) => {
            vaultkeep::cli::commands::config(args, &config_manager, &config).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug. Logs go to stderr; stdout carries output.
fn init_logging(verbose: u8, format: &str) {
    let filter = match verbose {
        0 => EnvFilter::new("vaultkeep=warn"),
        1 => EnvFilter::new("vaultkeep=info"),
        _ => EnvFilter::new("vaultkeep=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
