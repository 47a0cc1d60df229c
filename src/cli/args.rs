//! CLI argument definitions using clap derive

use crate::config::schema::BackendKind;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// vaultd - per-user vault storage server
///
/// Keeps each user's vault pages in memory, saves changes behind the
/// scenes and persists them to JSON files or SQLite.
#[derive(Parser, Debug)]
#[command(name = "vaultd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "VAULTD_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve vault sessions, reading commands from stdin
    Serve(ServeArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Data directory (overrides general.data_dir)
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Storage backend (overrides storage.backend)
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendKind>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
