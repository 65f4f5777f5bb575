//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for HookRelay.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser, Debug, Clone)]
#[command(name = "hookrelay")]
#[command(about = "HookRelay local event listener")]
#[command(
    long_about = "Streams events from a relay server and forwards them to a service running on this machine"
)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (defaults to ~/.hookrelay/config.toml)
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start a websocket client that listens to events streamed by the relay
    Listen(ListenArgs),

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ListenArgs {
    /// The host/web server you want to forward events to
    #[arg(long)]
    pub forward_to: String,

    /// The source id of the source you want to receive events from (only applies to incoming projects)
    #[arg(long)]
    pub source: Option<String>,

    /// Resend discarded events since a timestamp (e.g. 2013-01-02T13:23:37Z) or relative time (e.g. 42m for 42 minutes)
    #[arg(long)]
    pub since: Option<String>,

    /// Sign forwarded bodies with the configured signature secret
    #[arg(long)]
    pub signed: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Print the configuration file location
    Path,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Resolved configuration file path
    pub fn config_path(&self) -> PathBuf {
        self.config_file.clone().unwrap_or_else(Config::default_path)
    }

    /// Level requested on the command line, if any
    pub fn effective_log_level(&self) -> Option<String> {
        if self.verbose {
            Some("debug".to_string())
        } else {
            self.log_level.clone()
        }
    }
}
