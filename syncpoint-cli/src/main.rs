//! # syncpoint
//!
//! CLI tool for exercising the Syncpoint pairing client.
//!
//! ## Commands
//!
//! - `demo`: Pair against a simulated server and install channels
//! - `check-config`: Load and validate a client configuration file
//!
//! ## Example
//!
//! ```bash
//! # Full lifecycle with two channels
//! syncpoint demo --token my-token --channel notes --channel journal
//!
//! # Same, with settings from a file
//! syncpoint --config client.toml demo --token my-token
//!
//! # Validate a configuration file
//! syncpoint check-config client.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{check, demo};

/// CLI tool for exercising the Syncpoint pairing client.
#[derive(Parser, Debug)]
#[command(name = "syncpoint")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Client configuration file (TOML); defaults are used if omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pair against a simulated server and install channels
    Demo {
        /// OAuth token to pair with
        #[arg(long, short)]
        token: String,

        /// Token type
        #[arg(long, default_value = "oauth")]
        token_type: String,

        /// Channel to install (repeatable)
        #[arg(long = "channel", short)]
        channels: Vec<String>,

        /// User id the simulated server assigns
        #[arg(long, default_value = "u1")]
        user_id: String,
    },

    /// Load and validate a client configuration file
    CheckConfig {
        /// Path to the TOML file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            token,
            token_type,
            channels,
            user_id,
        } => {
            let config = commands::load_config(cli.config.as_deref())?;
            let options = demo::DemoOptions {
                token,
                token_type,
                channels,
                user_id,
            };
            demo::run(config, &options).await?;
        }
        Commands::CheckConfig { path } => {
            check::run(&path)?;
        }
    }

    Ok(())
}

/// Log to stderr, filtered by `RUST_LOG` (default: info).
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn demo_collects_repeated_channels() {
        let cli = Cli::parse_from([
            "syncpoint",
            "demo",
            "--token",
            "tok",
            "--channel",
            "notes",
            "-c",
            "journal",
        ]);
        match cli.command {
            Commands::Demo {
                token,
                token_type,
                channels,
                user_id,
            } => {
                assert_eq!(token, "tok");
                assert_eq!(token_type, "oauth");
                assert_eq!(channels, vec!["notes", "journal"]);
                assert_eq!(user_id, "u1");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["syncpoint", "demo", "-t", "tok", "--config", "client.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("client.toml")));
    }
}
