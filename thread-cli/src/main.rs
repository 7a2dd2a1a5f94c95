//! # threadsync
//!
//! CLI tool for inspecting threadsync conversations.
//!
//! Both commands load a JSON conversation fixture into an in-memory server
//! and drive the real sync engine against it.
//!
//! ## Commands
//!
//! - `inspect`: Print the reconstructed reply tree
//! - `replay`: Step through playback positions
//!
//! ## Example
//!
//! ```bash
//! # Show the thread after applying the fixture's channel events
//! threadsync inspect fixtures/design-review.json
//!
//! # Reveal the first three messages, paging two at a time
//! threadsync --page-size 2 replay fixtures/design-review.json --upto 2
//!
//! # Verbose engine logs
//! RUST_LOG=threadsync_client=debug threadsync inspect fixtures/design-review.json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use threadsync_client::EngineConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod fixture;

use commands::{inspect, replay};

/// CLI tool for inspecting threadsync conversations.
#[derive(Parser, Debug)]
#[command(name = "threadsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the number of messages fetched per page
    #[arg(long, global = true)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the reconstructed reply tree of a fixture
    Inspect {
        /// Conversation fixture (JSON)
        fixture: PathBuf,
    },

    /// Replay a fixture one message at a time
    Replay {
        /// Conversation fixture (JSON)
        fixture: PathBuf,

        /// Last playback position to reveal (default: all)
        #[arg(long)]
        upto: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = load_config(cli.config.as_deref(), cli.page_size)?;

    match cli.command {
        Commands::Inspect { fixture } => {
            inspect::run(&fixture, config).await?;
        }
        Commands::Replay { fixture, upto } => {
            replay::run(&fixture, upto, config).await?;
        }
    }

    Ok(())
}

/// Log to stderr, filtered by `RUST_LOG` (default: info).
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Engine configuration from `path` (or defaults), with CLI overrides.
fn load_config(path: Option<&Path>, page_size: Option<u32>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(path).context("Failed to load configuration")?,
        None => EngineConfig::default(),
    };
    if let Some(page_size) = page_size {
        config.sync.page_size = page_size;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_replay_with_global_flags() {
        let cli = Cli::parse_from([
            "threadsync",
            "replay",
            "conv.json",
            "--upto",
            "3",
            "--page-size",
            "2",
        ]);
        assert_eq!(cli.page_size, Some(2));
        match cli.command {
            Commands::Replay { fixture, upto } => {
                assert_eq!(fixture, PathBuf::from("conv.json"));
                assert_eq!(upto, Some(3));
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn defaults_without_config_file() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.sync.page_size, 50);
    }

    #[test]
    fn page_size_flag_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[sync]\npage_size = 10\nsettle_window_ms = 200\n").unwrap();

        let from_file = load_config(Some(&path), None).unwrap();
        assert_eq!(from_file.sync.page_size, 10);
        assert_eq!(from_file.sync.settle_window_ms, 200);

        let overridden = load_config(Some(&path), Some(3)).unwrap();
        assert_eq!(overridden.sync.page_size, 3);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml")), None).is_err());
    }
}
