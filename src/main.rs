use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;

use vyomtun::config::parse_config;
use vyomtun::Engine;

#[derive(Parser)]
#[command(name = "vyomtun", version, about = "Userspace tunnel engine tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate an engine config file without starting anything.
    Validate {
        /// Path to the JSON config.
        #[arg(short, long)]
        config: PathBuf,
        /// Directory holding rule asset files (ip lists).
        #[arg(short, long)]
        assets: Option<PathBuf>,
    },
}

/// RUST_LOG wins; otherwise the config's `log.level` is the default,
/// falling back to "info" when the config cannot be parsed.
fn init_logging(config_text: &str) {
    let default_level = parse_config(config_text)
        .map(|c| c.log.level)
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config, assets } => {
            let text = match std::fs::read_to_string(&config) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("cannot read {}: {}", config.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            init_logging(&text);
            match Engine::validate(&text, assets.as_deref()) {
                None => {
                    info!(config = %config.display(), "config is valid");
                    ExitCode::SUCCESS
                }
                Some(message) => {
                    eprintln!("invalid config: {}", message);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
