//! Forgetful CLI: train, prune, export and run the InceptionV3 classifier.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Forgetful: transfer learning, pruning and mobile export
#[derive(Parser, Debug)]
#[command(name = "forgetful", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Load the data, build the model and fine-tune it
    Train,
    /// Fine-tune under low-magnitude pruning and export the result
    Prune {
        /// Target sparsity in [0, 1)
        #[arg(short, long)]
        factor: f64,
        /// Start from these weights instead of a fresh build
        #[arg(short, long)]
        weights: Option<PathBuf>,
    },
    /// Export already-pruned weights to the mobile format
    Export {
        /// Pruned weights record
        #[arg(short, long)]
        weights: PathBuf,
        /// Sparsity the weights were pruned to
        #[arg(short, long)]
        factor: f64,
    },
    /// Classify the test split
    Predict {
        /// Weights record
        #[arg(short, long)]
        weights: PathBuf,
        /// Print predictions as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Score the test split
    Evaluate {
        /// Weights record
        #[arg(short, long)]
        weights: PathBuf,
    },
    /// Print the layer summary of the built model
    Summary,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write the default configuration to a file
    Init {
        /// Destination file
        #[arg(default_value = "forgetful.toml")]
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "forgetful", "forgetful")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "forgetful.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    tracing::debug!(backend = forgetful_ml::backend_name(), "Starting");
    commands::handle_command(cli.command, cli.config.as_deref())
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
    fn parses_prune_with_optional_weights() {
        let cli = Cli::try_parse_from(["forgetful", "-v", "prune", "--factor", "0.5"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Prune { factor, weights } => {
                assert_eq!(factor, 0.5);
                assert!(weights.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn export_requires_weights_and_factor() {
        assert!(Cli::try_parse_from(["forgetful", "export", "--factor", "0.5"]).is_err());
        let cli = Cli::try_parse_from([
            "forgetful", "export", "--weights", "pruned.mpk", "--factor", "0.25",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Export { factor, .. } if factor == 0.25));
    }

    #[test]
    fn config_flag_is_global() {
        let cli =
            Cli::try_parse_from(["forgetful", "summary", "--config", "celeba.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("celeba.toml")));
    }
}
