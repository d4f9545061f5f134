//! tarcnn — command-line driver for resumable Time-Axis R-CNN training runs.
//!
//! `tarcnn` (or `tarcnn train`) resolves the run configuration, resumes any
//! checkpoints for the run identity and trains until a stop condition or Ctrl-C.

mod commands;
mod pid;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Train a Time-Axis R-CNN fold/split with resumable checkpoints
#[derive(Parser, Debug)]
#[command(name = "tarcnn", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand (defaults to `train`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run or resume training
    Train,
    /// Print the resolved configuration as TOML
    Config,
    /// Print the artifact paths of the run identity
    Paths,
}

/// Run configuration sources. Flags override `TARCNN_*` variables, which
/// override the config file.
#[derive(clap::Args, Debug, Clone, Default)]
struct RunArgs {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database name, e.g. BP4D or DISFA
    #[arg(long, global = true)]
    database: Option<String>,

    /// Number of cross-validation folds
    #[arg(long, global = true)]
    fold: Option<u32>,

    /// Split index within the folds
    #[arg(long, global = true)]
    split_idx: Option<u32>,

    /// Train only on the paper-reported label subset
    #[arg(long, global = true)]
    use_paper_num_label: bool,

    /// Root directory of the extracted feature folds
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Examples per batch
    #[arg(short, long, global = true)]
    batch_size: Option<usize>,

    /// Feeder worker count; 1 feeds serially
    #[arg(long, global = true)]
    proc_num: Option<usize>,

    /// Prefetch buffer capacity in parallel mode
    #[arg(long, global = true)]
    prefetch: Option<usize>,

    /// Optimizer: sgd, adagrad, rmsprop, adam, adadelta
    #[arg(long, global = true)]
    optimizer: Option<String>,

    /// Initial learning rate (Adam: alpha)
    #[arg(long, global = true)]
    lr: Option<f64>,

    /// Stop after this many epochs; 0 disables the epoch limit
    #[arg(short, long, global = true)]
    epoch: Option<u64>,

    /// Stop after this many iterations
    #[arg(long, global = true)]
    iteration: Option<u64>,

    /// Checkpoint every N iterations
    #[arg(long, global = true)]
    snapshot: Option<u64>,

    /// Output directory for checkpoints and reports
    #[arg(short, long, global = true)]
    out: Option<PathBuf>,

    /// Per-frame feature dimension
    #[arg(long, global = true)]
    feature_dim: Option<usize>,

    /// Directory for the run's PID file
    #[arg(long, global = true)]
    pid: Option<PathBuf>,

    /// Seed for shuffling and parameter initialisation
    #[arg(long, global = true)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "tarcnn", "tarcnn")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tarcnn.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let command = cli.command.unwrap_or(Commands::Train);
    commands::handle_command(command, &cli.run).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_train() {
        let cli = Cli::try_parse_from(["tarcnn"]).unwrap();
        assert_eq!(cli.command, None);
        assert!(!cli.run.use_paper_num_label);
    }

    #[test]
    fn test_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tarcnn",
            "paths",
            "--database",
            "DISFA",
            "--fold",
            "10",
            "--use-paper-num-label",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Commands::Paths));
        assert_eq!(cli.run.database.as_deref(), Some("DISFA"));
        assert_eq!(cli.run.fold, Some(10));
        assert!(cli.run.use_paper_num_label);
        assert_eq!(cli.verbose, 2);
    }
}
