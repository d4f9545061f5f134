//! CLI subcommand handlers.

use crate::Commands;
use crate::RunArgs;
use crate::pid::PidFile;
use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tarcnn_core::{ArtifactKind, LabelMode, OptimizerKind, RunConfig, RunIdentity};
use tarcnn_ml::{FeatureDirDataset, LabelFilter, Optimizer, RunController, SegmentScorer, TrainableUnit};
use tokio_util::sync::CancellationToken;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, args: &RunArgs) -> anyhow::Result<()> {
    match command {
        Commands::Train => train(args).await,
        Commands::Config => {
            println!("{}", resolve_config(args)?.to_toml()?);
            Ok(())
        }
        Commands::Paths => {
            print!("{}", render_paths(&resolve_config(args)?));
            Ok(())
        }
    }
}

/// Flag values layered over file and environment. Unset flags are omitted.
#[derive(Debug, Default, Serialize)]
struct Overrides {
    experiment: ExperimentOverrides,
    data: DataOverrides,
    optimizer: OptimizerOverrides,
    stop: StopOverrides,
    checkpoint: CheckpointOverrides,
    model: ModelOverrides,
    process: ProcessOverrides,
}

#[derive(Debug, Default, Serialize)]
struct ExperimentOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    split_idx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    label_mode: Option<LabelMode>,
}

#[derive(Debug, Default, Serialize)]
struct DataOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefetch: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
struct OptimizerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<OptimizerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lr: Option<f64>,
}

#[derive(Debug, Default, Serialize)]
struct StopOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    epochs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iterations: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
struct CheckpointOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    out_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval_iterations: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
struct ModelOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    feature_dim: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
struct ProcessOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pid_dir: Option<PathBuf>,
}

impl Overrides {
    fn from_args(args: &RunArgs) -> anyhow::Result<Self> {
        let kind = args
            .optimizer
            .as_deref()
            .map(str::parse::<OptimizerKind>)
            .transpose()?;
        Ok(Self {
            experiment: ExperimentOverrides {
                database: args.database.clone(),
                fold: args.fold,
                split_idx: args.split_idx,
                label_mode: args.use_paper_num_label.then_some(LabelMode::PaperReported),
            },
            data: DataOverrides {
                data_dir: args.data_dir.clone(),
                batch_size: args.batch_size,
                workers: args.proc_num,
                prefetch: args.prefetch,
                seed: args.seed,
            },
            optimizer: OptimizerOverrides { kind, lr: args.lr },
            stop: StopOverrides {
                epochs: args.epoch,
                iterations: args.iteration,
            },
            checkpoint: CheckpointOverrides {
                out_dir: args.out.clone(),
                interval_iterations: args.snapshot,
            },
            model: ModelOverrides {
                feature_dim: args.feature_dim,
                seed: args.seed,
            },
            process: ProcessOverrides {
                pid_dir: args.pid.clone(),
            },
        })
    }
}

/// Resolve defaults, config file, environment and flags into one config.
fn resolve_config(args: &RunArgs) -> anyhow::Result<RunConfig> {
    let overrides = Overrides::from_args(args)?;
    tarcnn_core::load_config(args.config.as_deref(), Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn render_paths(config: &RunConfig) -> String {
    let identity = RunIdentity::from_config(config);
    let out_dir = &config.checkpoint.out_dir;
    let mut rendered = format!("run: {identity}\n");
    rendered.push_str(&format!(
        "data: {}\n",
        config.data.data_dir.join(identity.data_subdir()).join("train").display()
    ));
    for kind in ArtifactKind::ALL {
        rendered.push_str(&format!("{kind}: {}\n", identity.artifact_path(out_dir, kind).display()));
    }
    if let Some(dir) = &config.process.pid_dir {
        rendered.push_str(&format!("pid: {}\n", dir.join(identity.pid_file_name()).display()));
    }
    rendered
}

/// Response to the `received`-th Ctrl-C of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    /// Cancel the run and let it finish the current checkpoint interval.
    Drain,
    /// Exit the process immediately.
    Abort,
}

fn on_interrupt(received: u32, shutdown: &CancellationToken) -> InterruptAction {
    if received <= 1 {
        shutdown.cancel();
        InterruptAction::Drain
    } else {
        InterruptAction::Abort
    }
}

async fn train(args: &RunArgs) -> anyhow::Result<()> {
    let config = resolve_config(args)?;
    let identity = RunIdentity::from_config(&config);
    tracing::info!(
        run = %identity,
        optimizer = %config.optimizer.kind,
        workers = config.data.workers,
        out_dir = %config.checkpoint.out_dir.display(),
        "Starting training run"
    );

    let pid_file = config
        .process
        .pid_dir
        .as_deref()
        .map(|dir| PidFile::create(dir, &identity))
        .transpose()?;
    if let Some(pid_file) = &pid_file {
        tracing::info!(path = %pid_file.path().display(), "Registered process");
    }
    std::fs::create_dir_all(&config.checkpoint.out_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.checkpoint.out_dir.display()
        )
    })?;

    let dataset = FeatureDirDataset::open(
        &config.data.data_dir,
        &identity,
        config.model.feature_dim,
        LabelFilter::from_config(&config),
    )?;
    let unit = SegmentScorer::new(
        config.model.feature_dim,
        dataset.filter().class_count(),
        config.model.seed,
    )?;
    let optimizer = Optimizer::from_config(&config.optimizer, unit.param_count());
    tracing::info!(
        split = %dataset.root().display(),
        feature_dim = unit.feature_dim(),
        classes = unit.classes(),
        weight_decay = optimizer.weight_decay(),
        "Built segment scorer"
    );
    let mut controller = RunController::new(config, unit, optimizer, Arc::new(dataset))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let pid_path = pid_file.as_ref().map(|pid| pid.path().to_path_buf());
    tokio::spawn(async move {
        let mut received = 0u32;
        while tokio::signal::ctrl_c().await.is_ok() {
            received = received.saturating_add(1);
            match on_interrupt(received, &signal) {
                InterruptAction::Drain => tracing::warn!(
                    "Interrupt received, stopping at the next checkpoint boundary (Ctrl-C again to abort)"
                ),
                InterruptAction::Abort => {
                    tracing::warn!("Second interrupt received, exiting without a final checkpoint");
                    if let Some(path) = &pid_path
                        && let Err(e) = std::fs::remove_file(path)
                    {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove PID file");
                    }
                    std::process::exit(130);
                }
            }
        }
    });

    let outcome = controller
        .run(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("Run failed in {}: {}", e.stage(), e))?;
    println!(
        "Stopped ({}) at epoch {} iteration {}; {} checkpoints written",
        outcome.reason, outcome.clock.epoch, outcome.clock.iteration, outcome.checkpoints_written
    );
    Ok(())
}
