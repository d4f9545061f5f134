//! Run configuration for tarcnn.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> CLI overrides. A [`RunConfig`] is resolved once at startup,
//! validated, and then only ever borrowed; nothing downstream mutates it.

use crate::error::{ConfigError, CoreError};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable prefix; sections are split on `__`
/// (e.g. `TARCNN_DATA__WORKERS=4`).
pub const ENV_PREFIX: &str = "TARCNN_";

/// Complete, immutable description of one training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub process: ProcessConfig,
}

/// Which label subset the run trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    /// Only the labels reported in the paper for this database.
    PaperReported,
    /// Every label present in the database.
    #[default]
    AllAvailable,
}

impl LabelMode {
    /// Token used in artifact names.
    pub fn tag(self) -> &'static str {
        match self {
            LabelMode::PaperReported => "use_paper_num_label",
            LabelMode::AllAvailable => "all_avail_label",
        }
    }
}

/// Experiment coordinates: what data this run is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Database name (BP4D, DISFA, BP4D_DISFA, ...).
    #[serde(default = "default_database")]
    pub database: String,
    /// Number of cross-validation folds.
    #[serde(default = "default_fold")]
    pub fold: u32,
    /// Which split of the fold scheme this run trains on.
    #[serde(default = "default_split_idx")]
    pub split_idx: u32,
    #[serde(default)]
    pub label_mode: LabelMode,
    /// Label ids kept under [`LabelMode::PaperReported`], in output order.
    #[serde(default)]
    pub paper_labels: Vec<u32>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            fold: default_fold(),
            split_idx: default_split_idx(),
            label_mode: LabelMode::default(),
            paper_labels: Vec::new(),
        }
    }
}

fn default_database() -> String {
    "BP4D".to_string()
}

fn default_fold() -> u32 {
    3
}

fn default_split_idx() -> u32 {
    1
}

/// Data feeding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root of the extracted feature tree.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// `1` feeds from the run loop thread; more starts a worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the prefetch buffer in parallel mode, in batches.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Shuffle seed; a fresh entropy seed is drawn when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            prefetch: default_prefetch(),
            seed: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("extract_features")
}

fn default_batch_size() -> usize {
    1
}

fn default_workers() -> usize {
    1
}

fn default_prefetch() -> usize {
    10
}

/// Optimizer families the controller knows how to build and schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// SGD with momentum.
    #[default]
    Sgd,
    #[serde(rename = "adagrad")]
    AdaGrad,
    #[serde(rename = "rmsprop")]
    RmsProp,
    Adam,
    #[serde(rename = "adadelta")]
    AdaDelta,
}

impl OptimizerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::AdaGrad => "adagrad",
            OptimizerKind::RmsProp => "rmsprop",
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdaDelta => "adadelta",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" | "momentum_sgd" | "momentumsgd" => Ok(OptimizerKind::Sgd),
            "adagrad" => Ok(OptimizerKind::AdaGrad),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "adam" => Ok(OptimizerKind::Adam),
            "adadelta" => Ok(OptimizerKind::AdaDelta),
            other => Err(ConfigError::invalid(
                "optimizer.kind",
                format!("unknown optimizer '{other}' (expected sgd, adagrad, rmsprop, adam, adadelta)"),
            )),
        }
    }
}

/// Optimizer selection and its initial step size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub kind: OptimizerKind,
    /// Initial learning rate (Adam: initial `alpha`). Ignored by AdaDelta.
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// L2 weight decay applied to every gradient.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::default(),
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
        }
    }
}

fn default_lr() -> f64 {
    0.001
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    0.0005
}

/// Step-size decay schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Unset follows the optimizer family; `true` requires a schedulable
    /// family; `false` disables decay.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default = "default_interval_epochs")]
    pub interval_epochs: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            interval_epochs: default_interval_epochs(),
            factor: default_factor(),
        }
    }
}

fn default_interval_epochs() -> u64 {
    10
}

fn default_factor() -> f64 {
    0.1
}

/// When the run stops. Whichever limit is reached first wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopConfig {
    /// `0` disables the epoch limit, leaving only `iterations`.
    #[serde(default = "default_epochs", serialize_with = "serialize_epochs")]
    pub epochs: Option<u64>,
    #[serde(default)]
    pub iterations: Option<u64>,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            iterations: None,
        }
    }
}

impl StopConfig {
    /// The epoch limit in effect, with `0` read as unset.
    pub fn epoch_limit(&self) -> Option<u64> {
        self.epochs.filter(|&epochs| epochs > 0)
    }
}

fn default_epochs() -> Option<u64> {
    Some(20)
}

// TOML has no null, so a disabled limit renders as `epochs = 0`.
fn serialize_epochs<S: serde::Serializer>(epochs: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(epochs.unwrap_or(0))
}

/// Checkpoint placement and cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Output directory for checkpoints, logs, and plots.
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    /// Snapshot model and optimizer every this many iterations.
    #[serde(default = "default_checkpoint_interval")]
    pub interval_iterations: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            interval_iterations: default_checkpoint_interval(),
        }
    }
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("end_to_end_result")
}

fn default_checkpoint_interval() -> u64 {
    1000
}

/// Log and print report cadence, in iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
    #[serde(default = "default_print_interval")]
    pub print_interval: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            log_interval: default_log_interval(),
            print_interval: default_print_interval(),
        }
    }
}

fn default_log_interval() -> u64 {
    100
}

fn default_print_interval() -> u64 {
    10
}

/// Shape of the trainable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
    /// Label count under [`LabelMode::AllAvailable`].
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    /// Parameter initialization seed.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            feature_dim: default_feature_dim(),
            num_labels: default_num_labels(),
            seed: None,
        }
    }
}

fn default_feature_dim() -> usize {
    2048
}

fn default_num_labels() -> usize {
    12
}

/// Process-level side effects, made explicit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Directory for the run's PID file; none is written when unset.
    #[serde(default)]
    pub pid_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Number of labels the model must classify (background excluded).
    pub fn class_count(&self) -> usize {
        match self.experiment.label_mode {
            LabelMode::PaperReported => self.experiment.paper_labels.len(),
            LabelMode::AllAvailable => self.model.num_labels,
        }
    }

    /// Reject configurations the run loop cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let db = &self.experiment.database;
        if db.is_empty() {
            return Err(ConfigError::invalid("experiment.database", "must not be empty"));
        }
        if !db
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::invalid(
                "experiment.database",
                format!("'{db}' may only contain ASCII letters, digits, '_' and '-'"),
            ));
        }
        if self.experiment.label_mode == LabelMode::PaperReported
            && self.experiment.paper_labels.is_empty()
        {
            return Err(ConfigError::invalid(
                "experiment.paper_labels",
                "paper_reported label mode needs at least one label",
            ));
        }

        nonzero("data.batch_size", self.data.batch_size as u64)?;
        nonzero("data.workers", self.data.workers as u64)?;
        nonzero("data.prefetch", self.data.prefetch as u64)?;
        nonzero("checkpoint.interval_iterations", self.checkpoint.interval_iterations)?;
        nonzero("schedule.interval_epochs", self.schedule.interval_epochs)?;
        nonzero("report.log_interval", self.report.log_interval)?;
        nonzero("report.print_interval", self.report.print_interval)?;
        nonzero("model.feature_dim", self.model.feature_dim as u64)?;
        if self.class_count() == 0 {
            return Err(ConfigError::invalid("model.num_labels", "must be at least 1"));
        }

        if !(self.optimizer.lr.is_finite() && self.optimizer.lr > 0.0) {
            return Err(ConfigError::invalid(
                "optimizer.lr",
                format!("{} is not a positive finite rate", self.optimizer.lr),
            ));
        }
        if !(self.optimizer.weight_decay.is_finite() && self.optimizer.weight_decay >= 0.0) {
            return Err(ConfigError::invalid(
                "optimizer.weight_decay",
                "must be a finite non-negative number",
            ));
        }
        let factor = self.schedule.factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(ConfigError::invalid(
                "schedule.factor",
                format!("{factor} is outside (0, 1]"),
            ));
        }

        match (self.stop.epoch_limit(), self.stop.iterations) {
            (None, None) => Err(ConfigError::invalid(
                "stop",
                "set at least one of stop.epochs or stop.iterations",
            )),
            (_, Some(0)) => Err(ConfigError::invalid("stop.iterations", "must be at least 1")),
            _ => Ok(()),
        }
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::invalid(field, "must be at least 1"))
    } else {
        Ok(())
    }
}

/// Load configuration from layered sources and validate it.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (unset fields must be skipped when serializing)
/// 2. Environment variables (prefixed with `TARCNN_`)
/// 3. The config file, when given
/// 4. Built-in defaults
pub fn load_config<O: Serialize>(
    config_file: Option<&Path>,
    overrides: Option<&O>,
) -> Result<RunConfig, CoreError> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::invalid(
                "config",
                format!("config file {} does not exist", path.display()),
            )
            .into());
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let mut config: RunConfig = figment
        .extract()
        .map_err(|e| ConfigError::Load(Box::new(e)))?;
    config.stop.epochs = config.stop.epoch_limit();
    config.validate()?;
    tracing::debug!(
        database = %config.experiment.database,
        fold = config.experiment.fold,
        split_idx = config.experiment.split_idx,
        optimizer = %config.optimizer.kind,
        "Resolved run configuration"
    );
    Ok(config)
}
