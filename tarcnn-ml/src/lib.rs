//! # tarcnn-ml — training run controller
//!
//! Turns a [`tarcnn_core::RunConfig`] into a resumable optimization run:
//!
//! - **Checkpoints** — model and optimizer snapshots, resumed independently
//! - **Data feeding** — serial or bounded parallel prefetch over a collection
//! - **Schedules** — per-family step-size decay
//! - **Run loop** — the `Created → Resuming → Running → Stopped | Failed` driver

// Foundation
pub mod checkpoint;
pub mod error;

// Data
pub mod data;

// Optimization
pub mod model;
pub mod optimizer;
pub mod schedule;

// Run loop
pub mod training;

// Re-exports
pub use checkpoint::{CheckpointStore, Resumed, Snapshot};
pub use data::{Batch, DataFeeder, ExampleCollection, FeatureDirDataset, FeatureExample, LabelFilter};
pub use error::MlError;
pub use model::{LossReport, SegmentScorer, TrainableUnit};
pub use optimizer::{Optimizer, OptimizerFamily, OptimizerState, StepSizeParam};
pub use schedule::{SchedulePolicy, ScheduleRule, Shift};
pub use training::{IterationClock, RunController, RunOutcome, RunState, StopReason};
