//! # tarcnn-core
//!
//! Foundation for the tarcnn training controller: the immutable run
//! configuration and its layered loader, the run identity that names every
//! artifact, and the atomic persistence helpers checkpoints are written with.

pub mod config;
pub mod error;
pub mod identity;
pub mod persistence;

// Re-export commonly used types at the crate root.
pub use config::{LabelMode, OptimizerKind, RunConfig, load_config};
pub use error::{ConfigError, CoreError, Result};
pub use identity::{ArtifactKind, RunIdentity, identity};
