//! The run loop and its clock, stopping conditions and reporting.

pub mod clock;
pub mod report;
pub mod runner;

pub use clock::{IterationClock, StopCondition, StopReason};
pub use report::RunReporter;
pub use runner::{RunController, RunOutcome, RunState};
