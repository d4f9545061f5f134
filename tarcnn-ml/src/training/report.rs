//! Run reporting: the periodic JSON log report and the print report.

use crate::error::MlError;
use crate::model::LossReport;
use crate::training::clock::IterationClock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tarcnn_core::ArtifactKind;
use tarcnn_core::config::ReportConfig;
use tarcnn_core::persistence::{atomic_write_json, load_json};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy)]
struct Mean {
    sum: f64,
    count: u64,
}

/// Accumulates loss reports and emits log entries and print lines on cadence.
///
/// The log file is a JSON array. Entries present when the reporter is
/// created are kept, so a resumed run appends to its predecessor's log.
#[derive(Debug)]
pub struct RunReporter {
    log_path: PathBuf,
    log_interval: u64,
    print_interval: u64,
    session_id: Uuid,
    started: Instant,
    entries: Vec<Value>,
    window: BTreeMap<String, Mean>,
}

impl RunReporter {
    pub fn new(log_path: impl Into<PathBuf>, config: &ReportConfig) -> Self {
        let log_path = log_path.into();
        let entries = match load_json::<Vec<Value>>(&log_path) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %log_path.display(), error = %e, "Unreadable log report, starting a new one");
                Vec::new()
            }
        };
        Self {
            log_path,
            log_interval: config.log_interval,
            print_interval: config.print_interval,
            session_id: Uuid::new_v4(),
            started: Instant::now(),
            entries,
            window: BTreeMap::new(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    /// Record one step's report at the already advanced `clock`.
    pub fn observe(
        &mut self,
        clock: &IterationClock,
        report: &LossReport,
        step_size: Option<f64>,
    ) -> Result<(), MlError> {
        for (name, &value) in &report.components {
            let mean = self.window.entry(name.clone()).or_default();
            mean.sum += value;
            mean.count += 1;
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        if clock.hits_iteration(self.print_interval) {
            tracing::info!(
                epoch = clock.epoch,
                iteration = clock.iteration,
                elapsed_time = elapsed,
                lr = step_size,
                loss = report.loss,
                components = ?report.components,
                "Training progress"
            );
        }
        if clock.hits_iteration(self.log_interval) {
            self.flush_entry(clock, elapsed, step_size)?;
        }
        Ok(())
    }

    fn flush_entry(&mut self, clock: &IterationClock, elapsed: f64, step_size: Option<f64>) -> Result<(), MlError> {
        let mut entry = Map::new();
        entry.insert("epoch".into(), clock.epoch.into());
        entry.insert("iteration".into(), clock.iteration.into());
        entry.insert("elapsed_time".into(), elapsed.into());
        if let Some(lr) = step_size {
            entry.insert("lr".into(), lr.into());
        }
        for (name, mean) in std::mem::take(&mut self.window) {
            if mean.count > 0 {
                entry.insert(format!("main/{name}"), (mean.sum / mean.count as f64).into());
            }
        }
        entry.insert("session".into(), self.session_id.to_string().into());
        self.entries.push(Value::Object(entry));

        atomic_write_json(&self.log_path, &self.entries).map_err(|source| MlError::CheckpointWrite {
            kind: ArtifactKind::Log,
            path: self.log_path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.log_path.display(), entries = self.entries.len(), "Wrote log report");
        Ok(())
    }
}
