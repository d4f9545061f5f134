//! Run loop: resume, feed, step, schedule, checkpoint, report, stop.

use crate::checkpoint::CheckpointStore;
use crate::data::example::ExampleCollection;
use crate::data::feeder::DataFeeder;
use crate::error::MlError;
use crate::model::{LossReport, TrainableUnit};
use crate::optimizer::OptimizerState;
use crate::schedule::SchedulePolicy;
use crate::training::clock::{IterationClock, StopCondition, StopReason};
use crate::training::report::RunReporter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tarcnn_core::{ArtifactKind, CoreError, RunConfig, RunIdentity};
use tokio_util::sync::CancellationToken;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RunState {
    Created,
    Resuming,
    Running,
    Stopped(StopReason),
    Failed,
}

/// Summary of a run that reached `Stopped`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub reason: StopReason,
    pub clock: IterationClock,
    /// Checkpoint triggers fired by this process (model and optimizer each).
    pub checkpoints_written: u64,
    pub last_loss: Option<LossReport>,
}

/// Drives one training run over an exclusively owned unit and optimizer.
pub struct RunController<U, O, C> {
    config: RunConfig,
    unit: U,
    optimizer: O,
    collection: Arc<C>,
    store: CheckpointStore,
    schedule: SchedulePolicy,
    stop: StopCondition,
    clock: IterationClock,
    state: RunState,
}

impl<U, O, C> RunController<U, O, C>
where
    U: TrainableUnit,
    O: OptimizerState,
    C: ExampleCollection,
{
    /// Bind a unit and its optimizer to a validated config.
    pub fn new(config: RunConfig, unit: U, optimizer: O, collection: Arc<C>) -> Result<Self, MlError> {
        config.validate().map_err(CoreError::from)?;
        if unit.param_count() != optimizer.param_count() {
            return Err(MlError::optimizer(format!(
                "optimizer is bound to {} parameters but the unit has {}",
                optimizer.param_count(),
                unit.param_count()
            )));
        }
        let identity = RunIdentity::from_config(&config);
        let store = CheckpointStore::new(config.checkpoint.out_dir.clone(), identity);
        let schedule = SchedulePolicy::for_family(optimizer.family(), &config.schedule)?;
        let stop = StopCondition::from_config(&config.stop);

        Ok(Self {
            config,
            unit,
            optimizer,
            collection,
            store,
            schedule,
            stop,
            clock: IterationClock::new(),
            state: RunState::Created,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn clock(&self) -> IterationClock {
        self.clock
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn unit(&self) -> &U {
        &self.unit
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn into_parts(self) -> (U, O) {
        (self.unit, self.optimizer)
    }

    /// Resume model and optimizer independently. Missing files are a cold start.
    pub fn resume(&mut self) -> Result<(), MlError> {
        self.transition(RunState::Resuming);
        let resumed = self.try_resume();
        if resumed.is_err() {
            self.transition(RunState::Failed);
        }
        resumed
    }

    fn try_resume(&mut self) -> Result<(), MlError> {
        let model = self.store.try_resume_model(&mut self.unit)?;
        let optimizer = self.store.try_resume_optimizer(&mut self.optimizer)?;
        if let (Some(m), Some(o)) = (&model, &optimizer)
            && m.clock != o.clock
        {
            tracing::warn!(
                model = %m.clock,
                optimizer = %o.clock,
                "Model and optimizer checkpoints disagree on the clock, using the model's"
            );
        }
        self.clock = model.or(optimizer).map(|r| r.clock).unwrap_or_default();
        Ok(())
    }

    /// Run until a stop condition, cancellation, or a fatal error.
    ///
    /// Resumes first if [`resume`](Self::resume) has not been called. After
    /// `shutdown` fires the loop keeps stepping to the next checkpoint
    /// boundary, then stops with [`StopReason::Cancelled`].
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<RunOutcome, MlError> {
        if self.state == RunState::Created {
            self.resume()?;
        }
        if self.state != RunState::Resuming {
            return Err(MlError::training(format!("cannot run from state {:?}", self.state)));
        }

        match self.run_loop(shutdown).await {
            Ok(outcome) => {
                self.transition(RunState::Stopped(outcome.reason));
                tracing::info!(
                    reason = %outcome.reason,
                    epoch = outcome.clock.epoch,
                    iteration = outcome.clock.iteration,
                    checkpoints = outcome.checkpoints_written,
                    "Run stopped"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.transition(RunState::Failed);
                tracing::error!(stage = e.stage(), error = %e, clock = %self.clock, "Run failed");
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self, shutdown: CancellationToken) -> Result<RunOutcome, MlError> {
        self.transition(RunState::Running);
        let mut written = 0;
        let mut last_loss = None;

        if let Some(reason) = self.stop.check(&self.clock) {
            tracing::info!(clock = %self.clock, "Restored clock is already past the stop condition");
            return Ok(self.outcome(reason, written, last_loss));
        }

        let interval = self.config.checkpoint.interval_iterations;
        let mut reporter = RunReporter::new(self.store.path(ArtifactKind::Log), &self.config.report);
        tracing::debug!(
            path = %reporter.log_path().display(),
            entries = reporter.entries().len(),
            "Opened log report"
        );
        let mut feeder = DataFeeder::start(Arc::clone(&self.collection), &self.config.data)?;

        let reason = loop {
            if shutdown.is_cancelled() && self.clock.on_boundary(interval) {
                break StopReason::Cancelled;
            }

            let batch = feeder.next_batch().await?;
            let report = self.unit.step(&batch, &mut self.optimizer)?;
            self.clock.advance(batch.crosses_epoch);

            self.schedule
                .on_iteration(&self.clock, batch.crosses_epoch, &mut self.optimizer)?;

            if self.clock.hits_iteration(interval) {
                self.store.save_model(&self.unit, self.clock)?;
                self.store.save_optimizer(&self.optimizer, self.clock)?;
                written += 1;
                tracing::info!(
                    epoch = self.clock.epoch,
                    iteration = self.clock.iteration,
                    dir = %self.config.checkpoint.out_dir.display(),
                    "Wrote checkpoint"
                );
            }

            reporter.observe(&self.clock, &report, self.optimizer.family().step_size())?;
            last_loss = Some(report);

            if let Some(reason) = self.stop.check(&self.clock) {
                break reason;
            }
        };
        Ok(self.outcome(reason, written, last_loss))
    }

    fn outcome(&self, reason: StopReason, checkpoints_written: u64, last_loss: Option<LossReport>) -> RunOutcome {
        RunOutcome {
            reason,
            clock: self.clock,
            checkpoints_written,
            last_loss,
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(from = ?self.state, to = ?next, "Run state");
        self.state = next;
    }
}
