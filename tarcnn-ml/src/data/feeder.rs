//! Infinite, reshuffling batch feeder in serial or parallel mode.
//!
//! Both modes draw index batches from one [`EpochSampler`], so for a given
//! seed they yield the same batches in the same order.
//!
//! # Parallel mode
//!
//! A planner task walks the sampler in order. For each batch it first queues
//! a `oneshot::Receiver` slot in a bounded channel of capacity `prefetch`,
//! then hands the decode job to a blocking worker once a permit from a
//! `workers`-sized semaphore is free. The consumer pops slots in queue order,
//! so batches are never reordered. At most `prefetch` slots are queued, which
//! bounds the number of prepared but unconsumed batches. A worker that panics
//! drops its sender; the consumer reports that as [`MlError::Feeder`].

use crate::data::batch::{Batch, collate};
use crate::data::example::ExampleCollection;
use crate::error::MlError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tarcnn_core::config::DataConfig;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Slot = oneshot::Receiver<Result<Batch, MlError>>;

/// Cuts successive random permutations of `0..len` into batches.
#[derive(Debug)]
pub struct EpochSampler {
    len: usize,
    batch_size: usize,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl EpochSampler {
    pub fn new(len: usize, batch_size: usize, seed: Option<u64>) -> Result<Self, MlError> {
        if len == 0 {
            return Err(MlError::dataset("example collection is empty"));
        }
        if batch_size == 0 {
            return Err(MlError::feeder("batch size must be positive"));
        }
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            len,
            batch_size,
            rng,
            order,
            cursor: 0,
        })
    }

    /// Batches per epoch.
    pub fn batches_per_epoch(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    /// Next batch of indices and whether it completes the current permutation.
    pub fn next_indices(&mut self) -> (Vec<usize>, bool) {
        let end = (self.cursor + self.batch_size).min(self.len);
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        let crosses = self.cursor == self.len;
        if crosses {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        (indices, crosses)
    }
}

fn assemble<C: ExampleCollection + ?Sized>(
    collection: &C,
    indices: Vec<usize>,
    crosses_epoch: bool,
) -> Result<Batch, MlError> {
    let examples = indices
        .iter()
        .map(|&i| collection.get(i))
        .collect::<Result<Vec<_>, _>>()?;
    collate(examples, indices, crosses_epoch)
}

/// Decodes each batch on the caller's thread.
pub struct SerialFeeder<C> {
    collection: Arc<C>,
    sampler: EpochSampler,
}

impl<C: ExampleCollection> SerialFeeder<C> {
    pub fn new(collection: Arc<C>, sampler: EpochSampler) -> Self {
        Self { collection, sampler }
    }

    pub fn next_batch(&mut self) -> Result<Batch, MlError> {
        let (indices, crosses) = self.sampler.next_indices();
        assemble(&*self.collection, indices, crosses)
    }
}

/// Prefetches batches on a bounded pool of blocking workers.
pub struct ParallelFeeder {
    slots: mpsc::Receiver<Slot>,
    pending: Option<Slot>,
    cancel: CancellationToken,
    planner: JoinHandle<()>,
}

impl ParallelFeeder {
    /// Start the planner. Must be called from within a tokio runtime.
    pub fn start<C: ExampleCollection>(
        collection: Arc<C>,
        sampler: EpochSampler,
        workers: usize,
        capacity: usize,
    ) -> Result<Self, MlError> {
        if workers == 0 || capacity == 0 {
            return Err(MlError::feeder(format!(
                "parallel feeder needs workers > 0 and capacity > 0, got {workers} and {capacity}"
            )));
        }
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let planner = tokio::spawn(plan(
            collection,
            sampler,
            tx,
            Arc::new(Semaphore::new(workers)),
            cancel.clone(),
        ));
        Ok(Self {
            slots: rx,
            pending: None,
            cancel,
            planner,
        })
    }

    /// Wait for the next batch in plan order.
    ///
    /// Cancel-safe: a batch awaited by a dropped call is returned by the next one.
    pub async fn next_batch(&mut self) -> Result<Batch, MlError> {
        if self.pending.is_none() {
            let slot = self
                .slots
                .recv()
                .await
                .ok_or_else(|| MlError::feeder("batch planner stopped"))?;
            self.pending = Some(slot);
        }
        let Some(slot) = self.pending.as_mut() else {
            return Err(MlError::feeder("no batch pending"));
        };
        let result = slot.await;
        self.pending = None;
        result.map_err(|_| MlError::feeder("worker exited before delivering its batch"))?
    }
}

impl Drop for ParallelFeeder {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.planner.abort();
    }
}

async fn plan<C: ExampleCollection>(
    collection: Arc<C>,
    mut sampler: EpochSampler,
    slots: mpsc::Sender<Slot>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let (indices, crosses) = sampler.next_indices();
        let (tx, rx) = oneshot::channel();

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = slots.send(rx) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let collection = Arc::clone(&collection);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _ = tx.send(assemble(&*collection, indices, crosses));
        });
    }
    tracing::debug!("Batch planner stopped");
}

/// Feeder mode as a function of the configured worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederMode {
    Serial,
    Parallel { workers: usize },
}

impl FeederMode {
    pub fn from_workers(workers: usize) -> Result<Self, MlError> {
        match workers {
            0 => Err(MlError::config("data.workers must be at least 1")),
            1 => Ok(FeederMode::Serial),
            n => Ok(FeederMode::Parallel { workers: n }),
        }
    }
}

/// The feeder the run loop pulls from.
pub enum DataFeeder<C> {
    Serial(SerialFeeder<C>),
    Parallel(ParallelFeeder),
}

impl<C: ExampleCollection> DataFeeder<C> {
    /// Build the feeder `config` selects. Parallel mode must start inside a runtime.
    pub fn start(collection: Arc<C>, config: &DataConfig) -> Result<Self, MlError> {
        let sampler = EpochSampler::new(collection.len(), config.batch_size, config.seed)?;
        let mode = FeederMode::from_workers(config.workers)?;
        tracing::info!(
            ?mode,
            examples = collection.len(),
            batch_size = config.batch_size,
            batches_per_epoch = sampler.batches_per_epoch(),
            prefetch = config.prefetch,
            "Starting data feeder"
        );
        Ok(match mode {
            FeederMode::Serial => DataFeeder::Serial(SerialFeeder::new(collection, sampler)),
            FeederMode::Parallel { workers } => DataFeeder::Parallel(ParallelFeeder::start(
                collection,
                sampler,
                workers,
                config.prefetch,
            )?),
        })
    }

    pub fn mode(&self) -> &'static str {
        match self {
            DataFeeder::Serial(_) => "serial",
            DataFeeder::Parallel(_) => "parallel",
        }
    }

    pub async fn next_batch(&mut self) -> Result<Batch, MlError> {
        match self {
            DataFeeder::Serial(feeder) => feeder.next_batch(),
            DataFeeder::Parallel(feeder) => feeder.next_batch().await,
        }
    }
}
