//! Parallel feeder behaviour under slow consumers, slow producers and crashes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tarcnn_ml::MlError;
use tarcnn_ml::data::{EpochSampler, ExampleCollection, FeatureExample, ParallelFeeder, SerialFeeder};
use tokio_test::{assert_pending, task};

struct Probe {
    len: usize,
    delay: Duration,
    produced: AtomicUsize,
    panic_on: Option<usize>,
}

impl Probe {
    fn new(len: usize) -> Self {
        Self {
            len,
            delay: Duration::ZERO,
            produced: AtomicUsize::new(0),
            panic_on: None,
        }
    }
}

impl ExampleCollection for Probe {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<FeatureExample, MlError> {
        if self.panic_on == Some(index) {
            panic!("decoder crashed on example {index}");
        }
        std::thread::sleep(self.delay);
        self.produced.fetch_add(1, Ordering::SeqCst);
        FeatureExample::from_rows(vec![vec![index as f32]], vec![])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backpressure_bounds_prepared_batches() {
    const CAPACITY: usize = 3;
    let probe = Arc::new(Probe::new(10));
    let sampler = EpochSampler::new(10, 1, Some(1)).unwrap();
    let mut feeder = ParallelFeeder::start(Arc::clone(&probe), sampler, 2, CAPACITY).unwrap();

    let mut consumed = 0;
    let mut max_ahead = 0;
    for _ in 0..25 {
        feeder.next_batch().await.unwrap();
        consumed += 1;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let ahead = probe.produced.load(Ordering::SeqCst) - consumed;
        assert!(ahead <= CAPACITY, "{ahead} batches prepared ahead of the consumer");
        max_ahead = max_ahead.max(ahead);
    }
    assert_eq!(max_ahead, CAPACITY);
}

#[tokio::test]
async fn consumer_waits_for_slow_worker() {
    let probe = Arc::new(Probe {
        delay: Duration::from_millis(200),
        ..Probe::new(2)
    });
    let sampler = EpochSampler::new(2, 1, Some(0)).unwrap();
    let mut feeder = ParallelFeeder::start(probe, sampler, 1, 2).unwrap();

    {
        let mut next = task::spawn(feeder.next_batch());
        assert_pending!(next.poll());
    }

    let batch = feeder.next_batch().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert!(!batch.features.is_empty());
}

#[tokio::test]
async fn parallel_order_matches_serial_across_epochs() {
    let probe = Arc::new(Probe::new(7));
    let mut serial = SerialFeeder::new(Arc::clone(&probe), EpochSampler::new(7, 3, Some(9)).unwrap());
    let mut parallel =
        ParallelFeeder::start(Arc::clone(&probe), EpochSampler::new(7, 3, Some(9)).unwrap(), 4, 2).unwrap();

    let mut crossings = 0;
    for _ in 0..12 {
        let expected = serial.next_batch().unwrap();
        let got = parallel.next_batch().await.unwrap();
        crossings += usize::from(got.crosses_epoch);
        assert_eq!(got.indices, expected.indices);
        assert_eq!(got.crosses_epoch, expected.crosses_epoch);
    }
    assert_eq!(crossings, 4);
}

#[tokio::test]
async fn worker_panic_is_a_feeder_error() {
    let probe = Arc::new(Probe {
        panic_on: Some(0),
        ..Probe::new(1)
    });
    let sampler = EpochSampler::new(1, 1, None).unwrap();
    let mut feeder = ParallelFeeder::start(probe, sampler, 1, 1).unwrap();

    let err = feeder.next_batch().await.unwrap_err();
    assert!(matches!(err, MlError::Feeder(_)), "unexpected error: {err}");
}
