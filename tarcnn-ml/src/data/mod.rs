//! Example collections, batch assembly and the batch feeder.

pub mod batch;
pub mod dataset;
pub mod example;
pub mod feeder;

pub use batch::{Batch, FEATURE_PAD, SEGMENT_PAD, collate};
pub use dataset::{FeatureDirDataset, LabelFilter};
pub use example::{ExampleCollection, FeatureExample, InMemoryCollection, Segment};
pub use feeder::{DataFeeder, EpochSampler, FeederMode, ParallelFeeder, SerialFeeder};
