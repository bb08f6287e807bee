//! Kinesis Shard Telemetry - a Kinesis consumer that publishes per-shard record metrics
//!
//! Every record read from the stream feeds two Prometheus series labelled by
//! shard: a histogram of payload sizes and a gauge of how long ago the record
//! arrived in the stream. Each batch is checkpointed once all of its records
//! have been visited.

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod processor;
pub mod retry;
pub mod store;
pub mod worker;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use config::ServiceConfig;
pub use error::{ProcessorError, Result};
pub use metrics::{MetricsServer, ShardMetricsRegistry};
pub use orchestrator::{ConsumerSubsystem, MetricsSubsystem, Orchestrator};
pub use retry::ExponentialBackoff;
pub use worker::{InitialPosition, Worker, WorkerConfig};

// Re-export main traits
pub use crate::client::StreamClient;
pub use crate::processor::{Checkpointer, RecordProcessor, RecordProcessorFactory};
pub use crate::store::CheckpointStore;

// Re-export implementations
pub use crate::processor::{ShardProcessor, ShardProcessorFactory};
pub use crate::store::memory::InMemoryCheckpointStore;

#[cfg(feature = "dynamodb-store")]
pub use crate::store::dynamodb::DynamoDbCheckpointStore;
