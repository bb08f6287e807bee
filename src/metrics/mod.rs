//! Per-shard record telemetry and its Prometheus exposition
//!
//! [`ShardMetricsRegistry`] owns two instruments labelled by shard id: a
//! histogram of record payload sizes and a gauge holding the most recent
//! arrival lag. [`MetricsServer`] serves the registry to scrapers.

mod registry;
mod server;

pub use registry::{
    ShardMetricsRegistry, ShardMetricsScope, ShardMetricsSnapshot, ARRIVAL_LAG_METRIC,
    RECORD_SIZE_BUCKETS, RECORD_SIZE_METRIC, SHARD_LABEL,
};
pub use server::{generate_shutdown_token, router, BoundMetricsServer, MetricsServer};
