use crate::error::MetricsError;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{debug, trace};

pub const RECORD_SIZE_METRIC: &str = "kinesis_consumer_records";
pub const ARRIVAL_LAG_METRIC: &str = "kinesis_consumer_approximate_arrival_time_diff_seconds";
pub const SHARD_LABEL: &str = "shard_id";

/// Upper bounds of the record-size buckets in bytes; `+Inf` is implicit.
pub const RECORD_SIZE_BUCKETS: [f64; 3] = [400.0, 1000.0, 10000.0];

/// Process-wide, shard-labelled telemetry store
///
/// One instance is created at startup and handed to every shard processor
/// and to the exposition server as an `Arc`. All operations are safe to call
/// concurrently from any number of shard tasks while a scrape is in progress.
#[derive(Clone)]
pub struct ShardMetricsRegistry {
    registry: Registry,
    record_sizes: HistogramVec,
    arrival_lag: IntGaugeVec,
}

/// Point-in-time view of one shard's instruments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardMetricsSnapshot {
    /// Number of size observations
    pub record_count: u64,
    /// Sum of all observed sizes in bytes
    pub total_bytes: f64,
    /// Cumulative count per bucket upper bound, excluding `+Inf`
    pub size_buckets: Vec<(f64, u64)>,
    /// Last arrival lag written, or `None` if never set
    pub arrival_lag_seconds: Option<i64>,
}

impl ShardMetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let record_sizes = HistogramVec::new(
            HistogramOpts::new(
                RECORD_SIZE_METRIC,
                "Tracks the data passing though a shard, shows record size in bytes.",
            )
            .buckets(RECORD_SIZE_BUCKETS.to_vec()),
            &[SHARD_LABEL],
        )
        .map_err(MetricsError::Registration)?;
        registry
            .register(Box::new(record_sizes.clone()))
            .map_err(MetricsError::Registration)?;

        let arrival_lag = IntGaugeVec::new(
            Opts::new(
                ARRIVAL_LAG_METRIC,
                "Difference between a record's approximate arrival timestamp and its consume time in seconds.",
            ),
            &[SHARD_LABEL],
        )
        .map_err(MetricsError::Registration)?;
        registry
            .register(Box::new(arrival_lag.clone()))
            .map_err(MetricsError::Registration)?;

        debug!("Initialized shard metrics registry");

        Ok(Self {
            registry,
            record_sizes,
            arrival_lag,
        })
    }

    /// Handle bound to a single shard label
    pub fn scope(self: &Arc<Self>, shard_id: impl Into<String>) -> ShardMetricsScope {
        ShardMetricsScope {
            registry: Arc::clone(self),
            shard_id: shard_id.into(),
        }
    }

    /// Record one payload size observation for a shard
    pub fn observe_size(&self, shard_id: &str, size_bytes: usize) -> Result<(), MetricsError> {
        let histogram = self
            .record_sizes
            .get_metric_with_label_values(&[shard_id])
            .map_err(|source| MetricsError::Update {
                shard_id: shard_id.to_string(),
                source,
            })?;
        histogram.observe(size_bytes as f64);
        Ok(())
    }

    /// Overwrite the arrival lag gauge for a shard
    pub fn set_latency_seconds(&self, shard_id: &str, seconds: i64) -> Result<(), MetricsError> {
        let gauge = self
            .arrival_lag
            .get_metric_with_label_values(&[shard_id])
            .map_err(|source| MetricsError::Update {
                shard_id: shard_id.to_string(),
                source,
            })?;
        gauge.set(seconds);
        Ok(())
    }

    /// Drop every series carrying this shard label.
    ///
    /// Used when a shard is retired so stale labels do not accumulate.
    pub fn reset(&self, shard_id: &str) {
        // NotFound just means the shard never produced that series.
        if let Err(e) = self.record_sizes.remove_label_values(&[shard_id]) {
            trace!(shard_id = %shard_id, error = %e, "No size series to remove");
        }
        if let Err(e) = self.arrival_lag.remove_label_values(&[shard_id]) {
            trace!(shard_id = %shard_id, error = %e, "No arrival lag series to remove");
        }
        debug!(shard_id = %shard_id, "Reset shard metrics");
    }

    /// Read the current state of one shard without creating any series
    pub fn snapshot(&self, shard_id: &str) -> ShardMetricsSnapshot {
        let families = self.registry.gather();
        let mut snapshot = ShardMetricsSnapshot::default();

        if let Some(metric) = find_series(&families, RECORD_SIZE_METRIC, shard_id) {
            let histogram = metric.get_histogram();
            snapshot.record_count = histogram.get_sample_count();
            snapshot.total_bytes = histogram.get_sample_sum();
            snapshot.size_buckets = histogram
                .get_bucket()
                .iter()
                .filter(|b| b.get_upper_bound().is_finite())
                .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
                .collect();
        }

        if let Some(metric) = find_series(&families, ARRIVAL_LAG_METRIC, shard_id) {
            snapshot.arrival_lag_seconds = Some(metric.get_gauge().get_value() as i64);
        }

        snapshot
    }

    /// Shard labels that currently have at least one series
    pub fn shard_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .gather()
            .iter()
            .flat_map(|family| family.get_metric().iter())
            .flat_map(|metric| metric.get_label().iter())
            .filter(|label| label.get_name() == SHARD_LABEL)
            .map(|label| label.get_value().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Render every instrument in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
    }
}

fn find_series<'a>(
    families: &'a [MetricFamily],
    name: &str,
    shard_id: &str,
) -> Option<&'a prometheus::proto::Metric> {
    families
        .iter()
        .find(|family| family.get_name() == name)?
        .get_metric()
        .iter()
        .find(|metric| {
            metric
                .get_label()
                .iter()
                .any(|l| l.get_name() == SHARD_LABEL && l.get_value() == shard_id)
        })
}

/// Registry handle fixed to one shard label
///
/// A shard processor only ever touches its own label through this type.
#[derive(Clone)]
pub struct ShardMetricsScope {
    registry: Arc<ShardMetricsRegistry>,
    shard_id: String,
}

impl ShardMetricsScope {
    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn observe_size(&self, size_bytes: usize) -> Result<(), MetricsError> {
        self.registry.observe_size(&self.shard_id, size_bytes)
    }

    pub fn set_latency_seconds(&self, seconds: i64) -> Result<(), MetricsError> {
        self.registry.set_latency_seconds(&self.shard_id, seconds)
    }

    pub fn reset(&self) {
        self.registry.reset(&self.shard_id)
    }

    pub fn snapshot(&self) -> ShardMetricsSnapshot {
        self.registry.snapshot(&self.shard_id)
    }
}

impl std::fmt::Debug for ShardMetricsScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMetricsScope")
            .field("shard_id", &self.shard_id)
            .finish()
    }
}
