//! Per-shard record processing
//!
//! A [`ShardProcessor`] is created for every shard a worker is assigned and
//! receives the shard's lifecycle callbacks in order:
//!
//! - `initialize` binds the shard id and its metric scope
//! - `process_records` records size and arrival lag for every record, then
//!   commits the batch through its checkpointer exactly once
//! - `shutdown` makes one best-effort final checkpoint
//!
//! Metric failures are contained per record. A failing checkpoint is
//! reported to the caller but leaves the processor active, so the next batch
//! is still processed.

use crate::error::{CheckpointError, ProcessorError, RecordMetricError, Result};
use crate::metrics::{ShardMetricsRegistry, ShardMetricsScope};
use async_trait::async_trait;
use aws_sdk_kinesis::types::Record;
use aws_smithy_types_convert::date_time::DateTimeExt;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a shard's processor is being shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The shard was closed and every record has been delivered
    ShardEnd,
    /// The worker lost its claim on the shard
    LeaseLost,
    /// The worker can no longer make progress on the shard
    Zombie,
    /// The worker itself is stopping
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownReason::ShardEnd => "SHARD_END",
            ShutdownReason::LeaseLost => "LEASE_LOST",
            ShutdownReason::Zombie => "ZOMBIE",
            ShutdownReason::Requested => "REQUESTED",
        };
        f.write_str(name)
    }
}

/// Single-use capability to commit the shard's current read position
#[async_trait]
pub trait Checkpointer: Send {
    async fn checkpoint(self: Box<Self>) -> std::result::Result<(), CheckpointError>;
}

/// Checkpointer backed by a one-shot closure
pub struct FnCheckpointer<F>(F);

#[async_trait]
impl<F, Fut> Checkpointer for FnCheckpointer<F>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), CheckpointError>> + Send + 'static,
{
    async fn checkpoint(self: Box<Self>) -> std::result::Result<(), CheckpointError> {
        (self.0)().await
    }
}

/// Wrap a closure as a boxed [`Checkpointer`]
pub fn checkpointer_fn<F, Fut>(f: F) -> Box<dyn Checkpointer>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), CheckpointError>> + Send + 'static,
{
    Box::new(FnCheckpointer(f))
}

pub struct InitializationInput {
    pub shard_id: String,
    /// Position the shard resumes after, if it was checkpointed before
    pub sequence_number: Option<String>,
}

pub struct ProcessRecordsInput {
    pub records: Vec<Record>,
    pub checkpointer: Box<dyn Checkpointer>,
    pub millis_behind_latest: Option<i64>,
}

pub struct ShutdownInput {
    pub reason: ShutdownReason,
    pub checkpointer: Box<dyn Checkpointer>,
}

/// Lifecycle callbacks a consumer worker delivers for one shard.
///
/// Calls on one instance are strictly sequential.
#[async_trait]
pub trait RecordProcessor: Send {
    async fn initialize(&mut self, input: InitializationInput) -> Result<()>;

    async fn process_records(&mut self, input: ProcessRecordsInput) -> Result<()>;

    async fn shutdown(&mut self, input: ShutdownInput) -> Result<()>;
}

/// Creates one processor per shard assignment
pub trait RecordProcessorFactory: Send + Sync {
    fn create_processor(&self) -> Box<dyn RecordProcessor>;
}

/// Source of "now" for arrival-lag computation
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Uninitialized,
    Active,
    ShuttingDown,
    Terminated,
}

/// What one `process_records` call observed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub records: usize,
    pub bytes: usize,
    pub latency_updates: usize,
    pub metric_failures: usize,
    /// Arrival lag written by the last record carrying a timestamp
    pub last_lag_seconds: Option<i64>,
}

struct RecordObservation {
    size: usize,
    lag_seconds: Option<i64>,
}

/// Records per-shard telemetry and checkpoints after every batch
pub struct ShardProcessor {
    registry: Arc<ShardMetricsRegistry>,
    clock: Arc<dyn Clock>,
    reset_on_shard_end: bool,
    scope: Option<ShardMetricsScope>,
    state: ProcessorState,
}

impl ShardProcessor {
    pub fn new(registry: Arc<ShardMetricsRegistry>) -> Self {
        Self::with_clock(registry, Arc::new(SystemClock))
    }

    pub fn with_clock(registry: Arc<ShardMetricsRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            reset_on_shard_end: true,
            scope: None,
            state: ProcessorState::Uninitialized,
        }
    }

    /// Keep a closed shard's series after `ShardEnd` instead of removing them
    pub fn keep_metrics_on_shard_end(mut self) -> Self {
        self.reset_on_shard_end = false;
        self
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn shard_id(&self) -> Option<&str> {
        self.scope.as_ref().map(ShardMetricsScope::shard_id)
    }

    fn shard_label(&self) -> String {
        self.shard_id().unwrap_or("<unassigned>").to_string()
    }

    /// Visit every record, then checkpoint once
    pub async fn process_batch(
        &mut self,
        records: &[Record],
        checkpointer: Box<dyn Checkpointer>,
    ) -> Result<BatchSummary> {
        let scope = match (&self.state, &self.scope) {
            (ProcessorState::Active, Some(scope)) => scope.clone(),
            (ProcessorState::Uninitialized, _) => {
                return Err(ProcessorError::NotInitialized {
                    shard_id: self.shard_label(),
                    operation: "process_records",
                })
            }
            _ => return Err(ProcessorError::Terminated(self.shard_label())),
        };
        let shard_id = scope.shard_id();

        info!(shard_id = %shard_id, records = records.len(), "processRecords started");
        let started = Instant::now();
        let mut summary = BatchSummary::default();

        for (position, record) in records.iter().enumerate() {
            summary.records += 1;
            match self.observe_record(&scope, record) {
                Ok(observation) => {
                    summary.bytes += observation.size;
                    if let Some(lag) = observation.lag_seconds {
                        summary.latency_updates += 1;
                        summary.last_lag_seconds = Some(lag);
                    }
                }
                Err(e) => {
                    summary.metric_failures += 1;
                    warn!(
                        shard_id = %shard_id,
                        sequence = %record.sequence_number(),
                        position = position,
                        error = %e,
                        "Failed to record metrics for record, continuing with batch"
                    );
                }
            }
        }

        let visit_ms = started.elapsed().as_millis();
        let checkpoint_started = Instant::now();

        if let Err(e) = checkpointer.checkpoint().await {
            error!(
                shard_id = %shard_id,
                records = summary.records,
                error = %e,
                "Checkpoint failed after processing batch"
            );
            return Err(ProcessorError::CheckpointFailed {
                shard_id: shard_id.to_string(),
                source: e,
            });
        }

        info!(
            shard_id = %shard_id,
            records = summary.records,
            metric_failures = summary.metric_failures,
            visit_ms = visit_ms as u64,
            checkpoint_ms = checkpoint_started.elapsed().as_millis() as u64,
            "processRecords completed"
        );

        Ok(summary)
    }

    fn observe_record(
        &self,
        scope: &ShardMetricsScope,
        record: &Record,
    ) -> std::result::Result<RecordObservation, RecordMetricError> {
        let size = record.data().as_ref().len();
        scope.observe_size(size)?;

        let lag_seconds = match record.approximate_arrival_timestamp() {
            None => None,
            Some(arrival) => {
                let arrival = arrival.to_chrono_utc().map_err(|e| {
                    RecordMetricError::ArrivalTimestamp {
                        sequence_number: record.sequence_number().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                // Truncates toward zero, like integer division of milliseconds.
                let lag = (self.clock.now() - arrival).num_seconds();
                scope.set_latency_seconds(lag)?;
                Some(lag)
            }
        };

        Ok(RecordObservation { size, lag_seconds })
    }
}

#[async_trait]
impl RecordProcessor for ShardProcessor {
    async fn initialize(&mut self, input: InitializationInput) -> Result<()> {
        if self.state != ProcessorState::Uninitialized {
            return Err(ProcessorError::AlreadyInitialized(self.shard_label()));
        }

        info!(
            shard_id = %input.shard_id,
            resume_after = ?input.sequence_number,
            "Initializing shard processor"
        );
        self.scope = Some(self.registry.scope(input.shard_id));
        self.state = ProcessorState::Active;
        Ok(())
    }

    async fn process_records(&mut self, input: ProcessRecordsInput) -> Result<()> {
        if let Some(behind) = input.millis_behind_latest {
            debug!(shard_id = %self.shard_label(), millis_behind_latest = behind, "Batch received");
        }
        self.process_batch(&input.records, input.checkpointer)
            .await
            .map(|_| ())
    }

    async fn shutdown(&mut self, input: ShutdownInput) -> Result<()> {
        let shard_id = self.shard_label();
        match self.state {
            ProcessorState::Terminated => return Err(ProcessorError::Terminated(shard_id)),
            ProcessorState::Uninitialized => {
                warn!(shard_id = %shard_id, "Shutdown delivered before initialize");
            }
            ProcessorState::Active | ProcessorState::ShuttingDown => {}
        }

        self.state = ProcessorState::ShuttingDown;
        warn!(shard_id = %shard_id, reason = %input.reason, "Shard processor is shutting down");
        warn!(shard_id = %shard_id, "Writing final checkpoint");

        let result = input.checkpointer.checkpoint().await;
        self.state = ProcessorState::Terminated;

        if input.reason == ShutdownReason::ShardEnd && self.reset_on_shard_end {
            if let Some(scope) = &self.scope {
                scope.reset();
            }
        }

        match result {
            Ok(()) => {
                info!(shard_id = %shard_id, reason = %input.reason, "Final checkpoint written");
                Ok(())
            }
            Err(e) => {
                error!(
                    shard_id = %shard_id,
                    reason = %input.reason,
                    error = %e,
                    "Final checkpoint failed"
                );
                Err(ProcessorError::CheckpointFailed { shard_id, source: e })
            }
        }
    }
}

/// Hands out [`ShardProcessor`]s sharing one registry
#[derive(Clone)]
pub struct ShardProcessorFactory {
    registry: Arc<ShardMetricsRegistry>,
    clock: Arc<dyn Clock>,
    reset_on_shard_end: bool,
}

impl ShardProcessorFactory {
    pub fn new(registry: Arc<ShardMetricsRegistry>) -> Self {
        Self {
            registry,
            clock: Arc::new(SystemClock),
            reset_on_shard_end: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn keep_metrics_on_shard_end(mut self) -> Self {
        self.reset_on_shard_end = false;
        self
    }
}

impl RecordProcessorFactory for ShardProcessorFactory {
    fn create_processor(&self) -> Box<dyn RecordProcessor> {
        let processor = ShardProcessor::with_clock(self.registry.clone(), self.clock.clone());
        if self.reset_on_shard_end {
            Box::new(processor)
        } else {
            Box::new(processor.keep_metrics_on_shard_end())
        }
    }
}
