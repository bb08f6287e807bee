//! Single-worker stream consumer
//!
//! The worker owns every shard of the stream. It lists shards periodically,
//! starts one task per readable shard and drives that shard's
//! [`RecordProcessor`] through `initialize`, `process_records` and
//! `shutdown`. Each shard task is isolated: an error or panic in one shard
//! is logged and never reaches the others.
//!
//! A child shard is held back until every listed parent has been read to
//! its end, so records of one partition key are delivered in order across
//! resharding.

use crate::client::{ClientError, RecordBatch, StartingPosition, StreamClient};
use crate::config::ServiceConfig;
use crate::error::{CheckpointError, ProcessorError, Result};
use crate::processor::{
    Checkpointer, InitializationInput, ProcessRecordsInput, RecordProcessor,
    RecordProcessorFactory, ShutdownInput, ShutdownReason,
};
use crate::retry::ExponentialBackoff;
use crate::store::{CheckpointStore, SHARD_END};
use async_trait::async_trait;
use aws_sdk_kinesis::types::Shard;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Where to start reading a shard that has no checkpoint
#[derive(Debug, Clone, PartialEq)]
pub enum InitialPosition {
    /// Start from the oldest available record
    TrimHorizon,
    /// Start from records arriving after the shard is opened
    Latest,
    /// Start from the first record at or after a timestamp
    AtTimestamp(DateTime<Utc>),
}

impl InitialPosition {
    fn starting_position(&self) -> StartingPosition {
        match self {
            InitialPosition::TrimHorizon => StartingPosition::TrimHorizon,
            InitialPosition::Latest => StartingPosition::Latest,
            InitialPosition::AtTimestamp(ts) => StartingPosition::AtTimestamp(*ts),
        }
    }
}

/// Configuration for the consumer worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream_name: String,
    pub worker_id: String,
    /// Maximum records requested per GetRecords call
    pub max_records: i32,
    /// Sleep between two GetRecords calls on the same shard
    pub idle_time_between_reads: Duration,
    pub initial_position: InitialPosition,
    /// Deliver batches to processors even when GetRecords returned nothing
    pub call_process_records_even_for_empty_list: bool,
    /// How often the shard list is refreshed
    pub shard_refresh_interval: Duration,
    /// Consecutive read failures tolerated before a shard is abandoned
    pub max_read_retries: u32,
    pub read_backoff: ExponentialBackoff,
}

impl WorkerConfig {
    pub fn new(stream_name: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            worker_id: worker_id.into(),
            max_records: crate::config::DEFAULT_MAX_RECORDS,
            idle_time_between_reads: crate::config::DEFAULT_IDLE_TIME_BETWEEN_READS,
            initial_position: InitialPosition::Latest,
            call_process_records_even_for_empty_list: false,
            shard_refresh_interval: Duration::from_secs(60),
            max_read_retries: 10,
            read_backoff: ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(10)),
        }
    }
}

impl From<&ServiceConfig> for WorkerConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            max_records: config.max_records,
            idle_time_between_reads: config.idle_time_between_reads,
            initial_position: config.initial_position.clone(),
            call_process_records_even_for_empty_list: config
                .call_process_records_even_for_empty_list,
            ..Self::new(config.stream_name.clone(), config.worker_id.clone())
        }
    }
}

/// Resolves once `true` has been sent; never resolves if the sender is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Commits one position for one shard into a [`CheckpointStore`]
pub struct StoreCheckpointer<S> {
    store: Arc<S>,
    shard_id: String,
    position: Option<String>,
}

impl<S> StoreCheckpointer<S> {
    /// A `None` position makes the checkpoint a no-op
    pub fn new(store: Arc<S>, shard_id: impl Into<String>, position: Option<String>) -> Self {
        Self {
            store,
            shard_id: shard_id.into(),
            position,
        }
    }
}

#[async_trait]
impl<S: CheckpointStore + 'static> Checkpointer for StoreCheckpointer<S> {
    async fn checkpoint(self: Box<Self>) -> std::result::Result<(), CheckpointError> {
        match &self.position {
            None => {
                debug!(shard_id = %self.shard_id, "Nothing delivered yet, checkpoint skipped");
                Ok(())
            }
            Some(position) => self
                .store
                .save_checkpoint(&self.shard_id, position)
                .await
                .map_err(|e| CheckpointError::SaveFailed(format!("{:#}", e))),
        }
    }
}

struct WorkerContext<C, S, F> {
    config: WorkerConfig,
    client: C,
    store: Arc<S>,
    factory: F,
}

#[derive(Default)]
struct ShardTable {
    running: HashSet<String>,
    completed: HashSet<String>,
    tasks: JoinSet<(String, Result<ShutdownReason>)>,
}

/// Consumes every shard of one stream with processors from a factory
pub struct Worker<C, S, F> {
    context: Arc<WorkerContext<C, S, F>>,
}

impl<C, S, F> Worker<C, S, F>
where
    C: StreamClient + 'static,
    S: CheckpointStore + 'static,
    F: RecordProcessorFactory + 'static,
{
    pub fn new(config: WorkerConfig, client: C, store: S, factory: F) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                config,
                client,
                store: Arc::new(store),
                factory,
            }),
        }
    }

    /// Run until `shutdown` flips to `true`, then shut every shard down
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = &self.context.config;
        info!(
            stream = %config.stream_name,
            worker_id = %config.worker_id,
            "Starting consumer worker"
        );

        let mut table = ShardTable::default();
        let mut refresh = tokio::time::interval(config.shard_refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stopped = *shutdown.borrow();
        if !stopped {
            loop {
                tokio::select! {
                    _ = refresh.tick() => {
                        self.sync_shards(&mut table, &shutdown).await;
                    }
                    Some(joined) = table.tasks.join_next() => {
                        if Self::record_exit(&mut table, joined) == Some(ShutdownReason::ShardEnd) {
                            // Children of the closed shard may be readable now.
                            self.sync_shards(&mut table, &shutdown).await;
                        }
                    }
                    _ = wait_for_shutdown(&mut shutdown) => {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = table.tasks.join_next().await {
            Self::record_exit(&mut table, joined);
        }

        info!(stream = %config.stream_name, "Consumer worker stopped");
        Ok(())
    }

    fn record_exit(
        table: &mut ShardTable,
        joined: std::result::Result<(String, Result<ShutdownReason>), tokio::task::JoinError>,
    ) -> Option<ShutdownReason> {
        let (shard_id, outcome) = match joined {
            Ok(exit) => exit,
            Err(e) => {
                // Shard tasks catch their own panics; this only fires on abort.
                error!(error = %e, "Shard supervisor task failed");
                return None;
            }
        };
        table.running.remove(&shard_id);

        match outcome {
            Ok(reason) => {
                info!(shard_id = %shard_id, reason = %reason, "Shard processing finished");
                if reason == ShutdownReason::ShardEnd {
                    table.completed.insert(shard_id);
                }
                Some(reason)
            }
            Err(e) => {
                error!(shard_id = %shard_id, error = %e, "Shard processing failed");
                None
            }
        }
    }

    async fn sync_shards(&self, table: &mut ShardTable, shutdown: &watch::Receiver<bool>) {
        let ctx = &self.context;
        let shards = match ctx.client.list_shards(&ctx.config.stream_name).await {
            Ok(shards) => shards,
            Err(e) => {
                error!(stream = %ctx.config.stream_name, error = %e, "Failed to list shards");
                return;
            }
        };

        for shard_id in self.readable_shards(&shards, table).await {
            info!(shard_id = %shard_id, "Starting shard processing");
            table.running.insert(shard_id.clone());

            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            table.tasks.spawn(async move {
                let inner_id = shard_id.clone();
                let outcome = tokio::spawn(async move { Self::run_shard(ctx, inner_id, shutdown).await })
                    .await
                    .unwrap_or_else(|e| Err(ProcessorError::from(e)));
                (shard_id, outcome)
            });
        }
    }

    /// Shards that are neither running, finished, nor waiting on a parent
    async fn readable_shards(&self, shards: &[Shard], table: &mut ShardTable) -> Vec<String> {
        let listed: HashSet<&str> = shards.iter().map(|s| s.shard_id()).collect();
        let mut unknown: HashSet<&str> = HashSet::new();

        for shard in shards {
            let shard_id = shard.shard_id();
            if table.running.contains(shard_id) || table.completed.contains(shard_id) {
                continue;
            }
            match self.context.store.get_checkpoint(shard_id).await {
                Ok(Some(checkpoint)) if checkpoint == SHARD_END => {
                    debug!(shard_id = %shard_id, "Shard already read to its end");
                    table.completed.insert(shard_id.to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(shard_id = %shard_id, error = %e, "Failed to read checkpoint, will retry on next refresh");
                    unknown.insert(shard_id);
                }
            }
        }

        let mut readable = Vec::new();
        for shard in shards {
            let shard_id = shard.shard_id();
            if table.running.contains(shard_id)
                || table.completed.contains(shard_id)
                || unknown.contains(shard_id)
            {
                continue;
            }

            let pending_parent = [shard.parent_shard_id(), shard.adjacent_parent_shard_id()]
                .into_iter()
                .flatten()
                .find(|parent| listed.contains(parent) && !table.completed.contains(*parent));
            if let Some(parent) = pending_parent {
                debug!(shard_id = %shard_id, parent = %parent, "Waiting for parent shard to finish");
                continue;
            }

            readable.push(shard_id.to_string());
        }
        readable
    }

    async fn run_shard(
        ctx: Arc<WorkerContext<C, S, F>>,
        shard_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ShutdownReason> {
        let checkpoint = ctx.store.get_checkpoint(&shard_id).await?;
        if checkpoint.as_deref() == Some(SHARD_END) {
            info!(shard_id = %shard_id, "Shard already read to its end, not reopening");
            return Ok(ShutdownReason::ShardEnd);
        }

        let mut processor = ctx.factory.create_processor();
        processor
            .initialize(InitializationInput {
                shard_id: shard_id.clone(),
                sequence_number: checkpoint.clone(),
            })
            .await?;

        let mut last_sequence = checkpoint;
        let reason = Self::read_shard(
            &ctx,
            &shard_id,
            processor.as_mut(),
            &mut last_sequence,
            &mut shutdown,
        )
        .await;

        let position = match reason {
            ShutdownReason::ShardEnd => Some(SHARD_END.to_string()),
            _ => last_sequence,
        };
        let checkpointer = StoreCheckpointer::new(ctx.store.clone(), shard_id.clone(), position);
        if let Err(e) = processor
            .shutdown(ShutdownInput {
                reason,
                checkpointer: Box::new(checkpointer),
            })
            .await
        {
            warn!(shard_id = %shard_id, reason = %reason, error = %e, "Record processor shutdown failed");
        }

        Ok(reason)
    }

    /// Poll the shard until it ends, shutdown is requested, or reads keep failing
    async fn read_shard(
        ctx: &WorkerContext<C, S, F>,
        shard_id: &str,
        processor: &mut dyn RecordProcessor,
        last_sequence: &mut Option<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ShutdownReason {
        let config = &ctx.config;
        let mut iterator: Option<String> = None;
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return ShutdownReason::Requested;
            }

            let current = match iterator.take() {
                Some(it) => it,
                None => {
                    let position = match last_sequence {
                        Some(seq) => StartingPosition::AfterSequenceNumber(seq.clone()),
                        None => config.initial_position.starting_position(),
                    };
                    debug!(shard_id = %shard_id, position = ?position, "Requesting shard iterator");
                    match ctx
                        .client
                        .get_shard_iterator(&config.stream_name, shard_id, &position)
                        .await
                    {
                        Ok(it) => it,
                        Err(e) => {
                            if Self::read_failed(config, shard_id, &mut failures, &e, shutdown).await {
                                return ShutdownReason::Zombie;
                            }
                            continue;
                        }
                    }
                }
            };

            let batch = match ctx.client.get_records(&current, config.max_records).await {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(ClientError::ExpiredIterator) => {
                    warn!(shard_id = %shard_id, resume_after = ?last_sequence, "Shard iterator expired, re-acquiring");
                    if Self::read_failed(config, shard_id, &mut failures, &ClientError::ExpiredIterator, shutdown).await {
                        return ShutdownReason::Zombie;
                    }
                    continue;
                }
                Err(e) => {
                    iterator = Some(current);
                    if Self::read_failed(config, shard_id, &mut failures, &e, shutdown).await {
                        return ShutdownReason::Zombie;
                    }
                    continue;
                }
            };

            let RecordBatch {
                records,
                next_iterator,
                millis_behind_latest,
            } = batch;

            if !records.is_empty() || config.call_process_records_even_for_empty_list {
                let batch_last = records.last().map(|r| r.sequence_number().to_string());
                let position = batch_last.clone().or_else(|| last_sequence.clone());
                let checkpointer = StoreCheckpointer::new(ctx.store.clone(), shard_id, position);

                if let Err(e) = processor
                    .process_records(ProcessRecordsInput {
                        records,
                        checkpointer: Box::new(checkpointer),
                        millis_behind_latest,
                    })
                    .await
                {
                    warn!(shard_id = %shard_id, error = %e, "Record processor reported a failure");
                }

                if batch_last.is_some() {
                    *last_sequence = batch_last;
                }
            }

            match next_iterator {
                Some(next) => iterator = Some(next),
                None => {
                    info!(shard_id = %shard_id, "Reached end of shard");
                    return ShutdownReason::ShardEnd;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.idle_time_between_reads) => {}
                _ = wait_for_shutdown(shutdown) => {}
            }
        }
    }

    /// Count a read failure and back off; `true` once retries are exhausted
    async fn read_failed(
        config: &WorkerConfig,
        shard_id: &str,
        failures: &mut u32,
        err: &ClientError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        *failures += 1;
        if *failures > config.max_read_retries {
            error!(
                shard_id = %shard_id,
                attempts = *failures,
                error = %err,
                "Giving up on shard after repeated read failures"
            );
            return true;
        }

        let delay = config.read_backoff.delay(*failures - 1);
        warn!(
            shard_id = %shard_id,
            attempt = *failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Shard read failed, will retry"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(shutdown) => {}
        }
        false
    }
}
