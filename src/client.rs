use async_trait::async_trait;
use aws_sdk_kinesis::{
    error::DisplayErrorContext,
    types::{Record, Shard, ShardIteratorType},
    Client,
};
use chrono::{DateTime, Utc};
use std::time::SystemTime;
use thiserror::Error;
use tracing::trace;

/// Failures surfaced by the stream client
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Shard iterator expired")]
    ExpiredIterator,

    #[error("Provisioned throughput exceeded")]
    ThroughputExceeded,

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("{0}")]
    Other(String),
}

/// Where a shard iterator should start
#[derive(Debug, Clone, PartialEq)]
pub enum StartingPosition {
    TrimHorizon,
    Latest,
    AfterSequenceNumber(String),
    AtTimestamp(DateTime<Utc>),
}

/// One GetRecords response
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    /// `None` once the shard has been closed and fully read
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

/// The subset of the Kinesis API the consumer worker needs
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, ClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &StartingPosition,
    ) -> Result<String, ClientError>;

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, ClientError>;
}

#[async_trait]
impl StreamClient for Client {
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, ClientError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // ListShards rejects a stream name alongside a continuation token.
            let request = match &next_token {
                Some(token) => self.list_shards().next_token(token),
                None => self.list_shards().stream_name(stream_name),
            };

            let response = request.send().await.map_err(|err| match err.as_service_error() {
                Some(e) if e.is_resource_not_found_exception() => {
                    ClientError::ResourceNotFound(stream_name.to_string())
                }
                _ => ClientError::Other(DisplayErrorContext(&err).to_string()),
            })?;

            shards.extend(response.shards().iter().cloned());
            trace!(stream = %stream_name, count = shards.len(), "Listed shard page");

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(shards)
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &StartingPosition,
    ) -> Result<String, ClientError> {
        let mut req = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id);

        req = match position {
            StartingPosition::TrimHorizon => req.shard_iterator_type(ShardIteratorType::TrimHorizon),
            StartingPosition::Latest => req.shard_iterator_type(ShardIteratorType::Latest),
            StartingPosition::AfterSequenceNumber(seq) => req
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(seq),
            StartingPosition::AtTimestamp(ts) => {
                let system_time: SystemTime = (*ts).into();
                req.shard_iterator_type(ShardIteratorType::AtTimestamp)
                    .timestamp(aws_smithy_types::DateTime::from(system_time))
            }
        };

        let response = req.send().await.map_err(|err| match err.as_service_error() {
            Some(e) if e.is_resource_not_found_exception() => {
                ClientError::ResourceNotFound(shard_id.to_string())
            }
            Some(e) if e.is_provisioned_throughput_exceeded_exception() => {
                ClientError::ThroughputExceeded
            }
            _ => ClientError::Other(DisplayErrorContext(&err).to_string()),
        })?;

        response
            .shard_iterator()
            .map(String::from)
            .ok_or_else(|| ClientError::Other(format!("No iterator returned for {}", shard_id)))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, ClientError> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_expired_iterator_exception() => ClientError::ExpiredIterator,
                Some(e) if e.is_provisioned_throughput_exceeded_exception() => {
                    ClientError::ThroughputExceeded
                }
                _ => ClientError::Other(DisplayErrorContext(&err).to_string()),
            })?;

        Ok(RecordBatch {
            records: response.records().to_vec(),
            next_iterator: response.next_shard_iterator().map(String::from),
            millis_behind_latest: response.millis_behind_latest(),
        })
    }
}
