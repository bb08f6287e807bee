// tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use aws_sdk_kinesis::types::{HashKeyRange, Record, SequenceNumberRange, Shard};
use aws_smithy_types::{Blob, DateTime as SmithyDateTime};
use chrono::{DateTime, Utc};
use kinesis_shard_telemetry::client::{ClientError, RecordBatch, StartingPosition, StreamClient};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("kinesis_shard_telemetry=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn record(sequence_number: &str, size: usize, arrival: Option<DateTime<Utc>>) -> Record {
    Record::builder()
        .sequence_number(sequence_number)
        .data(Blob::new(vec![b'r'; size]))
        .partition_key("pk")
        .set_approximate_arrival_timestamp(
            arrival.map(|ts| SmithyDateTime::from_millis(ts.timestamp_millis())),
        )
        .build()
        .expect("valid record")
}

pub fn shard(shard_id: &str, parent: Option<&str>) -> Shard {
    Shard::builder()
        .shard_id(shard_id)
        .set_parent_shard_id(parent.map(String::from))
        .hash_key_range(
            HashKeyRange::builder()
                .starting_hash_key("0")
                .ending_hash_key("1")
                .build()
                .expect("valid hash key range"),
        )
        .sequence_number_range(
            SequenceNumberRange::builder()
                .starting_sequence_number("0")
                .build()
                .expect("valid sequence range"),
        )
        .build()
        .expect("valid shard")
}

/// In-memory stream: each shard serves its scripted batches, the last one closing the shard
#[derive(Clone, Default)]
pub struct ScriptedStream {
    shards: Arc<Mutex<Vec<Shard>>>,
    batches: Arc<Mutex<HashMap<String, VecDeque<(Vec<Record>, bool)>>>>,
}

impl ScriptedStream {
    pub fn with_shard(self, shard: Shard) -> Self {
        self.shards.lock().unwrap().push(shard);
        self
    }

    pub fn batch(self, shard_id: &str, records: Vec<Record>) -> Self {
        self.push(shard_id, records, false)
    }

    pub fn closing_batch(self, shard_id: &str, records: Vec<Record>) -> Self {
        self.push(shard_id, records, true)
    }

    fn push(self, shard_id: &str, records: Vec<Record>, closes: bool) -> Self {
        self.batches
            .lock()
            .unwrap()
            .entry(shard_id.to_string())
            .or_default()
            .push_back((records, closes));
        self
    }
}

#[async_trait]
impl StreamClient for ScriptedStream {
    async fn list_shards(&self, _stream_name: &str) -> Result<Vec<Shard>, ClientError> {
        Ok(self.shards.lock().unwrap().clone())
    }

    async fn get_shard_iterator(
        &self,
        _stream_name: &str,
        shard_id: &str,
        _position: &StartingPosition,
    ) -> Result<String, ClientError> {
        Ok(shard_id.to_string())
    }

    async fn get_records(&self, iterator: &str, _limit: i32) -> Result<RecordBatch, ClientError> {
        let next = self
            .batches
            .lock()
            .unwrap()
            .get_mut(iterator)
            .and_then(VecDeque::pop_front);

        Ok(match next {
            Some((records, true)) => RecordBatch {
                records,
                next_iterator: None,
                millis_behind_latest: Some(0),
            },
            Some((records, false)) => RecordBatch {
                records,
                next_iterator: Some(iterator.to_string()),
                millis_behind_latest: Some(0),
            },
            None => RecordBatch {
                records: Vec::new(),
                next_iterator: Some(iterator.to_string()),
                millis_behind_latest: Some(0),
            },
        })
    }
}

pub async fn eventually<P: Fn() -> bool>(what: &str, predicate: P) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

pub async fn scrape(port: u16) -> anyhow::Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    stream
        .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}
