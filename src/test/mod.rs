//! Test utilities and mock implementations for exercising shard processing


use aws_sdk_kinesis::types::{HashKeyRange, Record, SequenceNumberRange, Shard};
use aws_smithy_types::{Blob, DateTime as SmithyDateTime};
use chrono::{DateTime, TimeZone, Utc};

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Fixed "now" used by clock-dependent tests
    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
            .single()
            .expect("valid base time")
    }

    /// Create a test record with given sequence number, payload and arrival time
    pub fn create_test_record(
        sequence_number: &str,
        data: &[u8],
        arrival: Option<DateTime<Utc>>,
    ) -> Record {
        let arrival = arrival.map(|ts| SmithyDateTime::from_millis(ts.timestamp_millis()));
        Self::build_record(sequence_number, data.to_vec(), arrival)
    }

    /// Create a record whose payload is `size` bytes long
    pub fn create_sized_record(
        sequence_number: &str,
        size: usize,
        arrival: Option<DateTime<Utc>>,
    ) -> Record {
        Self::create_test_record(sequence_number, &vec![b'x'; size], arrival)
    }

    /// Create a record whose arrival timestamp cannot be represented as a UTC time
    pub fn create_record_with_unusable_timestamp(sequence_number: &str, size: usize) -> Record {
        Self::build_record(
            sequence_number,
            vec![b'x'; size],
            Some(SmithyDateTime::from_secs(i64::MAX)),
        )
    }

    fn build_record(sequence_number: &str, data: Vec<u8>, arrival: Option<SmithyDateTime>) -> Record {
        Record::builder()
            .sequence_number(sequence_number)
            .data(Blob::new(data))
            .partition_key("test-partition-key")
            .set_approximate_arrival_timestamp(arrival)
            .build()
            .expect("Failed to build test record")
    }

    /// Create a vector of test records without arrival timestamps
    pub fn create_test_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Self::create_test_record(
                    &format!("sequence-{}", i),
                    format!("data-{}", i).as_bytes(),
                    None,
                )
            })
            .collect()
    }

    /// Create a test shard with given ID
    pub fn create_test_shard(shard_id: &str) -> Shard {
        Self::shard_builder(shard_id)
            .build()
            .expect("Failed to build test shard")
    }

    /// Create a shard produced by splitting `parent_id`
    pub fn create_child_shard(shard_id: &str, parent_id: &str) -> Shard {
        Self::shard_builder(shard_id)
            .parent_shard_id(parent_id)
            .build()
            .expect("Failed to build test shard")
    }

    fn shard_builder(shard_id: &str) -> aws_sdk_kinesis::types::builders::ShardBuilder {
        Shard::builder()
            .shard_id(shard_id)
            .hash_key_range(
                HashKeyRange::builder()
                    .starting_hash_key("0")
                    .ending_hash_key("340282366920938463463374607431768211455")
                    .build()
                    .expect("Failed to build hash key range"),
            )
            .sequence_number_range(
                SequenceNumberRange::builder()
                    .starting_sequence_number("0")
                    .build()
                    .expect("Failed to build sequence number range"),
            )
    }
}
