//! Durable per-shard checkpoint storage

use async_trait::async_trait;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbCheckpointStore;
pub use memory::InMemoryCheckpointStore;

/// Checkpoint value recorded once a closed shard has been read to its end
pub const SHARD_END: &str = "SHARD_END";

/// Trait for checkpoint storage implementations
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last committed position for a shard, if any
    async fn get_checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<String>>;

    /// Durably commit a position for a shard
    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl<S: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<S> {
    async fn get_checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<String>> {
        (**self).get_checkpoint(shard_id).await
    }

    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        (**self).save_checkpoint(shard_id, sequence_number).await
    }
}
