use crate::store::CheckpointStore;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

/// Process-local checkpoint store; positions are lost on restart
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory checkpoint store");
        Self::default()
    }

    /// Copy of every stored checkpoint
    pub async fn all_checkpoints(&self) -> HashMap<String, String> {
        self.checkpoints.read().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    #[instrument(skip(self))]
    async fn get_checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<String>> {
        let checkpoint = self.checkpoints.read().await.get(shard_id).cloned();
        trace!(shard_id = %shard_id, checkpoint = ?checkpoint, "Read checkpoint from memory");
        Ok(checkpoint)
    }

    #[instrument(skip(self))]
    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(shard_id.to_string(), sequence_number.to_string());
        debug!(shard_id = %shard_id, sequence_number = %sequence_number, "Saved checkpoint to memory");
        Ok(())
    }
}
