use crate::retry::{retry_with_backoff, ExponentialBackoff};
use crate::store::CheckpointStore;
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::DisplayErrorContext,
    types::{
        AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
        ScalarAttributeType, TableStatus,
    },
    Client as DynamoClient,
};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

const LEASE_KEY: &str = "leaseKey";
const CHECKPOINT_ATTRIBUTE: &str = "checkpoint";
const OWNER_ATTRIBUTE: &str = "leaseOwner";
/// Status checks made while a new table is still being created
const TABLE_ACTIVE_CHECKS: u32 = 30;

/// Checkpoints kept in a DynamoDB table keyed by shard id
#[derive(Debug, Clone)]
pub struct DynamoDbCheckpointStore {
    client: DynamoClient,
    table_name: String,
    owner: String,
    max_retries: u32,
    backoff: ExponentialBackoff,
}

impl DynamoDbCheckpointStore {
    pub fn new(client: DynamoClient, table_name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            owner: owner.into(),
            max_retries: 3,
            backoff: ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10)),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: ExponentialBackoff) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Create the checkpoint table if it does not exist yet
    pub async fn ensure_table(&self) -> anyhow::Result<()> {
        match self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
        {
            Ok(output) => {
                if output.table().and_then(|t| t.table_status()) == Some(&TableStatus::Active) {
                    debug!(table = %self.table_name, "Checkpoint table exists");
                    return Ok(());
                }
                return self.wait_until_active().await;
            }
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false) => {}
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "Failed to describe checkpoint table {}: {}",
                    self.table_name,
                    DisplayErrorContext(&err)
                ))
            }
        }

        info!(table = %self.table_name, "Creating checkpoint table");
        let created = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(LEASE_KEY)
                    .attribute_type(ScalarAttributeType::S)
                    .build()?,
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(LEASE_KEY)
                    .key_type(KeyType::Hash)
                    .build()?,
            )
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        match created {
            Ok(_) => {}
            // Another worker won the race.
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_resource_in_use_exception())
                    .unwrap_or(false) => {}
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "Failed to create checkpoint table {}: {}",
                    self.table_name,
                    DisplayErrorContext(&err)
                ))
            }
        }

        self.wait_until_active().await
    }

    /// Reads and writes fail until a new table leaves `CREATING`
    async fn wait_until_active(&self) -> anyhow::Result<()> {
        let backoff = ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(5));
        poll_until_active(&self.table_name, TABLE_ACTIVE_CHECKS, &backoff, move || async move {
            let output = self
                .client
                .describe_table()
                .table_name(&self.table_name)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))?;
            Ok(output.table().and_then(|t| t.table_status()).cloned())
        })
        .await
    }
}

async fn poll_until_active<F, Fut>(
    table: &str,
    checks: u32,
    backoff: &ExponentialBackoff,
    mut describe: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<TableStatus>>>,
{
    for attempt in 0..checks {
        match describe().await {
            Ok(Some(TableStatus::Active)) => {
                info!(table = %table, "Checkpoint table is active");
                return Ok(());
            }
            Ok(status) => {
                debug!(table = %table, status = ?status, attempt, "Waiting for checkpoint table");
            }
            Err(e) => {
                debug!(table = %table, error = %e, attempt, "Checkpoint table not describable yet");
            }
        }
        tokio::time::sleep(backoff.delay(attempt)).await;
    }

    anyhow::bail!(
        "Checkpoint table {} did not become active after {} checks",
        table,
        checks
    )
}

#[async_trait]
impl CheckpointStore for DynamoDbCheckpointStore {
    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get_checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<String>> {
        let checkpoint = retry_with_backoff("get_checkpoint", self.max_retries, &self.backoff, move || async move {
            let response = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .key(LEASE_KEY, AttributeValue::S(shard_id.to_string()))
                .consistent_read(true)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
                .context("Failed to get checkpoint from DynamoDB")?;

            Ok::<_, anyhow::Error>(
                response
                    .item()
                    .and_then(|item| item.get(CHECKPOINT_ATTRIBUTE))
                    .and_then(|attr| attr.as_s().ok())
                    .cloned(),
            )
        })
        .await?;

        trace!(shard_id = %shard_id, checkpoint = ?checkpoint, "Retrieved checkpoint from DynamoDB");
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        retry_with_backoff("save_checkpoint", self.max_retries, &self.backoff, move || async move {
            self.client
                .put_item()
                .table_name(&self.table_name)
                .item(LEASE_KEY, AttributeValue::S(shard_id.to_string()))
                .item(CHECKPOINT_ATTRIBUTE, AttributeValue::S(sequence_number.to_string()))
                .item(OWNER_ATTRIBUTE, AttributeValue::S(self.owner.clone()))
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
                .context("Failed to save checkpoint to DynamoDB")?;
            Ok::<_, anyhow::Error>(())
        })
        .await?;

        debug!(
            shard_id = %shard_id,
            sequence_number = %sequence_number,
            "Saved checkpoint to DynamoDB"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_credential_types::Credentials;
    use aws_sdk_dynamodb::config::{BehaviorVersion, Builder, Region};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn create_test_client() -> DynamoClient {
        let creds = Credentials::new("test", "test", None, None, "test");
        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(creds)
            .region(Region::new("us-east-1"))
            .build();
        DynamoClient::from_conf(config)
    }

    #[tokio::test]
    async fn test_store_construction() {
        let store = DynamoDbCheckpointStore::new(create_test_client(), "consumer-app", "worker-1")
            .with_retries(0, ExponentialBackoff::default());

        assert_eq!(store.table_name(), "consumer-app");
        assert_eq!(store.max_retries, 0);
        assert_eq!(store.owner, "worker-1");
    }

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_poll_waits_for_creating_table() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));

        poll_until_active("consumer-app", 10, &fast_backoff(), || {
            let calls = calls.clone();
            async move {
                Ok(match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => None,
                    1 | 2 => Some(TableStatus::Creating),
                    _ => Some(TableStatus::Active),
                })
            }
        })
        .await?;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_tolerates_describe_errors() -> anyhow::Result<()> {
        let calls = Arc::new(AtomicU32::new(0));

        poll_until_active("consumer-app", 10, &fast_backoff(), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("ResourceNotFoundException");
                }
                Ok(Some(TableStatus::Active))
            }
        })
        .await?;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_gives_up_on_stuck_table() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = poll_until_active("consumer-app", 3, &fast_backoff(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(TableStatus::Creating))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
