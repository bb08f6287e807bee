//! Service bring-up
//!
//! The service runs two subsystems: the metrics scrape server and the
//! stream consumer. The [`Orchestrator`] starts them concurrently and each
//! start is isolated, so one failing to come up (for example, the metrics
//! port is taken) leaves the other running.

use crate::config::ServiceConfig;
use crate::error::MetricsError;
use crate::metrics::{MetricsServer, ShardMetricsRegistry};
use crate::processor::ShardProcessorFactory;
use crate::store::CheckpointStore;
use crate::worker::{wait_for_shutdown, Worker, WorkerConfig};
use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

/// A running subsystem; `completion` resolves when it stops
pub struct SubsystemHandle {
    name: &'static str,
    completion: BoxFuture<'static, anyhow::Result<()>>,
}

impl SubsystemHandle {
    pub fn new(
        name: &'static str,
        completion: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            name,
            completion: completion.boxed(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// One independently started part of the service
#[async_trait]
pub trait Subsystem: Send + 'static {
    fn name(&self) -> &'static str;

    /// Bring the subsystem up and return once it is running
    async fn start(self: Box<Self>) -> anyhow::Result<SubsystemHandle>;
}

#[derive(Debug, Clone)]
pub struct StartFailure {
    pub name: &'static str,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct SubsystemExit {
    pub name: &'static str,
    pub result: Result<(), String>,
}

/// Outcome of [`Orchestrator::start`]
pub struct Bootstrap {
    running: Vec<SubsystemHandle>,
    failures: Vec<StartFailure>,
}

impl Bootstrap {
    pub fn running(&self) -> Vec<&'static str> {
        self.running.iter().map(SubsystemHandle::name).collect()
    }

    pub fn failures(&self) -> &[StartFailure] {
        &self.failures
    }

    /// Wait for every running subsystem to stop
    pub async fn wait(self) -> Vec<SubsystemExit> {
        let waits = self.running.into_iter().map(|handle| {
            let name = handle.name;
            let task = tokio::spawn(handle.completion);
            async move {
                let result = match task.await {
                    Ok(Ok(())) => {
                        info!(subsystem = name, "Subsystem stopped");
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        error!(subsystem = name, error = %format!("{:#}", e), "Subsystem failed");
                        Err(format!("{:#}", e))
                    }
                    Err(e) => {
                        error!(subsystem = name, error = %e, "Subsystem panicked");
                        Err(e.to_string())
                    }
                };
                SubsystemExit { name, result }
            }
        });
        join_all(waits).await
    }
}

#[derive(Default)]
pub struct Orchestrator {
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subsystem(mut self, subsystem: impl Subsystem) -> Self {
        self.subsystems.push(Box::new(subsystem));
        self
    }

    /// Start every subsystem concurrently; failures are collected, not propagated
    pub async fn start(self) -> Bootstrap {
        let starts = self.subsystems.into_iter().map(|subsystem| {
            let name = subsystem.name();
            let task = tokio::spawn(subsystem.start());
            async move { (name, task.await) }
        });

        let mut bootstrap = Bootstrap {
            running: Vec::new(),
            failures: Vec::new(),
        };

        for (name, outcome) in join_all(starts).await {
            match outcome {
                Ok(Ok(handle)) => {
                    info!(subsystem = name, "Subsystem started");
                    bootstrap.running.push(handle);
                }
                Ok(Err(e)) => {
                    error!(subsystem = name, error = %format!("{:#}", e), "Subsystem failed to start");
                    bootstrap.failures.push(StartFailure {
                        name,
                        error: format!("{:#}", e),
                    });
                }
                Err(e) => {
                    error!(subsystem = name, error = %e, "Subsystem panicked while starting");
                    bootstrap.failures.push(StartFailure {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }

        bootstrap
    }
}

/// Scrape endpoint served from a dedicated thread with its own runtime
pub struct MetricsSubsystem {
    registry: Arc<ShardMetricsRegistry>,
    port: u16,
    shutdown: watch::Receiver<bool>,
}

impl MetricsSubsystem {
    pub fn new(registry: Arc<ShardMetricsRegistry>, port: u16, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            registry,
            port,
            shutdown,
        }
    }
}

#[async_trait]
impl Subsystem for MetricsSubsystem {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn start(self: Box<Self>) -> anyhow::Result<SubsystemHandle> {
        let MetricsSubsystem {
            registry,
            port,
            mut shutdown,
        } = *self;
        let (bound_tx, bound_rx) = oneshot::channel::<Result<SocketAddr, MetricsError>>();
        let (done_tx, done_rx) = oneshot::channel::<Result<(), MetricsError>>();

        std::thread::Builder::new()
            .name("metrics-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = bound_tx.send(Err(MetricsError::Serve(e.to_string())));
                        return;
                    }
                };

                runtime.block_on(async move {
                    match MetricsServer::new(registry, port).bind().await {
                        Ok(bound) => {
                            let _ = bound_tx.send(Ok(bound.local_addr()));
                            let served = bound
                                .serve_until(async move { wait_for_shutdown(&mut shutdown).await })
                                .await;
                            let _ = done_tx.send(served);
                        }
                        Err(e) => {
                            let _ = bound_tx.send(Err(e));
                        }
                    }
                });
            })
            .context("Failed to spawn metrics thread")?;

        let addr = bound_rx
            .await
            .context("Metrics thread exited before binding")??;
        info!(addr = %addr, "Metrics endpoint listening");

        Ok(SubsystemHandle::new("metrics", async move {
            done_rx.await.context("Metrics thread exited unexpectedly")??;
            Ok(())
        }))
    }
}

/// The stream consumer: AWS clients, checkpoint store and worker
pub struct ConsumerSubsystem {
    config: ServiceConfig,
    registry: Arc<ShardMetricsRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerSubsystem {
    pub fn new(
        config: ServiceConfig,
        registry: Arc<ShardMetricsRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            registry,
            shutdown,
        }
    }

    async fn load_sdk_config(&self) -> aws_config::SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(credentials) = &self.config.credentials {
            loader = loader.credentials_provider(credentials.clone());
        }
        loader.load().await
    }

    fn spawn_worker<S: CheckpointStore + 'static>(
        self,
        client: aws_sdk_kinesis::Client,
        store: S,
    ) -> SubsystemHandle {
        let mut factory = ShardProcessorFactory::new(self.registry);
        if self.config.keep_metrics_on_shard_end {
            factory = factory.keep_metrics_on_shard_end();
        }
        let worker = Worker::new(WorkerConfig::from(&self.config), client, store, factory);
        let shutdown = self.shutdown;

        SubsystemHandle::new("consumer", async move {
            worker.run(shutdown).await?;
            Ok(())
        })
    }
}

#[async_trait]
impl Subsystem for ConsumerSubsystem {
    fn name(&self) -> &'static str {
        "consumer"
    }

    async fn start(self: Box<Self>) -> anyhow::Result<SubsystemHandle> {
        let this = *self;
        let sdk_config = this.load_sdk_config().await;

        let mut kinesis_config = aws_sdk_kinesis::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &this.config.kinesis_endpoint {
            kinesis_config = kinesis_config.endpoint_url(endpoint);
        }
        let kinesis = aws_sdk_kinesis::Client::from_conf(kinesis_config.build());

        info!(
            app = %this.config.application_name,
            stream = %this.config.stream_name,
            worker_id = %this.config.worker_id,
            "Starting stream consumer"
        );

        this.start_worker(&sdk_config, kinesis).await
    }
}

impl ConsumerSubsystem {
    #[cfg(feature = "dynamodb-store")]
    async fn start_worker(
        self,
        sdk_config: &aws_config::SdkConfig,
        kinesis: aws_sdk_kinesis::Client,
    ) -> anyhow::Result<SubsystemHandle> {
        let store = crate::store::DynamoDbCheckpointStore::new(
            aws_sdk_dynamodb::Client::new(sdk_config),
            self.config.checkpoint_table.clone(),
            self.config.worker_id.clone(),
        );
        store
            .ensure_table()
            .await
            .context("Failed to prepare checkpoint table")?;
        Ok(self.spawn_worker(kinesis, store))
    }

    #[cfg(not(feature = "dynamodb-store"))]
    async fn start_worker(
        self,
        _sdk_config: &aws_config::SdkConfig,
        kinesis: aws_sdk_kinesis::Client,
    ) -> anyhow::Result<SubsystemHandle> {
        tracing::warn!("Built without dynamodb-store; checkpoints will not survive a restart");
        Ok(self.spawn_worker(kinesis, crate::store::InMemoryCheckpointStore::new()))
    }
}
