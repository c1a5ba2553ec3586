//! Common test utilities for amqp-queue-storage integration tests
//!
//! This module provides:
//! - Tracing setup honouring `RUST_LOG`
//! - Option builders for a local broker
//! - A harness wiring push and pull storages to one in-memory broker

use amqp_queue_storage::{
    AmqpPullQueueStorage, AmqpPushQueueStorage, ConnectionAmqp, InMemoryBroker, PulledItem,
    PullQueueStorage, QueueMessageStatus, QueueOptions, QueueStorage, RetryingConnection, Secret,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Install a fmt subscriber once per test binary.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Valid options for `partition_id` with a short poll timeout
#[allow(dead_code)]
pub fn test_options(partition_id: &str, max_priority: u32) -> QueueOptions {
    QueueOptions {
        host: "localhost".to_string(),
        port: 5672,
        user: "guest".to_string(),
        password: Secret::new("guest"),
        partition_id: partition_id.to_string(),
        max_priority,
        max_retries: 3,
        poll_timeout_ms: 20,
        ..Default::default()
    }
}

/// Push and pull storages sharing one connection to an in-memory broker
#[allow(dead_code)]
pub struct Harness {
    pub broker: InMemoryBroker,
    pub connection: Arc<dyn ConnectionAmqp>,
    pub push: AmqpPushQueueStorage,
    pub pull: AmqpPullQueueStorage,
}

impl Harness {
    /// Build the storages without initializing them.
    #[allow(dead_code)]
    pub fn new(options: QueueOptions) -> anyhow::Result<Self> {
        init_tracing();

        let broker = InMemoryBroker::new();
        let connection: Arc<dyn ConnectionAmqp> =
            Arc::new(RetryingConnection::new(&options, broker.clone())?);
        let push = AmqpPushQueueStorage::new(options.clone(), Arc::clone(&connection))?;
        let pull = AmqpPullQueueStorage::new(options, Arc::clone(&connection))?;

        Ok(Self {
            broker,
            connection,
            push,
            pull,
        })
    }

    /// Build and initialize both storages.
    #[allow(dead_code)]
    pub async fn started(options: QueueOptions) -> anyhow::Result<Self> {
        let harness = Self::new(options)?;
        let cancellation = CancellationToken::new();
        harness.push.init(&cancellation).await?;
        harness.pull.init(&cancellation).await?;
        Ok(harness)
    }

    /// Pull `count` items, settling each with `status`, and return their task ids.
    #[allow(dead_code)]
    pub async fn drain(
        &self,
        count: usize,
        status: QueueMessageStatus,
    ) -> anyhow::Result<Vec<String>> {
        let mut stream = self.pull.pull_messages(count, CancellationToken::new())?;
        let mut task_ids = Vec::with_capacity(count);
        while let Some(item) = stream.next().await {
            let mut item: PulledItem = item?;
            task_ids.push(item.task_id().to_string());
            item.set_status(status);
            item.finalize().await?;
        }
        Ok(task_ids)
    }
}
