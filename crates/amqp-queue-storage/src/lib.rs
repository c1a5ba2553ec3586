//! # AMQP Queue Storage
//!
//! Priority-partitioned task queue storage over an AMQP 1.0 broker.
//!
//! Task identifiers are pushed to a partition with a priority and pulled back
//! by workers serving that partition. Brokers support ten priority levels per
//! queue, so a partition configured with a larger `MaxPriority` is spread over
//! several queues, each carrying a band of ten priorities.
//!
//! This library provides:
//! - Push storage with pooled sessions and per-batch failure aggregation
//! - Pull storage with credit-based prefetch, exposed as an async stream
//! - Settlement of pulled messages according to their processing outcome
//! - Connection retries with exponential backoff
//! - Health checks for startup, liveness and readiness probes
//! - An in-memory broker for tests and local development
//!
//! ## Example
//!
//! ```
//! use amqp_queue_storage::{
//!     AmqpPullQueueStorage, AmqpPushQueueStorage, ConnectionAmqp, InMemoryBroker,
//!     PullQueueStorage, PushItem, PushQueueStorage, QueueMessageStatus, QueueOptions,
//!     QueueStorage, RetryingConnection, Secret,
//! };
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let options = QueueOptions {
//!     host: "localhost".to_string(),
//!     port: 5672,
//!     user: "guest".to_string(),
//!     password: Secret::new("guest"),
//!     partition_id: "partition-1".to_string(),
//!     max_retries: 3,
//!     max_priority: 10,
//!     ..Default::default()
//! };
//! let connection: Arc<dyn ConnectionAmqp> =
//!     Arc::new(RetryingConnection::new(&options, InMemoryBroker::new())?);
//! let push = AmqpPushQueueStorage::new(options.clone(), Arc::clone(&connection))?;
//! let pull = AmqpPullQueueStorage::new(options, connection)?;
//!
//! let cancellation = CancellationToken::new();
//! push.init(&cancellation).await?;
//! pull.init(&cancellation).await?;
//!
//! push.push_messages(&[PushItem::new("task-42", 7)], "partition-1", &cancellation)
//!     .await?;
//!
//! let mut messages = pull.pull_messages(1, cancellation.clone())?;
//! while let Some(message) = messages.next().await {
//!     let mut message = message?;
//!     assert_eq!(message.task_id(), "task-42");
//!     message.set_status(QueueMessageStatus::Processed);
//!     message.finalize().await?;
//! }
//! # Ok::<(), amqp_queue_storage::QueueError>(())
//! # }).unwrap();
//! ```
//!
//! ## Module Organization
//!
//! - [`options`] - Configuration loading and validation
//! - [`storage`] - Capability traits and shared state
//! - [`push`] / [`pull`] - The AMQP storages
//! - [`handler`] - Pulled items and their settlement
//! - [`connection`] / [`transport`] - Broker connection contracts
//! - [`providers`] - Transport implementations

// Module declarations
pub mod connection;
pub mod error;
pub mod handler;
pub mod health;
pub mod message;
pub mod options;
pub mod providers;
pub mod pull;
pub mod push;
pub mod retry;
pub mod session_pool;
pub mod sharding;
pub mod storage;
pub mod transport;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// Re-export commonly used types at crate root for convenience
pub use connection::{ConnectionAmqp, Connector, RetryingConnection};
pub use error::{ConfigurationError, QueueError, ValidationError};
pub use handler::{PulledItem, QueueMessageStatus};
pub use health::{HealthCheckResult, HealthCheckTag, HealthStatus};
pub use message::{AmqpMessage, Delivery, MessageId, PushItem, Timestamp};
pub use options::{AmqpAddress, AmqpScheme, QueueOptions, Secret};
pub use providers::InMemoryBroker;
pub use pull::AmqpPullQueueStorage;
pub use push::AmqpPushQueueStorage;
pub use retry::ConnectBackoff;
pub use sharding::{LinkNames, MAX_INTERNAL_QUEUE_PRIORITY};
pub use storage::{MessageStream, PullQueueStorage, PushQueueStorage, QueueStorage};
