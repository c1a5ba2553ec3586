//! Storage capabilities and the state shared by their implementations.
//!
//! Callers depend on the narrow capability traits: [`QueueStorage`] for
//! lifecycle and health, [`PushQueueStorage`] to enqueue task references and
//! [`PullQueueStorage`] to consume them. The AMQP implementations compose a
//! [`StorageState`] holding the validated options, the connection handle and
//! the derived number of links per partition.

use crate::connection::ConnectionAmqp;
use crate::error::{QueueError, ValidationError};
use crate::handler::PulledItem;
use crate::health::{HealthCheckResult, HealthCheckTag};
use crate::message::PushItem;
use crate::options::QueueOptions;
use crate::sharding::{self, LinkNames, ShardAssignment};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;

/// Lazily produced pulled items; finite and not restartable
pub type MessageStream<'a> = BoxStream<'a, Result<PulledItem, QueueError>>;

// ============================================================================
// Capability Traits
// ============================================================================

/// Lifecycle and health of a queue storage
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Connect and open links. Calls after a successful one are no-ops.
    async fn init(&self, cancellation: &CancellationToken) -> Result<(), QueueError>;

    async fn check(&self, tag: HealthCheckTag) -> HealthCheckResult;

    /// Highest priority accepted by push calls
    fn max_priority(&self) -> u32;
}

/// Enqueue task references
#[async_trait]
pub trait PushQueueStorage: QueueStorage {
    /// Send every item to `partition_id`.
    ///
    /// The batch succeeds only if the broker accepts every item; otherwise a
    /// single [`QueueError::SendFailed`] reports how many were refused. An
    /// empty batch is a no-op.
    async fn push_messages(
        &self,
        items: &[PushItem],
        partition_id: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), QueueError>;
}

/// Consume task references from the configured partition
pub trait PullQueueStorage: QueueStorage {
    /// Pull `count` messages.
    ///
    /// Fails immediately when the storage is not initialized. The stream ends
    /// after `count` items, or after the first error; cancellation surfaces as
    /// [`QueueError::Cancelled`]. Items already yielded must still be settled.
    fn pull_messages(
        &self,
        count: usize,
        cancellation: CancellationToken,
    ) -> Result<MessageStream<'_>, QueueError>;
}

// ============================================================================
// Shared State
// ============================================================================

/// Validated options, connection handle and lifecycle flag
pub struct StorageState {
    options: QueueOptions,
    connection: Arc<dyn ConnectionAmqp>,
    links_per_partition: u32,
    initialized: AtomicBool,
}

impl StorageState {
    /// Validate `options` and derive the partition layout.
    pub fn new(
        options: QueueOptions,
        connection: Arc<dyn ConnectionAmqp>,
    ) -> Result<Self, QueueError> {
        options.validate()?;
        let links_per_partition = sharding::links_per_partition(options.max_priority);

        Ok(Self {
            options,
            connection,
            links_per_partition,
            initialized: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn connection(&self) -> &Arc<dyn ConnectionAmqp> {
        &self.connection
    }

    pub fn links_per_partition(&self) -> u32 {
        self.links_per_partition
    }

    pub fn max_priority(&self) -> u32 {
        self.options.max_priority
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn ensure_initialized(&self, component: &str) -> Result<(), QueueError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(QueueError::not_initialized(component))
        }
    }

    /// Health of `component`: by probe kind before init, the connection's after.
    pub async fn check(&self, component: &str, tag: HealthCheckTag) -> HealthCheckResult {
        if !self.is_initialized() {
            return HealthCheckResult::not_initialized(component, tag);
        }
        self.connection.check(tag).await
    }

    /// Shard placement of `priority`, which must not exceed `max_priority`.
    pub fn shard(&self, priority: u32) -> Result<ShardAssignment, QueueError> {
        if priority > self.options.max_priority {
            return Err(ValidationError::OutOfRange {
                field: "priority".to_string(),
                message: format!(
                    "{} exceeds the maximum priority {}",
                    priority, self.options.max_priority
                ),
            }
            .into());
        }
        Ok(sharding::assign(priority, self.links_per_partition))
    }

    pub fn link_names(&self, partition_id: &str, link_index: u32) -> LinkNames {
        LinkNames::for_shard(partition_id, link_index, self.links_per_partition)
    }
}
