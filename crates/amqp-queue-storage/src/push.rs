//! Push side of the queue storage.
//!
//! A push call checks a session out of the pool, groups its items by shard
//! and sends each group through a sender link opened for that call only. The
//! link is closed and the session returned to the pool however the call ends.

use crate::connection::ConnectionAmqp;
use crate::error::QueueError;
use crate::health::{HealthCheckResult, HealthCheckTag};
use crate::message::{AmqpMessage, PushItem};
use crate::options::QueueOptions;
use crate::session_pool::SessionPool;
use crate::sharding::LinkNames;
use crate::storage::{PushQueueStorage, QueueStorage, StorageState};
use crate::transport::AmqpSession;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[cfg(test)]
#[path = "push_tests.rs"]
mod tests;

const COMPONENT: &str = "PushQueueStorage";

/// [`PushQueueStorage`] over an AMQP connection
pub struct AmqpPushQueueStorage {
    state: StorageState,
    sessions: SessionPool,
}

impl AmqpPushQueueStorage {
    pub fn new(
        options: QueueOptions,
        connection: Arc<dyn ConnectionAmqp>,
    ) -> Result<Self, QueueError> {
        let sessions = SessionPool::new(Arc::clone(&connection), options.session_pool_size);
        let state = StorageState::new(options, connection)?;
        Ok(Self { state, sessions })
    }

    pub fn session_pool(&self) -> &SessionPool {
        &self.sessions
    }

    pub fn links_per_partition(&self) -> u32 {
        self.state.links_per_partition()
    }

    /// Send one shard's messages through a dedicated sender link.
    ///
    /// Every send is awaited; the failures are recorded rather than returned
    /// so the remaining shards of the batch are still attempted.
    async fn send_shard(
        &self,
        session: &dyn AmqpSession,
        names: &LinkNames,
        messages: Vec<AmqpMessage>,
        failures: &mut BatchFailures,
    ) {
        let count = messages.len();
        let sender = match session.open_sender(&names.sender, &names.queue).await {
            Ok(sender) => sender,
            Err(e) => {
                failures.record(count, e);
                return;
            }
        };

        let results = if sender.supports_concurrent_sends() {
            join_all(messages.into_iter().map(|message| sender.send(message))).await
        } else {
            let mut results = Vec::with_capacity(count);
            for message in messages {
                results.push(sender.send(message).await);
            }
            results
        };

        for result in results {
            if let Err(e) = result {
                failures.record(1, e);
            }
        }

        // Messages are already settled by the broker at this point
        if let Err(e) = sender.close().await {
            warn!(link = %names.sender, error = %e, "Failed to close sender link");
        }
        trace!(queue = %names.queue, count, "Shard sent");
    }
}

/// Failed sends of one batch
#[derive(Default)]
struct BatchFailures {
    failed: usize,
    first: Option<QueueError>,
}

impl BatchFailures {
    fn record(&mut self, count: usize, error: QueueError) {
        self.failed += count;
        if self.first.is_none() {
            self.first = Some(error);
        }
    }

    fn into_result(self, total: usize) -> Result<(), QueueError> {
        match self.first {
            None => Ok(()),
            Some(first) => Err(QueueError::SendFailed {
                failed: self.failed,
                total,
                message: first.to_string(),
            }),
        }
    }
}

#[async_trait]
impl QueueStorage for AmqpPushQueueStorage {
    async fn init(&self, cancellation: &CancellationToken) -> Result<(), QueueError> {
        if self.state.is_initialized() {
            return Ok(());
        }

        self.state.connection().init(cancellation).await?;
        self.state.mark_initialized();
        info!(
            max_priority = self.state.max_priority(),
            links_per_partition = self.state.links_per_partition(),
            "Push queue storage initialized"
        );
        Ok(())
    }

    async fn check(&self, tag: HealthCheckTag) -> HealthCheckResult {
        self.state.check(COMPONENT, tag).await
    }

    fn max_priority(&self) -> u32 {
        self.state.max_priority()
    }
}

#[async_trait]
impl PushQueueStorage for AmqpPushQueueStorage {
    async fn push_messages(
        &self,
        items: &[PushItem],
        partition_id: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.state.ensure_initialized(COMPONENT)?;

        if items.is_empty() {
            trace!(partition_id, "Empty push batch ignored");
            return Ok(());
        }

        // Validate the whole batch before anything reaches the broker
        let mut shards: BTreeMap<u32, Vec<AmqpMessage>> = BTreeMap::new();
        for item in items {
            let assignment = self.state.shard(item.priority)?;
            let message = AmqpMessage::new(item.task_id.clone())
                .with_priority(assignment.local_priority);
            shards.entry(assignment.link_index).or_default().push(message);
        }

        if cancellation.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let session = self.sessions.acquire().await?;
        let shard_count = shards.len();
        let mut failures = BatchFailures::default();

        for (link_index, messages) in shards {
            let names = self.state.link_names(partition_id, link_index);
            self.send_shard(&*session, &names, messages, &mut failures).await;
        }

        match failures.into_result(items.len()) {
            Ok(()) => {
                debug!(
                    partition_id,
                    count = items.len(),
                    shards = shard_count,
                    session = session.id(),
                    "Messages pushed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(partition_id, count = items.len(), error = %e, "Push batch failed");
                Err(e)
            }
        }
    }
}
