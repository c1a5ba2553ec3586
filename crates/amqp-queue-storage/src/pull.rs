//! Pull side of the queue storage.
//!
//! `init` opens a single session for the configured partition and, for each
//! priority shard, a receiver link with a paired sender link. The receiver is
//! granted `LinkCredit` deliveries ahead of settlement, restored as messages
//! are settled. A pull call then polls the shards, highest priority first,
//! until it has produced the requested number of items.

use crate::connection::ConnectionAmqp;
use crate::error::QueueError;
use crate::handler::PulledItem;
use crate::health::{HealthCheckResult, HealthCheckTag};
use crate::message::Delivery;
use crate::options::QueueOptions;
use crate::sharding::LinkNames;
use crate::storage::{MessageStream, PullQueueStorage, QueueStorage, StorageState};
use crate::transport::{AmqpSession, ReceiverLink, SenderLink};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[cfg(test)]
#[path = "pull_tests.rs"]
mod tests;

const COMPONENT: &str = "PullQueueStorage";

/// Smallest receive timeout given to a single shard
const MIN_SHARD_POLL: Duration = Duration::from_millis(1);

/// Paired links of one shard
struct ShardLinks {
    queue: String,
    sender: Arc<dyn SenderLink>,
    receiver: Arc<dyn ReceiverLink>,
}

/// Links opened by `init`
struct PullLinks {
    session: Arc<dyn AmqpSession>,
    /// Highest priority shard first
    shards: Vec<ShardLinks>,
}

impl PullLinks {
    /// Close every link, then the session. Failures are only logged.
    async fn close(&self) {
        for shard in &self.shards {
            if let Err(e) = shard.receiver.close().await {
                warn!(link = shard.receiver.name(), error = %e, "Failed to close receiver link");
            }
            if let Err(e) = shard.sender.close().await {
                warn!(link = shard.sender.name(), error = %e, "Failed to close sender link");
            }
        }
        if let Err(e) = self.session.close().await {
            warn!(session = self.session.id(), error = %e, "Failed to close pull session");
        }
    }

    /// One poll attempt across every shard.
    async fn poll(
        &self,
        timeout: Duration,
    ) -> Result<Option<(&ShardLinks, Delivery)>, QueueError> {
        for shard in &self.shards {
            if let Some(delivery) = shard.receiver.receive(timeout).await? {
                return Ok(Some((shard, delivery)));
            }
        }
        Ok(None)
    }
}

/// [`PullQueueStorage`] over an AMQP connection
pub struct AmqpPullQueueStorage {
    state: StorageState,
    links: OnceCell<PullLinks>,
}

impl AmqpPullQueueStorage {
    /// Create a pull storage for `options.partition_id`, which must be set.
    pub fn new(
        options: QueueOptions,
        connection: Arc<dyn ConnectionAmqp>,
    ) -> Result<Self, QueueError> {
        options.validate_partition()?;
        Ok(Self {
            state: StorageState::new(options, connection)?,
            links: OnceCell::new(),
        })
    }

    pub fn partition_id(&self) -> &str {
        &self.state.options().partition_id
    }

    pub fn links_per_partition(&self) -> u32 {
        self.state.links_per_partition()
    }

    async fn open_links(&self, cancellation: &CancellationToken) -> Result<PullLinks, QueueError> {
        self.state.connection().init(cancellation).await?;
        if cancellation.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let session = self.state.connection().transport()?.open_session().await?;
        let mut links = PullLinks {
            session,
            shards: Vec::new(),
        };

        match self.open_shards(&mut links).await {
            Ok(()) => Ok(links),
            Err(e) => {
                warn!(
                    partition_id = self.partition_id(),
                    opened_shards = links.shards.len(),
                    error = %e,
                    "Failed to open pull links, closing the ones already opened"
                );
                links.close().await;
                Err(e)
            }
        }
    }

    /// Open the paired links of every shard, highest priority first
    async fn open_shards(&self, links: &mut PullLinks) -> Result<(), QueueError> {
        let options = self.state.options();
        for names in LinkNames::for_partition(&options.partition_id, self.links_per_partition())
            .into_iter()
            .rev()
        {
            let sender = links.session.open_sender(&names.sender, &names.queue).await?;
            let receiver = match links.session.open_receiver(&names.receiver, &names.queue).await {
                Ok(receiver) => receiver,
                Err(e) => {
                    if let Err(close_error) = sender.close().await {
                        warn!(link = sender.name(), error = %close_error, "Failed to close sender link");
                    }
                    return Err(e);
                }
            };
            receiver.set_credit(options.link_credit, true);
            debug!(queue = %names.queue, link_credit = options.link_credit, "Pull links opened");

            links.shards.push(ShardLinks {
                queue: names.queue,
                sender,
                receiver,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStorage for AmqpPullQueueStorage {
    async fn init(&self, cancellation: &CancellationToken) -> Result<(), QueueError> {
        if self.links.initialized() {
            return Ok(());
        }

        self.links
            .get_or_try_init(|| self.open_links(cancellation))
            .await?;
        self.state.mark_initialized();
        info!(
            partition_id = self.partition_id(),
            links_per_partition = self.links_per_partition(),
            link_credit = self.state.options().link_credit,
            "Pull queue storage initialized"
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

/// Progress of one pull call
struct PullProgress {
    yielded: usize,
    done: bool,
}

impl PullQueueStorage for AmqpPullQueueStorage {
    fn pull_messages(
        &self,
        count: usize,
        cancellation: CancellationToken,
    ) -> Result<MessageStream<'_>, QueueError> {
        let links = self
            .links
            .get()
            .ok_or_else(|| QueueError::not_initialized(COMPONENT))?;

        let shard_count = links.shards.len().max(1) as u32;
        let shard_timeout =
            (self.state.options().poll_timeout() / shard_count).max(MIN_SHARD_POLL);

        let initial = PullProgress {
            yielded: 0,
            done: false,
        };
        let stream = stream::unfold(initial, move |mut progress| {
            let cancellation = cancellation.clone();
            async move {
                if progress.done || progress.yielded >= count {
                    return None;
                }

                loop {
                    if cancellation.is_cancelled() {
                        debug!(yielded = progress.yielded, count, "Pull cancelled");
                        progress.done = true;
                        return Some((Err(QueueError::Cancelled), progress));
                    }

                    let (shard, delivery) = match links.poll(shard_timeout).await {
                        Ok(Some(received)) => received,
                        Ok(None) => {
                            trace!("No message received, polling again");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "Receive failed, ending pull");
                            progress.done = true;
                            return Some((Err(e), progress));
                        }
                    };

                    let item = match delivery.decode_task_id() {
                        Ok(task_id) => Ok(PulledItem::new(
                            delivery,
                            task_id,
                            Arc::clone(&shard.sender),
                            Arc::clone(&shard.receiver),
                            cancellation.clone(),
                        )),
                        Err(e) => {
                            warn!(
                                queue = %shard.queue,
                                error = %e,
                                "Malformed message dead-lettered, ending pull"
                            );
                            let reason = e.to_string();
                            if let Err(settle) = shard.receiver.reject(&delivery, &reason).await {
                                warn!(
                                    queue = %shard.queue,
                                    error = %settle,
                                    "Failed to reject malformed message"
                                );
                            }
                            progress.done = true;
                            return Some((Err(e), progress));
                        }
                    };

                    progress.yielded += 1;
                    return Some((item, progress));
                }
            }
        });

        Ok(stream.boxed())
    }
}
