//! Pulled messages and their settlement.
//!
//! Each [`PulledItem`] carries the task identifier decoded from a delivery
//! together with the links it came from. The consumer records the outcome of
//! processing with [`PulledItem::set_status`] and then calls
//! [`PulledItem::finalize`], which settles the delivery on the broker:
//!
//! | Status                                   | Settlement                         |
//! |------------------------------------------|------------------------------------|
//! | `Processed`, `Cancelled`                 | accept                             |
//! | `Poisonous`                              | reject (dead-letter)               |
//! | `Waiting`, `Failed`, `Retried`           | release for redelivery             |
//! | `Postponed`                              | re-send with same priority, accept |
//!
//! An item dropped without being finalized stays unsettled and keeps one unit
//! of link credit until the link closes, at which point the broker redelivers
//! it.

use crate::error::QueueError;
use crate::message::{Delivery, MessageId, Timestamp};
use crate::transport::{ReceiverLink, SenderLink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;

/// Outcome of processing a pulled message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueMessageStatus {
    /// Not processed yet
    #[default]
    Waiting,
    /// Processing failed and the task should be attempted again
    Failed,
    /// The task completed
    Processed,
    /// The task was cancelled; nothing left to do
    Cancelled,
    /// The task cannot run now and goes back behind other messages
    Postponed,
    /// The task was handed over to a retry
    Retried,
    /// The message can never be processed
    Poisonous,
}

/// A task reference handed to the consumer, pending settlement
pub struct PulledItem {
    delivery: Delivery,
    task_id: String,
    sender: Arc<dyn SenderLink>,
    receiver: Arc<dyn ReceiverLink>,
    cancellation: CancellationToken,
    status: QueueMessageStatus,
    finalized: bool,
}

impl PulledItem {
    pub(crate) fn new(
        delivery: Delivery,
        task_id: String,
        sender: Arc<dyn SenderLink>,
        receiver: Arc<dyn ReceiverLink>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            delivery,
            task_id,
            sender,
            receiver,
            cancellation,
            status: QueueMessageStatus::Waiting,
            finalized: false,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.delivery.delivery_id
    }

    /// Task identifier carried by the message
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn received_at(&self) -> Timestamp {
        self.delivery.received_at
    }

    /// Send link paired with the receive link this item came from
    pub fn sender(&self) -> &Arc<dyn SenderLink> {
        &self.sender
    }

    pub fn receiver(&self) -> &Arc<dyn ReceiverLink> {
        &self.receiver
    }

    /// Token of the pull call that produced this item
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn status(&self) -> QueueMessageStatus {
        self.status
    }

    pub fn set_status(&mut self, status: QueueMessageStatus) {
        self.status = status;
    }

    /// Settle the delivery according to the current status.
    pub async fn finalize(mut self) -> Result<(), QueueError> {
        self.finalized = true;

        match self.status {
            QueueMessageStatus::Processed | QueueMessageStatus::Cancelled => {
                self.receiver.accept(&self.delivery).await?;
            }
            QueueMessageStatus::Poisonous => {
                self.receiver
                    .reject(&self.delivery, "message marked as poisonous")
                    .await?;
            }
            QueueMessageStatus::Waiting
            | QueueMessageStatus::Failed
            | QueueMessageStatus::Retried => {
                self.receiver.release(&self.delivery).await?;
            }
            QueueMessageStatus::Postponed => {
                // Re-enqueue first so the task is never lost between the two steps
                self.sender.send(self.delivery.message.clone()).await?;
                self.receiver.accept(&self.delivery).await?;
            }
        }

        debug!(
            message_id = %self.delivery.delivery_id,
            task_id = %self.task_id,
            status = ?self.status,
            "Pulled message settled"
        );
        Ok(())
    }
}

impl fmt::Debug for PulledItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulledItem")
            .field("message_id", &self.delivery.delivery_id)
            .field("task_id", &self.task_id)
            .field("status", &self.status)
            .field("receiver", &self.receiver.name())
            .finish()
    }
}

impl Drop for PulledItem {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                message_id = %self.delivery.delivery_id,
                task_id = %self.task_id,
                "Pulled message dropped without settlement; it stays pending until the link closes"
            );
        }
    }
}
