//! Contracts of the AMQP 1.0 transport the storage drives.
//!
//! A transport is an open connection to the broker. Sessions multiplex links
//! over it; sender and receiver links are each bound to one queue address.
//! Concrete transports wrap a protocol client; [`crate::providers::memory`]
//! implements them in-process for tests and development.

use crate::error::QueueError;
use crate::message::{AmqpMessage, Delivery};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// An open connection able to create sessions
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Begin a new session on this connection
    async fn open_session(&self) -> Result<Arc<dyn AmqpSession>, QueueError>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Close the connection and every session on it
    async fn close(&self) -> Result<(), QueueError>;
}

/// Protocol session under which links are attached
#[async_trait]
pub trait AmqpSession: Send + Sync {
    /// Identifier unique for the lifetime of the transport
    fn id(&self) -> &str;

    /// Attach a sender link named `name` to the queue at `address`
    async fn open_sender(
        &self,
        name: &str,
        address: &str,
    ) -> Result<Arc<dyn SenderLink>, QueueError>;

    /// Attach a receiver link named `name` to the queue at `address`
    async fn open_receiver(
        &self,
        name: &str,
        address: &str,
    ) -> Result<Arc<dyn ReceiverLink>, QueueError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Outgoing link bound to one queue
#[async_trait]
pub trait SenderLink: Send + Sync {
    fn name(&self) -> &str;

    /// Send a message and wait for the broker's disposition.
    ///
    /// Fails with [`QueueError::SendFailed`] when the broker does not accept it.
    async fn send(&self, message: AmqpMessage) -> Result<(), QueueError>;

    /// Whether independent `send` calls may be in flight at the same time.
    ///
    /// When `false`, callers must await each send before starting the next.
    fn supports_concurrent_sends(&self) -> bool;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Incoming link bound to one queue
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    fn name(&self) -> &str;

    /// Allow the broker to deliver `credit` messages ahead of settlement.
    ///
    /// With `auto_restore`, credit is given back as deliveries are settled.
    fn set_credit(&self, credit: u32, auto_restore: bool);

    /// Wait up to `timeout` for the next delivery; `None` on timeout
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Settle as processed; the broker forgets the message
    async fn accept(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Settle as not processed; the broker redelivers the message
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Settle as unprocessable; the broker dead-letters the message
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}
