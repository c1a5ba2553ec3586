//! Connection handle shared by the push and pull storages.
//!
//! [`ConnectionAmqp`] is the contract the storages depend on: an idempotent
//! `init`, a health check and access to the live transport. The provided
//! [`RetryingConnection`] implements it on top of any [`Connector`], making up
//! to `MaxRetries` connection attempts with exponential backoff. Failures the
//! broker will not get over by itself, such as refused credentials, end the
//! attempts immediately.

use crate::error::QueueError;
use crate::health::{HealthCheckResult, HealthCheckTag};
use crate::options::{AmqpAddress, QueueOptions};
use crate::retry::ConnectBackoff;
use crate::transport::AmqpTransport;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Handle on the broker connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionAmqp: Send + Sync {
    /// Establish the connection. Calls after a successful one are no-ops.
    async fn init(&self, cancellation: &CancellationToken) -> Result<(), QueueError>;

    async fn check(&self, tag: HealthCheckTag) -> HealthCheckResult;

    /// The live transport; fails before a successful `init`
    fn transport(&self) -> Result<Arc<dyn AmqpTransport>, QueueError>;
}

/// Makes a single connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &AmqpAddress) -> Result<Arc<dyn AmqpTransport>, QueueError>;
}

/// [`ConnectionAmqp`] retrying failed connection attempts
pub struct RetryingConnection<C> {
    connector: C,
    address: AmqpAddress,
    backoff: ConnectBackoff,
    transport: OnceCell<Arc<dyn AmqpTransport>>,
}

impl<C: Connector> RetryingConnection<C> {
    /// Create a connection from validated options.
    pub fn new(options: &QueueOptions, connector: C) -> Result<Self, QueueError> {
        options.validate()?;
        Ok(Self {
            connector,
            address: options.address(),
            backoff: ConnectBackoff::from_options(options),
            transport: OnceCell::new(),
        })
    }

    async fn connect_with_retry(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<Arc<dyn AmqpTransport>, QueueError> {
        let mut attempt = 1;
        loop {
            if cancellation.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            match self.connector.connect(&self.address).await {
                Ok(transport) => {
                    info!(address = %self.address, attempts = attempt, "AMQP connection established");
                    return Ok(transport);
                }
                Err(e) if !e.is_transient() => {
                    error!(
                        address = %self.address,
                        attempt,
                        error = %e,
                        "AMQP connection refused, not retrying"
                    );
                    return Err(e);
                }
                Err(e) if self.backoff.allows_retry_after(attempt) => {
                    let delay = self.backoff.delay_after(attempt);
                    warn!(
                        address = %self.address,
                        attempt,
                        max_attempts = self.backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "AMQP connection attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = cancellation.cancelled() => return Err(QueueError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        address = %self.address,
                        attempts = attempt,
                        error = %e,
                        "AMQP connection failed"
                    );
                    return Err(QueueError::ConnectionFailed {
                        message: format!(
                            "could not connect to {} after {} attempts: {}",
                            self.address, attempt, e
                        ),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl<C: Connector> ConnectionAmqp for RetryingConnection<C> {
    async fn init(&self, cancellation: &CancellationToken) -> Result<(), QueueError> {
        self.transport
            .get_or_try_init(|| self.connect_with_retry(cancellation))
            .await?;
        Ok(())
    }

    async fn check(&self, tag: HealthCheckTag) -> HealthCheckResult {
        match self.transport.get() {
            None => HealthCheckResult::not_initialized("ConnectionAmqp", tag),
            Some(transport) if transport.is_open() => HealthCheckResult::healthy(),
            Some(_) => HealthCheckResult::unhealthy("AMQP connection is closed"),
        }
    }

    fn transport(&self) -> Result<Arc<dyn AmqpTransport>, QueueError> {
        self.transport
            .get()
            .cloned()
            .ok_or_else(|| QueueError::not_initialized("ConnectionAmqp"))
    }
}
