//! In-memory AMQP broker for testing and development.
//!
//! This module provides an in-process broker implementing the transport
//! traits with the semantics the storages rely on:
//! - Priority-ordered queues (higher header priority first, FIFO within a priority)
//! - Credit-limited receivers; with auto-restore, credit comes back on settlement
//! - Accept / release / reject settlement, with a dead letter list per queue
//! - Unsettled deliveries return to their queue when the receiver link closes
//! - Session and link bookkeeping, plus failure injection for tests
//!   (refused connections, rejected users, blocked receivers, rejected payloads)
//!
//! This provider is intended for:
//! - Unit and integration testing of the storages
//! - Development without a running broker

use crate::connection::Connector;
use crate::error::QueueError;
use crate::message::{AmqpMessage, Delivery, MessageBody, MessageId, Timestamp};
use crate::options::AmqpAddress;
use crate::transport::{AmqpSession, AmqpTransport, ReceiverLink, SenderLink};
use async_trait::async_trait;
use bytes::Bytes;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in a queue with its ordering metadata
#[derive(Debug, Clone)]
struct StoredMessage {
    message: AmqpMessage,
    sequence: u64,
    delivery_count: u32,
}

impl PartialEq for StoredMessage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for StoredMessage {}

impl PartialOrd for StoredMessage {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for StoredMessage {
    // Max-heap: higher priority first, then lower sequence (older) first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.message
            .priority()
            .cmp(&other.message.priority())
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueInner {
    messages: BinaryHeap<StoredMessage>,
    dead_letter: Vec<StoredMessage>,
    /// Deliveries handed to receivers and not yet settled
    in_flight: usize,
}

/// Internal queue state for a single queue address
#[derive(Default)]
struct InMemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl InMemoryQueue {
    fn push(&self, message: StoredMessage) {
        lock(&self.inner).messages.push(message);
        self.notify.notify_waiters();
    }
}

/// Thread-safe storage shared by every transport of a broker
#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<InMemoryQueue>>>,
    transports: Mutex<Vec<Arc<InMemoryTransport>>>,
    rejected_payloads: Mutex<HashSet<Bytes>>,
    blocked_receivers: Mutex<HashSet<String>>,
    rejected_users: Mutex<HashSet<String>>,
    next_sequence: AtomicU64,
    failed_connects_remaining: AtomicU32,
    connect_attempts: AtomicU32,
    sessions_opened: AtomicU32,
    senders_opened: AtomicU32,
    receivers_opened: AtomicU32,
    accepted_sends: AtomicU32,
    max_senders_per_session: AtomicUsize,
    serialize_sends: AtomicBool,
    concurrent_sends_in_flight: AtomicUsize,
    max_concurrent_sends: AtomicUsize,
}

impl BrokerState {
    fn queue(&self, address: &str) -> Arc<InMemoryQueue> {
        Arc::clone(
            lock(&self.queues)
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(InMemoryQueue::default())),
        )
    }

    fn store(&self, message: AmqpMessage) -> StoredMessage {
        StoredMessage {
            message,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            delivery_count: 0,
        }
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-process broker; cloning yields another handle on the same broker.
///
/// The broker is its own [`Connector`]: every successful `connect` returns a
/// new [`InMemoryTransport`] over the shared queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message directly, bypassing links
    pub fn enqueue(&self, address: &str, message: AmqpMessage) {
        let stored = self.state.store(message);
        self.state.queue(address).push(stored);
    }

    /// Messages waiting in `address`, in delivery order
    pub fn messages(&self, address: &str) -> Vec<AmqpMessage> {
        let queue = self.state.queue(address);
        let inner = lock(&queue.inner);
        let mut messages = inner.messages.clone().into_sorted_vec();
        messages.reverse();
        messages.into_iter().map(|stored| stored.message).collect()
    }

    pub fn queue_len(&self, address: &str) -> usize {
        lock(&self.state.queue(address).inner).messages.len()
    }

    pub fn dead_letter_len(&self, address: &str) -> usize {
        lock(&self.state.queue(address).inner).dead_letter.len()
    }

    /// Deliveries of `address` held by receivers and not settled yet
    pub fn in_flight(&self, address: &str) -> usize {
        lock(&self.state.queue(address).inner).in_flight
    }

    /// Make the broker refuse every message whose body equals `payload`
    pub fn reject_payload(&self, payload: impl Into<Bytes>) {
        lock(&self.state.rejected_payloads).insert(payload.into());
    }

    /// Refuse receiver links on `address` until [`Self::unblock_receivers`]
    pub fn block_receivers(&self, address: &str) {
        lock(&self.state.blocked_receivers).insert(address.to_string());
    }

    pub fn unblock_receivers(&self, address: &str) {
        lock(&self.state.blocked_receivers).remove(address);
    }

    /// Fail authentication for `user` on every connection attempt
    pub fn reject_user(&self, user: &str) {
        lock(&self.state.rejected_users).insert(user.to_string());
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.state
            .failed_connects_remaining
            .store(count, Ordering::SeqCst);
    }

    /// Advertise sender links as unsafe for concurrent sends
    pub fn serialize_sends(&self, serialize: bool) {
        self.state.serialize_sends.store(serialize, Ordering::SeqCst);
    }

    /// Close every connection opened so far, with their sessions
    pub fn close_connections(&self) {
        for transport in lock(&self.state.transports).iter() {
            transport.shutdown();
        }
    }

    /// Close every session opened so far, leaving connections open
    pub fn close_sessions(&self) {
        for transport in lock(&self.state.transports).iter() {
            for session in lock(&transport.sessions).iter() {
                session.closed.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Sessions opened and not closed yet
    pub fn open_sessions(&self) -> usize {
        self.sessions()
            .iter()
            .filter(|session| !session.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Sender links not closed yet, across all sessions
    pub fn open_senders(&self) -> usize {
        self.sessions()
            .iter()
            .map(|session| session.open_senders.load(Ordering::SeqCst))
            .sum()
    }

    /// Receiver links not closed yet, across all sessions
    pub fn open_receivers(&self) -> usize {
        self.sessions()
            .iter()
            .map(|session| session.open_receivers.load(Ordering::SeqCst))
            .sum()
    }

    fn sessions(&self) -> Vec<Arc<SessionState>> {
        lock(&self.state.transports)
            .iter()
            .flat_map(|transport| lock(&transport.sessions).clone())
            .collect()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> u32 {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn senders_opened(&self) -> u32 {
        self.state.senders_opened.load(Ordering::SeqCst)
    }

    pub fn receivers_opened(&self) -> u32 {
        self.state.receivers_opened.load(Ordering::SeqCst)
    }

    /// Messages the broker accepted from sender links
    pub fn accepted_sends(&self) -> u32 {
        self.state.accepted_sends.load(Ordering::SeqCst)
    }

    /// Highest number of sender links seen open at once on a single session
    pub fn max_senders_per_session(&self) -> usize {
        self.state.max_senders_per_session.load(Ordering::SeqCst)
    }

    /// Highest number of sends seen in flight at once across all links
    pub fn max_concurrent_sends(&self) -> usize {
        self.state.max_concurrent_sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, address: &AmqpAddress) -> Result<Arc<dyn AmqpTransport>, QueueError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .state
            .failed_connects_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::ConnectionFailed {
                message: format!("connection to {} refused", address),
            });
        }

        if lock(&self.state.rejected_users).contains(address.user()) {
            return Err(QueueError::AuthenticationFailed {
                message: format!("user '{}' was refused by {}", address.user(), address),
            });
        }

        let transport = Arc::new(InMemoryTransport {
            broker: Arc::clone(&self.state),
            open: AtomicBool::new(true),
            sessions: Mutex::new(Vec::new()),
        });
        lock(&self.state.transports).push(Arc::clone(&transport));
        debug!(address = %address, "In-memory connection opened");
        Ok(transport)
    }
}

// ============================================================================
// Transport and Session
// ============================================================================

/// Connection to an [`InMemoryBroker`]
pub struct InMemoryTransport {
    broker: Arc<BrokerState>,
    open: AtomicBool,
    sessions: Mutex<Vec<Arc<SessionState>>>,
}

impl InMemoryTransport {
    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        for session in lock(&self.sessions).iter() {
            session.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AmqpTransport for InMemoryTransport {
    async fn open_session(&self) -> Result<Arc<dyn AmqpSession>, QueueError> {
        if !self.is_open() {
            return Err(QueueError::ConnectionFailed {
                message: "connection is closed".to_string(),
            });
        }

        let number = self.broker.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(SessionState {
            id: format!("session-{number}"),
            closed: AtomicBool::new(false),
            open_senders: AtomicUsize::new(0),
            open_receivers: AtomicUsize::new(0),
        });
        lock(&self.sessions).push(Arc::clone(&state));
        trace!(session = %state.id, "In-memory session opened");

        Ok(Arc::new(InMemorySession {
            broker: Arc::clone(&self.broker),
            state,
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.shutdown();
        Ok(())
    }
}

struct SessionState {
    id: String,
    closed: AtomicBool,
    open_senders: AtomicUsize,
    open_receivers: AtomicUsize,
}

impl SessionState {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::SessionClosed);
        }
        Ok(())
    }
}

struct InMemorySession {
    broker: Arc<BrokerState>,
    state: Arc<SessionState>,
}

#[async_trait]
impl AmqpSession for InMemorySession {
    fn id(&self) -> &str {
        &self.state.id
    }

    async fn open_sender(
        &self,
        name: &str,
        address: &str,
    ) -> Result<Arc<dyn SenderLink>, QueueError> {
        self.state.ensure_open()?;

        let open = self.state.open_senders.fetch_add(1, Ordering::SeqCst) + 1;
        self.broker
            .max_senders_per_session
            .fetch_max(open, Ordering::SeqCst);
        self.broker.senders_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(InMemorySenderLink {
            name: name.to_string(),
            queue: self.broker.queue(address),
            broker: Arc::clone(&self.broker),
            session: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_receiver(
        &self,
        name: &str,
        address: &str,
    ) -> Result<Arc<dyn ReceiverLink>, QueueError> {
        self.state.ensure_open()?;
        if lock(&self.broker.blocked_receivers).contains(address) {
            return Err(QueueError::LinkClosed {
                link: name.to_string(),
            });
        }
        self.broker.receivers_opened.fetch_add(1, Ordering::SeqCst);
        self.state.open_receivers.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(InMemoryReceiverLink {
            name: name.to_string(),
            queue: self.broker.queue(address),
            session: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
            auto_restore: AtomicBool::new(false),
            state: Mutex::new(ReceiverState::default()),
        }))
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Sender Link
// ============================================================================

struct InMemorySenderLink {
    name: String,
    queue: Arc<InMemoryQueue>,
    broker: Arc<BrokerState>,
    session: Arc<SessionState>,
    closed: AtomicBool,
}

impl InMemorySenderLink {
    fn is_rejected(&self, message: &AmqpMessage) -> bool {
        match &message.body {
            MessageBody::Data(bytes) => lock(&self.broker.rejected_payloads).contains(bytes),
            _ => false,
        }
    }
}

#[async_trait]
impl SenderLink for InMemorySenderLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: AmqpMessage) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::LinkClosed {
                link: self.name.clone(),
            });
        }
        self.session.ensure_open()?;

        let in_flight = self
            .broker
            .concurrent_sends_in_flight
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        self.broker
            .max_concurrent_sends
            .fetch_max(in_flight, Ordering::SeqCst);

        // Round trip to the broker
        tokio::task::yield_now().await;

        self.broker
            .concurrent_sends_in_flight
            .fetch_sub(1, Ordering::SeqCst);

        if self.is_rejected(&message) {
            return Err(QueueError::SendFailed {
                failed: 1,
                total: 1,
                message: format!("message rejected by broker on link '{}'", self.name),
            });
        }

        self.broker.accepted_sends.fetch_add(1, Ordering::SeqCst);
        self.queue.push(self.broker.store(message));
        Ok(())
    }

    fn supports_concurrent_sends(&self) -> bool {
        !self.broker.serialize_sends.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.session.open_senders.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ============================================================================
// Receiver Link
// ============================================================================

#[derive(Default)]
struct ReceiverState {
    /// Deliveries prefetched under the link credit
    buffer: VecDeque<(Delivery, StoredMessage)>,
    /// Deliveries handed to the caller, keyed by delivery id
    unsettled: HashMap<MessageId, StoredMessage>,
    available_credit: u32,
}

impl ReceiverState {
    fn outstanding(&self) -> u32 {
        (self.buffer.len() + self.unsettled.len()) as u32
    }
}

struct InMemoryReceiverLink {
    name: String,
    queue: Arc<InMemoryQueue>,
    session: Arc<SessionState>,
    closed: AtomicBool,
    auto_restore: AtomicBool,
    state: Mutex<ReceiverState>,
}

impl InMemoryReceiverLink {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::LinkClosed {
                link: self.name.clone(),
            });
        }
        self.session.ensure_open()
    }

    /// Prefetch under the remaining credit, then hand out the oldest delivery
    fn try_take(&self) -> Option<Delivery> {
        let mut state = lock(&self.state);
        {
            let mut queue = lock(&self.queue.inner);
            while state.available_credit > 0 {
                let Some(stored) = queue.messages.pop() else {
                    break;
                };
                queue.in_flight += 1;
                state.available_credit -= 1;
                let delivery = Delivery {
                    delivery_id: MessageId::new(),
                    message: stored.message.clone(),
                    delivery_count: stored.delivery_count,
                    received_at: Timestamp::now(),
                };
                state.buffer.push_back((delivery, stored));
            }
        }

        let (delivery, stored) = state.buffer.pop_front()?;
        state
            .unsettled
            .insert(delivery.delivery_id.clone(), stored);
        Some(delivery)
    }

    fn settle(&self, delivery: &Delivery) -> Result<StoredMessage, QueueError> {
        let mut state = lock(&self.state);
        let stored = state
            .unsettled
            .remove(&delivery.delivery_id)
            .ok_or_else(|| QueueError::SettlementFailed {
                message_id: delivery.delivery_id.to_string(),
                message: format!("delivery is not pending on link '{}'", self.name),
            })?;

        if self.auto_restore.load(Ordering::SeqCst) {
            state.available_credit += 1;
        }
        let mut queue = lock(&self.queue.inner);
        queue.in_flight = queue.in_flight.saturating_sub(1);
        Ok(stored)
    }
}

#[async_trait]
impl ReceiverLink for InMemoryReceiverLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_credit(&self, credit: u32, auto_restore: bool) {
        let mut state = lock(&self.state);
        state.available_credit = credit.saturating_sub(state.outstanding());
        self.auto_restore.store(auto_restore, Ordering::SeqCst);
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.ensure_open()?;

            // Register interest before looking, so a concurrent push is not missed
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn accept(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery)?;
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut stored = self.settle(delivery)?;
        stored.delivery_count += 1;
        self.queue.push(stored);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let stored = self.settle(delivery)?;
        debug!(link = %self.name, message_id = %delivery.delivery_id, reason, "Message dead-lettered");
        lock(&self.queue.inner).dead_letter.push(stored);
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.open_receivers.fetch_sub(1, Ordering::SeqCst);

        let returned: Vec<StoredMessage> = {
            let mut state = lock(&self.state);
            let buffered = state.buffer.drain(..).map(|(_, stored)| stored);
            let mut returned: Vec<StoredMessage> = buffered.collect();
            returned.extend(state.unsettled.drain().map(|(_, stored)| stored));
            returned
        };

        {
            let mut queue = lock(&self.queue.inner);
            queue.in_flight = queue.in_flight.saturating_sub(returned.len());
            for mut stored in returned {
                stored.delivery_count += 1;
                queue.messages.push(stored);
            }
        }
        self.queue.notify.notify_waiters();
        Ok(())
    }
}
