//! Pool of reusable sessions for push calls.
//!
//! Opening a session costs a broker round trip, so push calls borrow one from
//! the pool and give it back when done. The capacity is advisory: a miss
//! always opens a new session rather than waiting, and sessions given back to
//! a full pool are dropped. Sessions the broker closed are discarded instead
//! of being handed out again.

use crate::connection::ConnectionAmqp;
use crate::error::QueueError;
use crate::transport::AmqpSession;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

#[cfg(test)]
#[path = "session_pool_tests.rs"]
mod tests;

pub struct SessionPool {
    connection: Arc<dyn ConnectionAmqp>,
    capacity: usize,
    idle: Mutex<Vec<Arc<dyn AmqpSession>>>,
    checked_out: AtomicUsize,
    created: AtomicUsize,
}

impl SessionPool {
    pub fn new(connection: Arc<dyn ConnectionAmqp>, capacity: usize) -> Self {
        Self {
            connection,
            capacity: capacity.max(1),
            idle: Mutex::new(Vec::new()),
            checked_out: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        }
    }

    fn idle_sessions(&self) -> MutexGuard<'_, Vec<Arc<dyn AmqpSession>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow a session, opening a new one when no open idle session exists.
    ///
    /// The session goes back to the pool when the returned guard is dropped.
    pub async fn acquire(&self) -> Result<PooledSession<'_>, QueueError> {
        let reused = {
            let mut idle = self.idle_sessions();
            let mut found = None;
            while let Some(session) = idle.pop() {
                if session.is_closed() {
                    debug!(session = session.id(), "Discarding closed pooled session");
                    continue;
                }
                found = Some(session);
                break;
            }
            found
        };

        let session = match reused {
            Some(session) => session,
            None => {
                let session = self.connection.transport()?.open_session().await?;
                self.created.fetch_add(1, Ordering::SeqCst);
                trace!(session = session.id(), "Opened pooled session");
                session
            }
        };

        self.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(PooledSession {
            pool: self,
            session,
        })
    }

    fn give_back(&self, session: Arc<dyn AmqpSession>) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);

        if session.is_closed() {
            debug!(session = session.id(), "Dropping closed session instead of pooling it");
            return;
        }

        let mut idle = self.idle_sessions();
        if idle.len() < self.capacity {
            idle.push(session);
        } else {
            trace!(session = session.id(), capacity = self.capacity, "Session pool full");
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions waiting in the pool
    pub fn idle(&self) -> usize {
        self.idle_sessions().len()
    }

    /// Sessions currently borrowed
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Sessions opened by this pool so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

/// A session borrowed from a [`SessionPool`], returned on drop
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Arc<dyn AmqpSession>,
}

impl Deref for PooledSession<'_> {
    type Target = dyn AmqpSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        self.pool.give_back(Arc::clone(&self.session));
    }
}
