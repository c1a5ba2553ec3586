//! Tests for the session pool.

use super::*;
use crate::connection::RetryingConnection;
use crate::options::{QueueOptions, Secret};
use crate::providers::InMemoryBroker;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

async fn connected(broker: &InMemoryBroker) -> Arc<dyn ConnectionAmqp> {
    let options = QueueOptions {
        host: "localhost".to_string(),
        port: 5672,
        user: "guest".to_string(),
        password: Secret::new("guest"),
        max_retries: 1,
        max_priority: 10,
        ..Default::default()
    };
    let connection = RetryingConnection::new(&options, broker.clone()).expect("valid options");
    connection
        .init(&CancellationToken::new())
        .await
        .expect("connection should open");
    Arc::new(connection)
}

#[tokio::test]
async fn test_miss_opens_new_session() {
    let broker = InMemoryBroker::new();
    let pool = SessionPool::new(connected(&broker).await, 4);

    let session = pool.acquire().await.unwrap();

    assert_eq!(pool.created(), 1);
    assert_eq!(pool.checked_out(), 1);
    assert_eq!(pool.idle(), 0);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_dropped_guard_returns_session_for_reuse() {
    let broker = InMemoryBroker::new();
    let pool = SessionPool::new(connected(&broker).await, 4);

    let first_id = {
        let session = pool.acquire().await.unwrap();
        session.id().to_string()
    };
    assert_eq!(pool.idle(), 1);
    assert_eq!(pool.checked_out(), 0);

    let session = pool.acquire().await.unwrap();

    assert_eq!(session.id(), first_id);
    assert_eq!(pool.created(), 1);
    assert_eq!(broker.sessions_opened(), 1);
}

#[tokio::test]
async fn test_closed_sessions_are_discarded() {
    let broker = InMemoryBroker::new();
    let pool = SessionPool::new(connected(&broker).await, 4);
    let first_id = {
        let session = pool.acquire().await.unwrap();
        session.id().to_string()
    };

    broker.close_sessions();
    let session = pool.acquire().await.unwrap();

    assert_ne!(session.id(), first_id);
    assert_eq!(pool.created(), 2);
}

#[tokio::test]
async fn test_session_closed_while_checked_out_is_not_returned() {
    let broker = InMemoryBroker::new();
    let pool = SessionPool::new(connected(&broker).await, 4);

    {
        let session = pool.acquire().await.unwrap();
        session.close().await.unwrap();
    }

    assert_eq!(pool.idle(), 0);
    assert_eq!(pool.checked_out(), 0);
}

#[tokio::test]
async fn test_capacity_is_advisory() {
    let broker = InMemoryBroker::new();
    let pool = SessionPool::new(connected(&broker).await, 1);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    let third = pool.acquire().await.unwrap();
    assert_eq!(pool.checked_out(), 3);

    drop(first);
    drop(second);
    drop(third);

    assert_eq!(pool.idle(), 1, "only `capacity` sessions are kept");
    assert_eq!(pool.checked_out(), 0);
}

#[tokio::test]
async fn test_concurrent_checkouts_are_exclusive() {
    let broker = InMemoryBroker::new();
    let pool = Arc::new(SessionPool::new(connected(&broker).await, 3));
    let barrier = Arc::new(tokio::sync::Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let session = pool.acquire().await.expect("acquire");
                // Hold every session until all tasks have one
                barrier.wait().await;
                session.id().to_string()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        assert!(ids.insert(handle.await.unwrap()), "session handed out twice");
    }

    assert_eq!(ids.len(), 8);
    assert_eq!(pool.checked_out(), 0);
    assert_eq!(pool.idle(), 3);
}

#[tokio::test]
async fn test_acquire_before_connection_init_fails() {
    let broker = InMemoryBroker::new();
    let options = QueueOptions {
        host: "localhost".to_string(),
        port: 5672,
        user: "guest".to_string(),
        password: Secret::new("guest"),
        max_retries: 1,
        max_priority: 10,
        ..Default::default()
    };
    let connection = RetryingConnection::new(&options, broker.clone()).unwrap();
    let pool = SessionPool::new(Arc::new(connection), 2);

    let result = pool.acquire().await;

    assert!(matches!(result, Err(QueueError::NotInitialized { .. })));
    assert_eq!(broker.connect_attempts(), 0);
}
