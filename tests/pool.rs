//! Pool behavior with in-memory connectors.
//!
//! ## Test Matrix
//!
//! - `test_two_sessions_serve_three_queries` - pool(2) under three concurrent callers
//! - `test_fifo_handoff` - released sessions go to the oldest waiter
//! - `test_release_is_idempotent` - second release is a no-op, handle is detached
//! - `test_waiter_limit` - `PoolExhausted` once max waiters are queued
//! - `test_abandoned_waiter_does_not_leak` - a timed-out acquire leaves the session idle
//! - `test_validation_retries_connect` - dead idle session replaced after refused attempts
//! - `test_validation_gives_up` - retries exhausted surfaces the error and frees the slot
//! - `test_validation_ping_times_out` - an unanswered ping counts as a dead session
//! - `test_broken_session_replaced_for_waiter` - waiter gets a fresh session
//! - `test_idle_timeout_evicts` - expired idle sessions are closed, not handed out
//! - `test_close_fails_waiters` - closing the pool wakes waiters with an error

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use zero_sqlclient::tokio::{Pool, PoolStatus};
use zero_sqlclient::{Error, Opts};

fn pool_opts(max_size: usize) -> Opts {
    Opts {
        pool_max_size: max_size,
        pool_validation_threshold: None,
        ..opts(4)
    }
}

async fn wait_for_waiters(pool: &Pool, waiting: usize) {
    while pool.status().waiting < waiting {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_two_sessions_serve_three_queries() {
    let connector = FakeConnector::healthy(pool_opts(2));
    let connects = Arc::clone(&connector.connects);
    let pool = Pool::with_connector(pool_opts(2), connector).unwrap();

    let mut tasks = Vec::new();
    for i in 0..3 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await?;
            let result = conn.query(&format!("SELECT {}", i)).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            result.rows[0].get::<i32>(0)
        }));
    }
    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await.unwrap().unwrap());
    }
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 2]);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        pool.status(),
        PoolStatus {
            live: 2,
            idle: 2,
            waiting: 0
        }
    );
}

#[tokio::test]
async fn test_fifo_handoff() {
    let pool = Pool::with_connector(pool_opts(1), FakeConnector::healthy(pool_opts(1))).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire().await.unwrap();
    let mut waiters = Vec::new();
    for name in ["b", "c", "d"] {
        let task_pool = pool.clone();
        let order = Arc::clone(&order);
        let expected = waiters.len() + 1;
        waiters.push(tokio::spawn(async move {
            let conn = task_pool.acquire().await.unwrap();
            order.lock().unwrap().push(name);
            conn.ping().await.unwrap();
        }));
        wait_for_waiters(&pool, expected).await;
    }

    drop(held);
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["b", "c", "d"]);
    assert_eq!(pool.status().live, 1);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let connector = FakeConnector::healthy(pool_opts(1));
    let connects = Arc::clone(&connector.connects);
    let pool = Pool::with_connector(pool_opts(1), connector).unwrap();

    let mut conn = pool.acquire().await.unwrap();
    conn.ping().await.unwrap();
    conn.release();
    conn.release();
    assert_eq!(pool.status().idle, 1);
    assert!(matches!(conn.ping().await, Err(Error::ConnectionLost)));
    drop(conn);
    assert_eq!(
        pool.status(),
        PoolStatus {
            live: 1,
            idle: 1,
            waiting: 0
        }
    );

    let again = pool.acquire().await.unwrap();
    again.ping().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_waiter_limit() {
    let opts = Opts {
        pool_max_waiters: Some(1),
        ..pool_opts(1)
    };
    let pool = Pool::with_connector(opts.clone(), FakeConnector::healthy(opts)).unwrap();
    let _held = pool.acquire().await.unwrap();

    let queued = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(drop) }
    });
    wait_for_waiters(&pool, 1).await;

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { waiters: 1 }));
    queued.abort();
}

#[tokio::test]
async fn test_abandoned_waiter_does_not_leak() {
    let pool = Pool::with_connector(pool_opts(1), FakeConnector::healthy(pool_opts(1))).unwrap();
    let held = pool.acquire().await.unwrap();

    let gave_up = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(gave_up.is_err());

    drop(held);
    assert_eq!(pool.status().idle, 1);
    let conn = pool.acquire().await.unwrap();
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn test_validation_retries_connect() {
    let opts = Opts {
        pool_validation_threshold: Some(Duration::ZERO),
        pool_validation_retries: 3,
        ..pool_opts(1)
    };
    let connector = FakeConnector::with_plan(opts.clone(), |n| match n {
        0 => Plan::HangUp,
        1 | 2 => Plan::Refuse,
        _ => Plan::Serve,
    });
    let connects = Arc::clone(&connector.connects);
    let pool = Pool::with_connector(opts, connector).unwrap();

    // fresh sessions are not validated
    drop(pool.acquire().await.unwrap());
    assert_eq!(pool.status().idle, 1);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 4);
    conn.ping().await.unwrap();
    assert_eq!(pool.status().live, 1);
}

#[tokio::test]
async fn test_validation_ping_times_out() {
    let opts = Opts {
        pool_validation_threshold: Some(Duration::ZERO),
        pool_validation_timeout: Duration::from_millis(50),
        pool_validation_retries: 1,
        ..pool_opts(1)
    };
    let connector = FakeConnector::with_plan(opts.clone(), |n| match n {
        0 => Plan::Silent,
        _ => Plan::Serve,
    });
    let connects = Arc::clone(&connector.connects);
    let pool = Pool::with_connector(opts, connector).unwrap();

    drop(pool.acquire().await.unwrap());
    let conn = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    conn.ping().await.unwrap();
    assert_eq!(pool.status().live, 1);
}

#[tokio::test]
async fn test_validation_gives_up() {
    let opts = Opts {
        pool_validation_threshold: Some(Duration::ZERO),
        pool_validation_retries: 2,
        ..pool_opts(1)
    };
    let connector = FakeConnector::with_plan(opts.clone(), |n| {
        if n == 0 { Plan::HangUp } else { Plan::Refuse }
    });
    let connects = Arc::clone(&connector.connects);
    let pool = Pool::with_connector(opts, connector).unwrap();

    drop(pool.acquire().await.unwrap());
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert_eq!(pool.status().live, 0);
}

#[tokio::test]
async fn test_broken_session_replaced_for_waiter() {
    let connector = FakeConnector::with_plan(pool_opts(1), |n| {
        if n == 0 { Plan::HangUp } else { Plan::Serve }
    });
    let connects = Arc::clone(&connector.connects);
    let pool = Pool::with_connector(pool_opts(1), connector).unwrap();

    let doomed = pool.acquire().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move {
            let conn = pool.acquire().await?;
            conn.query("SELECT 'replacement'").await
        }
    });
    wait_for_waiters(&pool, 1).await;

    assert!(matches!(doomed.ping().await, Err(Error::ConnectionLost)));
    doomed.close().await.unwrap();
    drop(doomed);

    let result = waiter.await.unwrap().unwrap();
    assert_eq!(result.rows[0].get::<&str>(0).unwrap(), "replacement");
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(pool.status().live, 1);
}

#[tokio::test]
async fn test_idle_timeout_evicts() {
    let opts = Opts {
        pool_idle_timeout: Some(Duration::from_millis(10)),
        ..pool_opts(2)
    };
    let connector = FakeConnector::healthy(opts.clone());
    let connects = Arc::clone(&connector.connects);
    let pool = Pool::with_connector(opts, connector).unwrap();

    drop(pool.acquire().await.unwrap());
    tokio::time::sleep(Duration::from_millis(30)).await;

    let conn = pool.acquire().await.unwrap();
    conn.ping().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(pool.status().live, 1);
}

#[tokio::test]
async fn test_close_fails_waiters() {
    let pool = Pool::with_connector(pool_opts(1), FakeConnector::healthy(pool_opts(1))).unwrap();
    let held = pool.acquire().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(drop) }
    });
    wait_for_waiters(&pool, 1).await;

    pool.close();
    assert!(matches!(waiter.await.unwrap(), Err(Error::InvalidUsage(_))));
    assert!(matches!(pool.acquire().await, Err(Error::InvalidUsage(_))));

    drop(held);
    assert_eq!(pool.status().live, 0);
}
