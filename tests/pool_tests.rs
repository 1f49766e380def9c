use bounded_streams::error::{BoxError, PoolError};
use bounded_streams::pool::{Manager, ObjectPool};
use bounded_streams::stream_configuration::PoolConfig;
use async_trait::async_trait;
use futures::future::join_all;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_pending, assert_ready};

/// Hands out numbered connections and records every close
#[derive(Default)]
struct Counting {
    created: AtomicUsize,
    closed: AtomicUsize,
    fail_create: AtomicUsize,
    fail_close: bool,
}

struct CountingManager(Arc<Counting>);

#[async_trait]
impl Manager for CountingManager {
    type Object = usize;

    async fn create(&self) -> Result<usize, BoxError> {
        if self.0.fail_create.load(Ordering::SeqCst) > 0 {
            self.0.fail_create.fetch_sub(1, Ordering::SeqCst);
            return Err("connection refused".into());
        }
        Ok(self.0.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn close(&self, _object: usize) -> Result<(), BoxError> {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_close {
            Err("close failed".into())
        } else {
            Ok(())
        }
    }
}

fn counting_pool(config: PoolConfig) -> (ObjectPool<usize>, Arc<Counting>) {
    let counts = Arc::new(Counting::default());
    let pool = ObjectPool::new(config, CountingManager(Arc::clone(&counts))).unwrap();
    (pool, counts)
}

#[tokio::test]
async fn test_borrowers_beyond_capacity_reuse_instances() {
    let (pool, counts) = counting_pool(PoolConfig::new(3));

    // 3 + 5 concurrent borrowers; only 3 instances may ever exist
    let tasks = (0..8).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let object = pool.borrow().await.unwrap();
            sleep(Duration::from_millis(20)).await;
            let stats = pool.stats();
            assert!(stats.created <= 3);
            drop(object);
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(counts.created.load(Ordering::SeqCst), 3);
    let stats = pool.stats();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.free, 3);
    assert_eq!(stats.borrowed, 0);
}

#[tokio::test]
async fn test_extra_borrowers_wait_until_release() {
    let (pool, counts) = counting_pool(PoolConfig::new(3));
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.borrow().await.unwrap());
    }

    let mut waiting: Vec<_> = (0..5).map(|_| tokio_test::task::spawn(pool.borrow())).collect();
    for borrower in waiting.iter_mut() {
        assert_pending!(borrower.poll());
    }
    let stats = pool.stats();
    assert_eq!(stats.waiters, 5);
    assert_eq!(stats.created, 3);
    assert_eq!(stats.borrowed, 3);

    // Each release wakes exactly the oldest waiter, reusing the instance
    drop(held.pop());
    assert!(waiting[0].is_woken());
    let reused = assert_ready!(waiting[0].poll()).unwrap();
    for borrower in waiting.iter_mut().skip(1) {
        assert_pending!(borrower.poll());
    }
    assert_eq!(pool.stats().waiters, 4);
    assert_eq!(counts.created.load(Ordering::SeqCst), 3);

    drop(reused);
    drop(held);
    for borrower in waiting.iter_mut().skip(1) {
        let object = assert_ready!(borrower.poll()).unwrap();
        drop(object);
    }
    assert_eq!(counts.created.load(Ordering::SeqCst), 3);
    assert_eq!(pool.stats().free, 3);
}

#[tokio::test]
async fn test_release_hands_off_to_waiter() {
    let (pool, _) = counting_pool(PoolConfig::new(1));
    let first = pool.borrow().await.unwrap();
    let id = first.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow().await.map(|o| o.id()) })
    };
    sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().waiters, 1);

    pool.release(first).await.unwrap();
    let handed = timeout(Duration::from_millis(500), waiter).await.unwrap().unwrap();
    assert_eq!(handed.unwrap(), id);
}

#[tokio::test]
async fn test_try_borrow_never_creates() {
    let (pool, counts) = counting_pool(PoolConfig::new(2));
    assert!(pool.try_borrow().is_none());

    let object = pool.borrow().await.unwrap();
    drop(object);
    let again = pool.try_borrow().unwrap();
    assert_eq!(*again, 0);
    assert_eq!(counts.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn test_stale_instances_are_replaced_on_borrow() {
    let (pool, counts) = counting_pool(PoolConfig::new(1).max_age(Duration::from_millis(50)));

    let first = pool.borrow().await.unwrap();
    assert_eq!(*first, 0);
    drop(first);

    sleep(Duration::from_millis(100)).await;
    let second = pool.borrow().await.unwrap();
    assert_eq!(*second, 1);
    assert!(second.age() < Duration::from_millis(50));
    assert_eq!(counts.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().created, 1);
}

#[tokio::test]
#[serial]
async fn test_try_borrow_skips_stale_instances() {
    let (pool, counts) = counting_pool(PoolConfig::new(1).max_age(Duration::from_millis(30)));
    drop(pool.borrow().await.unwrap());
    sleep(Duration::from_millis(60)).await;

    assert!(pool.try_borrow().is_none());
    assert_eq!(pool.stats().created, 0);
    // Detached close runs on the runtime
    sleep(Duration::from_millis(20)).await;
    assert_eq!(counts.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_factory_failure_frees_capacity() {
    let (pool, counts) = counting_pool(PoolConfig::new(1));
    counts.fail_create.store(1, Ordering::SeqCst);

    let failed = pool.borrow().await;
    assert!(matches!(failed, Err(PoolError::Factory(_))));
    assert_eq!(pool.stats().created, 0);

    let object = pool.borrow().await.unwrap();
    assert_eq!(*object, 0);
}

#[tokio::test]
async fn test_close_closes_idle_now_and_borrowed_on_release() {
    let (pool, counts) = counting_pool(PoolConfig::new(2));
    let kept = pool.borrow().await.unwrap();
    let idle = pool.borrow().await.unwrap();
    drop(idle);

    pool.close().await.unwrap();
    assert!(pool.is_closed());
    assert_eq!(counts.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(pool.borrow().await, Err(PoolError::Closed)));
    assert!(pool.try_borrow().is_none());

    pool.release(kept).await.unwrap();
    assert_eq!(counts.closed.load(Ordering::SeqCst), 2);
    let stats = pool.stats();
    assert_eq!(stats.created, 0);
    assert_eq!(stats.borrowed, 0);
}

#[tokio::test]
async fn test_close_rejects_waiters() {
    let (pool, _) = counting_pool(PoolConfig::new(1));
    let _held = pool.borrow().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow().await.map(|o| *o) })
    };
    sleep(Duration::from_millis(20)).await;
    pool.close().await.unwrap();

    let result = timeout(Duration::from_millis(500), waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
}

#[tokio::test]
async fn test_close_failures_are_collected() {
    let counts = Arc::new(Counting {
        fail_close: true,
        ..Default::default()
    });
    let pool = ObjectPool::new(PoolConfig::new(2), CountingManager(Arc::clone(&counts))).unwrap();
    let a = pool.borrow().await.unwrap();
    let b = pool.borrow().await.unwrap();
    drop(a);
    drop(b);

    match pool.close().await {
        Err(PoolError::CloseFailed(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected CloseFailed, got {:?}", other.map(|_| ())),
    }
    assert_eq!(counts.closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancelled_borrow_returns_instance() {
    let (pool, _) = counting_pool(PoolConfig::new(1));
    let held = pool.borrow().await.unwrap();

    assert!(timeout(Duration::from_millis(20), pool.borrow()).await.is_err());
    drop(held);

    let stats = pool.stats();
    assert_eq!(stats.free, 1);
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.waiters, 0);
}

#[tokio::test]
async fn test_detach_frees_capacity() {
    let (pool, counts) = counting_pool(PoolConfig::new(1));
    let object = pool.borrow().await.unwrap();
    assert_eq!(object.detach(), Some(0));
    assert_eq!(pool.stats().created, 0);

    let next = pool.borrow().await.unwrap();
    assert_eq!(*next, 1);
    assert_eq!(counts.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_with_object_and_concurrency_info() {
    let pool = ObjectPool::from_fns(
        PoolConfig::new(2),
        || async { Ok::<_, BoxError>(String::from("conn")) },
        |_conn: String| async { Ok::<(), BoxError>(()) },
    )
    .unwrap();

    let len = pool
        .with_object(|conn| async move {
            assert_eq!(&*conn, "conn");
            conn.len()
        })
        .await
        .unwrap();
    assert_eq!(len, 4);

    let info = pool.concurrency_info();
    assert_eq!(info.total_permits, 2);
    assert_eq!(info.available_permits, 2);
}
