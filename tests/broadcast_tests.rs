use bounded_streams::broadcast::{broadcast, try_broadcast};
use bounded_streams::error::StreamError;
use bounded_streams::stream_configuration::{BranchBuffer, BroadcastConfig};
use bounded_streams::{BoundedResultStreamExt, BoundedStreamExt};
use futures::future::join_all;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn counted(n: usize, pulled: &Arc<AtomicUsize>) -> bounded_streams::FlowStream<usize> {
    let counter = Arc::clone(pulled);
    stream::iter(0..n)
        .inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .boxed()
}

#[tokio::test]
async fn test_every_branch_sees_every_item_in_order() {
    let branches = broadcast(
        stream::iter(vec![1, 2, 3]).boxed(),
        BroadcastConfig::uniform(3, BranchBuffer::Bounded(1)),
    );
    assert_eq!(branches.len(), 3);

    let collected = join_all(branches.into_iter().map(|b| b.collect::<Vec<i32>>())).await;
    for items in collected {
        assert_eq!(items, vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn test_unread_bounded_branch_stalls_upstream() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let mut branches = broadcast(counted(100, &pulled), BroadcastConfig::uniform(2, BranchBuffer::Bounded(1)));
    let _idle = branches.pop().unwrap();
    let mut reader = branches.pop().unwrap();

    assert_eq!(reader.next().await, Some(0));
    assert_eq!(reader.next().await, Some(1));
    // Item 1 could not be delivered to the idle branch, so nothing more moves
    assert!(timeout(Duration::from_millis(50), reader.next()).await.is_err());
    assert_eq!(pulled.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unbounded_branch_is_decoupled() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let config = BroadcastConfig::uniform(2, BranchBuffer::Bounded(1)).branch(1, BranchBuffer::Unbounded);
    let mut branches = broadcast(counted(100, &pulled), config);
    let lagging = branches.pop().unwrap();
    let reader = branches.pop().unwrap();

    let items: Vec<usize> = timeout(Duration::from_secs(1), reader.collect()).await.unwrap();
    assert_eq!(items, (0..100).collect::<Vec<_>>());
    assert_eq!(pulled.load(Ordering::SeqCst), 100);

    // Everything is still waiting in the unbounded buffer
    let buffered: Vec<usize> = lagging.collect().await;
    assert_eq!(buffered.len(), 100);
}

#[tokio::test]
async fn test_dropped_branch_is_skipped() {
    let mut branches = broadcast(
        stream::iter(0..50).boxed(),
        BroadcastConfig::uniform(2, BranchBuffer::Bounded(1)),
    );
    drop(branches.pop());
    let reader = branches.pop().unwrap();

    let items: Vec<i32> = timeout(Duration::from_secs(1), reader.collect()).await.unwrap();
    assert_eq!(items, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_upstream_stops_when_every_branch_dropped() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let branches = broadcast(counted(1000, &pulled), BroadcastConfig::uniform(2, BranchBuffer::Bounded(1)));
    drop(branches);

    sleep(Duration::from_millis(50)).await;
    assert!(pulled.load(Ordering::SeqCst) <= 1);
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_idle_upstream_released_when_every_branch_dropped() {
    let released = Arc::new(AtomicBool::new(false));
    let guard = SetOnDrop(Arc::clone(&released));
    let idle = stream::pending::<i32>()
        .map(move |x| {
            let _held = &guard;
            x
        })
        .boxed();

    let branches = broadcast(idle, BroadcastConfig::uniform(2, BranchBuffer::Bounded(1)));
    sleep(Duration::from_millis(20)).await;
    assert!(!released.load(Ordering::SeqCst));

    drop(branches);
    sleep(Duration::from_millis(50)).await;
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_error_reaches_every_branch_then_closes() {
    let source = stream::iter(vec![
        Ok(1),
        Ok(2),
        Err(StreamError::Custom("upstream failed".into())),
        Ok(3),
    ])
    .boxed();
    let branches = try_broadcast(source, BroadcastConfig::uniform(2, BranchBuffer::Unbounded));

    let collected = join_all(branches.into_iter().map(|b| b.collect::<Vec<Result<i32, StreamError>>>())).await;
    for items in collected {
        assert_eq!(
            items,
            vec![Ok(1), Ok(2), Err(StreamError::Custom("upstream failed".into()))]
        );
    }
}

#[tokio::test]
async fn test_extension_methods() {
    let branches = stream::iter(vec!['a', 'b']).broadcast_bounded(BroadcastConfig::default());
    assert_eq!(branches.len(), 2);
    for branch in branches {
        assert_eq!(branch.collect::<Vec<_>>().await, vec!['a', 'b']);
    }

    let branches = stream::iter(vec![Ok::<_, StreamError>(1)])
        .try_broadcast_bounded(BroadcastConfig::uniform(1, BranchBuffer::Unbounded));
    assert_eq!(branches.into_iter().next().unwrap().collect::<Vec<_>>().await, vec![Ok(1)]);
}
