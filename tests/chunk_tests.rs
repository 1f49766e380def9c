use bounded_streams::chunk::{chunk, chunk_n, chunk_within};
use bounded_streams::stream_configuration::{ChunkConfig, ChunkPolicy};
use bounded_streams::BoundedStreamExt;
use async_stream::stream;
use futures_util::stream::{self, StreamExt};
use serial_test::serial;
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn paced(items: Vec<i32>, every: Duration) -> bounded_streams::FlowStream<i32> {
    stream! {
        for item in items {
            sleep(every).await;
            yield item;
        }
    }
    .boxed()
}

#[tokio::test]
async fn test_count_chunks_with_remainder() {
    let chunks: Vec<Vec<i32>> = chunk(stream::iter(1..=25).boxed(), ChunkPolicy::Count(10))
        .collect()
        .await;
    let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(chunks.concat(), (1..=25).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_count_chunks_exact_multiple_and_empty() {
    let chunks: Vec<Vec<i32>> = chunk_n(stream::iter(1..=6).boxed(), 3).collect().await;
    assert_eq!(chunks, vec![vec![1, 2, 3], vec![4, 5, 6]]);

    let empty: Vec<Vec<i32>> = chunk_n(stream::empty().boxed(), 3).collect().await;
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_time_window_flushes_at_max_items() {
    let chunks: Vec<Vec<i32>> = chunk_within(stream::iter(1..=7).boxed(), 3, Duration::from_secs(10))
        .collect()
        .await;
    assert_eq!(chunks, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
}

#[tokio::test]
#[serial]
async fn test_time_window_shorter_than_gap_gives_one_chunk_per_item() {
    let policy = ChunkPolicy::time_window(10, Duration::from_millis(250)).unwrap();
    let chunks: Vec<Vec<i32>> = chunk(paced(vec![1, 2, 3], Duration::from_millis(300)), policy)
        .collect()
        .await;
    assert_eq!(chunks, vec![vec![1], vec![2], vec![3]]);
}

#[tokio::test]
#[serial]
async fn test_window_groups_bursts() {
    // Two bursts of three items separated by a gap longer than the window
    let source = stream! {
        for burst in 0..2 {
            for i in 0..3 {
                yield burst * 3 + i;
            }
            sleep(Duration::from_millis(200)).await;
        }
    }
    .boxed();

    let chunks: Vec<Vec<i32>> = chunk(source, ChunkPolicy::window(Duration::from_millis(80)).unwrap())
        .collect()
        .await;
    assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4, 5]]);
}

#[tokio::test]
#[serial]
async fn test_remainder_emitted_immediately_on_completion() {
    let start = Instant::now();
    let chunks: Vec<Vec<i32>> = chunk_within(stream::iter(vec![1, 2]).boxed(), 10, Duration::from_secs(5))
        .collect()
        .await;
    assert_eq!(chunks, vec![vec![1, 2]]);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
#[serial]
async fn test_window_starts_at_first_item_of_chunk() {
    // An idle upstream must not produce empty chunks, and the window is
    // measured from the first buffered item, not from stream start.
    let source = stream! {
        sleep(Duration::from_millis(150)).await;
        yield 1;
        sleep(Duration::from_millis(30)).await;
        yield 2;
    }
    .boxed();

    let chunks: Vec<Vec<i32>> = chunk(source, ChunkPolicy::window(Duration::from_millis(100)).unwrap())
        .collect()
        .await;
    assert_eq!(chunks, vec![vec![1, 2]]);
}

#[tokio::test]
async fn test_chunk_config_policy() {
    assert_eq!(ChunkConfig::new().max_items(4).policy().unwrap(), ChunkPolicy::Count(4));
    assert!(ChunkConfig::new().policy().is_err());
    assert!(ChunkPolicy::count(0).is_err());
    assert!(ChunkPolicy::window(Duration::ZERO).is_err());
}

#[tokio::test]
async fn test_extension_methods() {
    let chunks: Vec<Vec<i32>> = stream::iter(1..=5).chunked_n(2).collect().await;
    assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);

    let chunks: Vec<Vec<i32>> = stream::iter(1..=5)
        .chunked(ChunkPolicy::Count(5))
        .collect()
        .await;
    assert_eq!(chunks, vec![vec![1, 2, 3, 4, 5]]);
}
