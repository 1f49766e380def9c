//! Grouping stream items into chunks by count and/or time window

use std::time::Duration;

use async_stream::stream;
use futures_util::pin_mut;
use futures_util::stream::StreamExt;
use tokio::time::{sleep, Instant};

use crate::stream_configuration::ChunkPolicy;
use crate::FlowStream;

/// An ordered batch of items collected between two flush points
pub type Chunk<T> = Vec<T>;

/// Groups `s` into chunks according to `policy`.
///
/// Chunks preserve input order and are never empty. On upstream completion
/// any remainder is emitted immediately, whatever the window.
pub fn chunk<O>(s: FlowStream<O>, policy: ChunkPolicy) -> FlowStream<Chunk<O>>
where
    O: Send + 'static,
{
    match policy {
        ChunkPolicy::Count(n) => chunk_n(s, n),
        ChunkPolicy::TimeWindow { max_items, window } => timed(s, Some(max_items.max(1)), window),
        ChunkPolicy::Window(window) => timed(s, None, window),
    }
}

/// Emits a chunk exactly when `size` items have accumulated. Zero is treated as one.
pub fn chunk_n<O>(s: FlowStream<O>, size: usize) -> FlowStream<Chunk<O>>
where
    O: Send + 'static,
{
    let size = size.max(1);
    stream! {
        let mut buf = Vec::with_capacity(size);
        pin_mut!(s);
        while let Some(item) = s.next().await {
            buf.push(item);
            if buf.len() == size {
                yield std::mem::replace(&mut buf, Vec::with_capacity(size));
            }
        }
        if !buf.is_empty() {
            yield buf;
        }
    }
    .boxed()
}

/// Emits a chunk at `max_items` items or `window` after the chunk's first
/// item, whichever comes first.
///
/// # Examples
/// ```
/// use bounded_streams::chunk::chunk_within;
/// use futures_util::stream::{self, StreamExt};
/// use std::time::Duration;
///
/// # async fn example() {
/// let chunks = chunk_within(stream::iter(1..=5).boxed(), 2, Duration::from_secs(1))
///     .collect::<Vec<_>>()
///     .await;
/// assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
/// # }
/// ```
pub fn chunk_within<O>(s: FlowStream<O>, max_items: usize, window: Duration) -> FlowStream<Chunk<O>>
where
    O: Send + 'static,
{
    timed(s, Some(max_items.max(1)), window)
}

// Appends and timer flushes happen on the one task driving this stream, so a
// flush can never interleave with an append.
fn timed<O>(s: FlowStream<O>, max_items: Option<usize>, window: Duration) -> FlowStream<Chunk<O>>
where
    O: Send + 'static,
{
    stream! {
        pin_mut!(s);
        let mut buf: Vec<O> = Vec::new();
        let deadline = sleep(window);
        pin_mut!(deadline);

        loop {
            let flush = tokio::select! {
                biased;

                () = &mut deadline, if !buf.is_empty() => true,
                next = s.next() => match next {
                    Some(item) => {
                        if buf.is_empty() {
                            deadline.as_mut().reset(Instant::now() + window);
                        }
                        buf.push(item);
                        max_items.map_or(false, |n| buf.len() >= n)
                    }
                    None => break,
                },
            };

            if flush {
                yield std::mem::take(&mut buf);
            }
        }

        if !buf.is_empty() {
            yield buf;
        }
    }
    .boxed()
}
