use futures_core::Stream;
use futures_util::stream::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::broadcast::{broadcast, try_broadcast};
use crate::chunk::{chunk, chunk_n, chunk_within, Chunk};
use crate::error::StreamError;
use crate::par_map::{
    par_eval_map, par_eval_map_unordered, try_par_eval_map, try_par_eval_map_pooled, try_par_eval_map_unordered,
    try_par_eval_map_with, MapOrder,
};
use crate::pool::{ObjectPool, PooledObject};
use crate::semaphore::{ConcurrencyInfo, Semaphore};
use crate::stream_configuration::{BroadcastConfig, ChunkPolicy, ParallelConfig};
use crate::stream_performance_metrics::{with_metrics, StreamMetrics};
use crate::FlowStream;

/// Extension trait exposing the bounded combinators as stream methods
pub trait BoundedStreamExt: Stream + Sized + Unpin + Send + 'static {
    /// Group items into chunks according to `policy`
    fn chunked(self, policy: ChunkPolicy) -> FlowStream<Chunk<Self::Item>>
    where
        Self::Item: Send + 'static,
    {
        chunk(self.boxed(), policy)
    }

    /// Chunks of exactly `size` items, except possibly the last
    fn chunked_n(self, size: usize) -> FlowStream<Chunk<Self::Item>>
    where
        Self::Item: Send + 'static,
    {
        chunk_n(self.boxed(), size)
    }

    /// Chunks closed at `max_items` items or `window` after their first item
    fn chunked_within(self, max_items: usize, window: Duration) -> FlowStream<Chunk<Self::Item>>
    where
        Self::Item: Send + 'static,
    {
        chunk_within(self.boxed(), max_items, window)
    }

    /// Evaluate `f` on up to `concurrency` items at once, preserving order
    fn par_eval_map_bounded<U, Fut, F>(self, concurrency: usize, f: F) -> FlowStream<U>
    where
        F: FnMut(Self::Item) -> Fut + Send + 'static,
        Fut: Future<Output = U> + Send + 'static,
        U: Send + 'static,
        Self::Item: Send + 'static,
    {
        par_eval_map(self.boxed(), concurrency, f)
    }

    fn par_eval_map_unordered_bounded<U, Fut, F>(self, concurrency: usize, f: F) -> FlowStream<U>
    where
        F: FnMut(Self::Item) -> Fut + Send + 'static,
        Fut: Future<Output = U> + Send + 'static,
        U: Send + 'static,
        Self::Item: Send + 'static,
    {
        par_eval_map_unordered(self.boxed(), concurrency, f)
    }

    /// Fallible ordered parallel map; the first error ends the stream
    fn try_par_eval_map_bounded<U, E, Fut, F>(self, concurrency: usize, f: F) -> FlowStream<Result<U, E>>
    where
        F: FnMut(Self::Item) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
        U: Send + 'static,
        E: From<StreamError> + Send + 'static,
        Self::Item: Send + 'static,
    {
        try_par_eval_map(self.boxed(), concurrency, f)
    }

    fn try_par_eval_map_unordered_bounded<U, E, Fut, F>(self, concurrency: usize, f: F) -> FlowStream<Result<U, E>>
    where
        F: FnMut(Self::Item) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
        U: Send + 'static,
        E: From<StreamError> + Send + 'static,
        Self::Item: Send + 'static,
    {
        try_par_eval_map_unordered(self.boxed(), concurrency, f)
    }

    /// Parallel map whose transforms hold permits from a shared semaphore
    fn par_eval_map_with_semaphore<U, E, Fut, F>(
        self,
        semaphore: Semaphore,
        config: ParallelConfig,
        order: MapOrder,
        f: F,
    ) -> FlowStream<Result<U, E>>
    where
        F: FnMut(Self::Item, ConcurrencyInfo) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
        U: Send + 'static,
        E: From<StreamError> + Send + 'static,
        Self::Item: Send + 'static,
    {
        try_par_eval_map_with(self.boxed(), semaphore, config, order, f)
    }

    /// Parallel map where every transform borrows an instance from `pool`
    fn par_eval_map_pooled<T, U, E, Fut, F>(
        self,
        pool: ObjectPool<T>,
        config: ParallelConfig,
        order: MapOrder,
        f: F,
    ) -> FlowStream<Result<U, E>>
    where
        T: Send + 'static,
        F: FnMut(PooledObject<T>, Self::Item) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
        U: Send + 'static,
        E: From<StreamError> + Send + 'static,
        Self::Item: Send + 'static,
    {
        try_par_eval_map_pooled(self.boxed(), pool, config, order, f)
    }

    /// Fan out to several branches; see [`broadcast`]
    fn broadcast_bounded(self, config: BroadcastConfig) -> Vec<FlowStream<Self::Item>>
    where
        Self::Item: Clone + Send + 'static,
    {
        broadcast(self.boxed(), config)
    }
}

impl<S> BoundedStreamExt for S where S: Stream + Sized + Unpin + Send + 'static {}

/// Extension trait for streams of `Result`s
pub trait BoundedResultStreamExt<T: Send + 'static, E: Send + 'static>:
    Stream<Item = Result<T, E>> + Sized + Unpin + Send + 'static
{
    /// Fan out a fallible stream; the first error reaches every branch
    fn try_broadcast_bounded(self, config: BroadcastConfig) -> Vec<FlowStream<Result<T, E>>>
    where
        T: Clone,
        E: Clone,
    {
        try_broadcast(self.boxed(), config)
    }

    /// Count items and errors as they pass
    fn with_metrics_bounded(self, name: impl Into<String>) -> (FlowStream<Result<T, E>>, Arc<Mutex<StreamMetrics>>) {
        with_metrics(self.boxed(), name)
    }
}

impl<T, E, S> BoundedResultStreamExt<T, E> for S
where
    S: Stream<Item = Result<T, E>> + Sized + Unpin + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
}
