//! Bounded-concurrency stream mapping
//!
//! Every transform runs under a lease (a semaphore permit or a pooled
//! object), and the upstream is only pulled once a lease is in hand, so the
//! amount of in-flight state is bounded by the concurrency limit rather than
//! by upstream speed.
//!
//! The first failing transform ends the stream. Before its error is yielded
//! every sibling transform is cancelled, and spawned ones are awaited until
//! they have let go of the leases they held.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use async_stream::stream;
use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, FuturesUnordered};
use futures_util::future;
use futures_util::stream::StreamExt;
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::StreamError;
use crate::pool::{ObjectPool, PooledObject};
use crate::semaphore::{ConcurrencyInfo, PermitGuard, Semaphore};
use crate::stream_configuration::ParallelConfig;
use crate::FlowStream;

/// Whether results keep the order of their inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOrder {
    /// Launch eagerly, buffer completions, emit in submission order
    Ordered,
    /// Emit each result as soon as it completes
    Unordered,
}

type Task<O, E> = Pin<Box<dyn Future<Output = Result<O, E>> + Send>>;

enum InFlight<O, E> {
    Ordered(FuturesOrdered<Task<O, E>>),
    Unordered(FuturesUnordered<Task<O, E>>),
}

impl<O, E> InFlight<O, E> {
    fn new(order: MapOrder) -> Self {
        match order {
            MapOrder::Ordered => InFlight::Ordered(FuturesOrdered::new()),
            MapOrder::Unordered => InFlight::Unordered(FuturesUnordered::new()),
        }
    }

    fn push(&mut self, task: Task<O, E>) {
        match self {
            InFlight::Ordered(tasks) => tasks.push_back(task),
            InFlight::Unordered(tasks) => tasks.push(task),
        }
    }

    fn len(&self) -> usize {
        match self {
            InFlight::Ordered(tasks) => tasks.len(),
            InFlight::Unordered(tasks) => tasks.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn next(&mut self) -> Option<Result<O, E>> {
        match self {
            InFlight::Ordered(tasks) => tasks.next().await,
            InFlight::Unordered(tasks) => tasks.next().await,
        }
    }
}

enum Event<L, I, O, E> {
    Completed(Result<O, E>),
    Acquired(Result<L, E>),
    Pulled(Option<I>),
}

async fn pending_lease<L, E>(slot: &mut Option<BoxFuture<'static, Result<L, E>>>) -> Result<L, E> {
    match slot {
        Some(acquiring) => acquiring.await,
        None => future::pending().await,
    }
}

/// Spawned transforms of one mapped stream.
///
/// A spawned transform owns whatever `f` moved into it, pooled objects
/// included, so dropping its result future is not enough to give those back.
/// The handles kept here let a failure abort and then await every task.
#[derive(Default)]
struct SpawnedTasks {
    handles: Vec<JoinHandle<()>>,
}

impl SpawnedTasks {
    fn track(&mut self, handle: JoinHandle<()>) {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(handle);
    }

    /// Aborts every live task and waits until each has dropped its future.
    async fn shutdown(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for SpawnedTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "transform panicked".to_string()
    }
}

/// Wraps a transform with its deadline and lease. The lease is dropped the
/// moment the transform finishes or is cancelled.
fn launch<O, E, Fut, L>(fut: Fut, lease: L, config: &ParallelConfig, spawned: &mut SpawnedTasks) -> Task<O, E>
where
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    L: Send + 'static,
    O: Send + 'static,
    E: From<StreamError> + Send + 'static,
{
    let deadline = config.timeout;
    let guarded = async move {
        match deadline {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(elapsed) => Err(E::from(StreamError::from(elapsed))),
            },
            None => fut.await,
        }
    };

    if config.spawn_tasks {
        let (tx, rx) = oneshot::channel();
        spawned.track(tokio::spawn(async move {
            let result = match AssertUnwindSafe(guarded).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(E::from(StreamError::TaskPanicked(panic_message(payload)))),
            };
            let _ = tx.send(result);
        }));
        Box::pin(async move {
            let joined = rx.await;
            drop(lease);
            joined.unwrap_or_else(|_| Err(E::from(StreamError::Cancelled)))
        })
    } else {
        Box::pin(async move {
            let result = guarded.await;
            drop(lease);
            result
        })
    }
}

/// Drives `s` through `run`, holding one lease from `acquire` per in-flight
/// transform and at most `concurrency` launched-but-unemitted results.
fn bounded_map<I, O, E, L, A, R>(
    s: FlowStream<I>,
    concurrency: usize,
    order: MapOrder,
    mut acquire: A,
    mut run: R,
) -> FlowStream<Result<O, E>>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
    L: Send + 'static,
    A: FnMut() -> BoxFuture<'static, Result<L, E>> + Send + 'static,
    R: FnMut(L, I, &mut SpawnedTasks) -> Task<O, E> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    stream! {
        let mut upstream = s;
        let mut in_flight: InFlight<O, E> = InFlight::new(order);
        let mut acquiring: Option<BoxFuture<'static, Result<L, E>>> = None;
        let mut lease: Option<L> = None;
        let mut upstream_done = false;
        let mut spawned = SpawnedTasks::default();

        loop {
            if upstream_done && in_flight.is_empty() {
                break;
            }
            if !upstream_done && lease.is_none() && acquiring.is_none() && in_flight.len() < concurrency {
                acquiring = Some(acquire());
            }

            let event = tokio::select! {
                biased;

                Some(result) = in_flight.next(), if !in_flight.is_empty() => Event::Completed(result),
                acquired = pending_lease(&mut acquiring), if acquiring.is_some() => Event::Acquired(acquired),
                item = upstream.next(), if lease.is_some() => Event::Pulled(item),
                else => break,
            };

            let failure = match event {
                Event::Completed(Ok(output)) => {
                    yield Ok(output);
                    continue;
                }
                Event::Completed(Err(e)) => e,
                Event::Acquired(Ok(acquired)) => {
                    acquiring = None;
                    lease = Some(acquired);
                    continue;
                }
                Event::Acquired(Err(e)) => e,
                Event::Pulled(Some(item)) => {
                    if let Some(held) = lease.take() {
                        in_flight.push(run(held, item, &mut spawned));
                    }
                    continue;
                }
                Event::Pulled(None) => {
                    upstream_done = true;
                    lease = None;
                    continue;
                }
            };

            // Release every lease before the failure becomes visible.
            let cancelled = in_flight.len();
            in_flight = InFlight::new(order);
            acquiring = None;
            lease = None;
            spawned.shutdown().await;
            if cancelled > 0 {
                log::debug!("transform failed; cancelled {} in-flight siblings", cancelled);
            }
            yield Err(failure);
            break;
        }
    }
    .boxed()
}

/// Maps `s` through `f` with at most `config.concurrency` transforms in
/// flight, each holding a permit from `semaphore`.
///
/// `f` also receives a [`ConcurrencyInfo`] snapshot taken when its permit was
/// granted. Sharing `semaphore` between several streams bounds their combined
/// concurrency.
pub fn try_par_eval_map_with<I, O, E, F, Fut>(
    s: FlowStream<I>,
    semaphore: Semaphore,
    config: ParallelConfig,
    order: MapOrder,
    mut f: F,
) -> FlowStream<Result<O, E>>
where
    I: Send + 'static,
    O: Send + 'static,
    E: From<StreamError> + Send + 'static,
    F: FnMut(I, ConcurrencyInfo) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    let concurrency = config.concurrency;
    let acquire = move || {
        let semaphore = semaphore.clone();
        async move { semaphore.acquire_guard().await.map_err(E::from) }.boxed()
    };
    let run = move |guard: PermitGuard, item: I, spawned: &mut SpawnedTasks| {
        let info = guard.concurrency_info();
        launch(f(item, info), guard, &config, spawned)
    };
    bounded_map(s, concurrency, order, acquire, run)
}

/// Maps `s` through `f`, handing each transform an instance borrowed from
/// `pool`. The instance returns to the pool when the transform drops it.
pub fn try_par_eval_map_pooled<I, T, O, E, F, Fut>(
    s: FlowStream<I>,
    pool: ObjectPool<T>,
    config: ParallelConfig,
    order: MapOrder,
    mut f: F,
) -> FlowStream<Result<O, E>>
where
    I: Send + 'static,
    T: Send + 'static,
    O: Send + 'static,
    E: From<StreamError> + Send + 'static,
    F: FnMut(PooledObject<T>, I) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    let concurrency = config.concurrency.min(pool.size());
    let acquire = move || {
        let pool = pool.clone();
        async move {
            pool.borrow()
                .await
                .map_err(|e| E::from(StreamError::from(e)))
        }
        .boxed()
    };
    let run = move |object: PooledObject<T>, item: I, spawned: &mut SpawnedTasks| {
        launch(f(object, item), (), &config, spawned)
    };
    bounded_map(s, concurrency, order, acquire, run)
}

/// Fallible parallel map preserving input order
///
/// # Examples
/// ```
/// use bounded_streams::error::StreamError;
/// use bounded_streams::par_map::try_par_eval_map;
/// use futures_util::stream::{self, StreamExt};
///
/// # async fn example() {
/// let results = try_par_eval_map(stream::iter(1..=4).boxed(), 2, |x| async move {
///     if x < 3 { Ok(x * 10) } else { Err(StreamError::Custom(format!("bad input {}", x))) }
/// })
/// .collect::<Vec<_>>()
/// .await;
///
/// assert_eq!(results[..2], [Ok(10), Ok(20)]);
/// assert!(results[2].is_err());
/// assert_eq!(results.len(), 3);
/// # }
/// ```
pub fn try_par_eval_map<I, O, E, F, Fut>(s: FlowStream<I>, concurrency: usize, mut f: F) -> FlowStream<Result<O, E>>
where
    I: Send + 'static,
    O: Send + 'static,
    E: From<StreamError> + Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    try_par_eval_map_with(
        s,
        Semaphore::new(concurrency),
        ParallelConfig::new(concurrency),
        MapOrder::Ordered,
        move |item, _| f(item),
    )
}

/// Fallible parallel map emitting results as they complete
pub fn try_par_eval_map_unordered<I, O, E, F, Fut>(
    s: FlowStream<I>,
    concurrency: usize,
    mut f: F,
) -> FlowStream<Result<O, E>>
where
    I: Send + 'static,
    O: Send + 'static,
    E: From<StreamError> + Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    try_par_eval_map_with(
        s,
        Semaphore::new(concurrency),
        ParallelConfig::new(concurrency),
        MapOrder::Unordered,
        move |item, _| f(item),
    )
}

/// Parallel evaluation preserving order
pub fn par_eval_map<I, O, F, Fut>(s: FlowStream<I>, concurrency: usize, mut f: F) -> FlowStream<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    try_par_eval_map(s, concurrency, move |item| f(item).map(Ok::<O, StreamError>))
        .filter_map(|result| future::ready(result.ok()))
        .boxed()
}

/// Parallel evaluation, unordered
pub fn par_eval_map_unordered<I, O, F, Fut>(s: FlowStream<I>, concurrency: usize, mut f: F) -> FlowStream<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    try_par_eval_map_unordered(s, concurrency, move |item| f(item).map(Ok::<O, StreamError>))
        .filter_map(|result| future::ready(result.ok()))
        .boxed()
}
