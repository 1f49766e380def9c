//! Bounded object pool with lazy creation and max-age eviction
//!
//! The pool hands out *grants*: either an idle instance to reuse or a
//! reserved unit of capacity to create a new instance with. Grants travel to
//! waiters over oneshot channels, and any grant that ends up unused (waiter
//! gone, factory failed, borrower cancelled) goes back through
//! `return_grant`, which keeps `free + borrowed == created <= size`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{BoxError, ConfigError, PoolError, PoolResult};
use crate::semaphore::ConcurrencyInfo;
use crate::stream_configuration::PoolConfig;

/// Creates and disposes of pooled instances
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Object: Send + 'static;

    async fn create(&self) -> Result<Self::Object, BoxError>;

    /// Called when an instance is evicted for age or the pool closes.
    async fn close(&self, object: Self::Object) -> Result<(), BoxError> {
        drop(object);
        Ok(())
    }
}

/// [`Manager`] built from a factory closure and a close closure
pub struct FnManager<T, C, D> {
    create: C,
    close: D,
    _object: PhantomData<fn() -> T>,
}

impl<T, C, D> FnManager<T, C, D> {
    pub fn new(create: C, close: D) -> Self {
        Self {
            create,
            close,
            _object: PhantomData,
        }
    }
}

#[async_trait]
impl<T, C, CF, D, DF> Manager for FnManager<T, C, D>
where
    T: Send + 'static,
    C: Fn() -> CF + Send + Sync + 'static,
    CF: Future<Output = Result<T, BoxError>> + Send + 'static,
    D: Fn(T) -> DF + Send + Sync + 'static,
    DF: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    type Object = T;

    async fn create(&self) -> Result<T, BoxError> {
        (self.create)().await
    }

    async fn close(&self, object: T) -> Result<(), BoxError> {
        (self.close)(object).await
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub created: usize,
    pub free: usize,
    pub borrowed: usize,
    pub waiters: usize,
    pub closed: bool,
}

struct Idle<T> {
    object: T,
    id: u64,
    created_at: Instant,
}

enum Grant<T> {
    Reuse(Idle<T>),
    Create,
}

struct State<T> {
    free: VecDeque<Idle<T>>,
    created: usize,
    borrowed: usize,
    waiters: VecDeque<oneshot::Sender<Grant<T>>>,
    closed: bool,
}

struct Inner<T: Send + 'static> {
    size: usize,
    max_age: Option<Duration>,
    manager: Arc<dyn Manager<Object = T>>,
    next_id: AtomicU64,
    state: Mutex<State<T>>,
}

impl<T: Send + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, created_at: Instant) -> bool {
        self.max_age
            .map_or(false, |max_age| created_at.elapsed() >= max_age)
    }
}

/// Passes an unused grant to the next live waiter, or takes it back into the
/// pool. Returns an instance the caller must close.
fn return_grant<T>(state: &mut State<T>, grant: Grant<T>) -> Option<Idle<T>> {
    if state.closed {
        state.borrowed -= 1;
        state.created -= 1;
        return match grant {
            Grant::Reuse(idle) => Some(idle),
            Grant::Create => None,
        };
    }

    let mut grant = grant;
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.is_closed() {
            continue;
        }
        match waiter.send(grant) {
            Ok(()) => return None,
            Err(back) => grant = back,
        }
    }

    state.borrowed -= 1;
    match grant {
        Grant::Reuse(idle) => state.free.push_back(idle),
        Grant::Create => state.created -= 1,
    }
    None
}

fn close_detached<T: Send + 'static>(manager: Arc<dyn Manager<Object = T>>, idle: Idle<T>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = manager.close(idle.object).await {
                    log::warn!("failed to close pooled object {}: {}", idle.id, e);
                }
            });
        }
        Err(_) => {
            log::debug!("no Tokio runtime; dropping pooled object {} without close", idle.id);
        }
    }
}

/// Bounded pool of expensive resources.
///
/// Instances are created lazily, at most `size` at a time. A borrower that
/// finds the pool exhausted waits until a peer releases an instance.
///
/// # Examples
/// ```
/// use bounded_streams::error::BoxError;
/// use bounded_streams::pool::ObjectPool;
/// use bounded_streams::stream_configuration::PoolConfig;
///
/// # async fn example() {
/// let pool = ObjectPool::from_fns(
///     PoolConfig::new(2),
///     || async { Ok::<_, BoxError>(String::from("connection")) },
///     |_conn: String| async { Ok::<(), BoxError>(()) },
/// )
/// .unwrap();
///
/// let conn = pool.borrow().await.unwrap();
/// assert_eq!(&*conn, "connection");
/// pool.release(conn).await.unwrap();
/// assert_eq!(pool.stats().free, 1);
/// # }
/// ```
pub struct ObjectPool<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Next<T> {
    Ready(Grant<T>),
    Wait(oneshot::Receiver<Grant<T>>),
}

impl<T: Send + 'static> ObjectPool<T> {
    pub fn new<M>(config: PoolConfig, manager: M) -> Result<Self, ConfigError>
    where
        M: Manager<Object = T>,
    {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                size: config.size,
                max_age: config.max_age,
                manager: Arc::new(manager),
                next_id: AtomicU64::new(0),
                state: Mutex::new(State {
                    free: VecDeque::new(),
                    created: 0,
                    borrowed: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        })
    }

    /// Pool backed by a factory closure and a close closure
    pub fn from_fns<C, CF, D, DF>(config: PoolConfig, create: C, close: D) -> Result<Self, ConfigError>
    where
        C: Fn() -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<T, BoxError>> + Send + 'static,
        D: Fn(T) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::new(config, FnManager::new(create, close))
    }

    /// Borrows an instance, creating one if capacity remains or waiting for a
    /// release otherwise. Stale instances are replaced transparently.
    pub async fn borrow(&self) -> PoolResult<PooledObject<T>> {
        let next = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(idle) = state.free.pop_front() {
                state.borrowed += 1;
                Next::Ready(Grant::Reuse(idle))
            } else if state.created < self.inner.size {
                state.created += 1;
                state.borrowed += 1;
                Next::Ready(Grant::Create)
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Next::Wait(rx)
            }
        };

        let grant = match next {
            Next::Ready(grant) => grant,
            Next::Wait(rx) => {
                let mut waiter = PoolWaiter {
                    rx,
                    inner: &self.inner,
                    done: false,
                };
                waiter.recv().await?
            }
        };
        self.fulfil(grant).await
    }

    async fn fulfil(&self, grant: Grant<T>) -> PoolResult<PooledObject<T>> {
        let reservation = Reservation {
            inner: &self.inner,
            armed: true,
        };
        match grant {
            Grant::Reuse(idle) if !self.inner.is_stale(idle.created_at) => Ok(reservation.fulfil(idle)),
            Grant::Reuse(idle) => {
                log::debug!(
                    "evicting pooled object {} after {:?}",
                    idle.id,
                    idle.created_at.elapsed()
                );
                if let Err(e) = self.inner.manager.close(idle.object).await {
                    log::warn!("failed to close stale pooled object {}: {}", idle.id, e);
                }
                self.create(reservation).await
            }
            Grant::Create => self.create(reservation).await,
        }
    }

    async fn create(&self, reservation: Reservation<'_, T>) -> PoolResult<PooledObject<T>> {
        let object = self.inner.manager.create().await.map_err(|e| {
            log::warn!("pool factory failed: {}", e);
            PoolError::Factory(e)
        })?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("created pooled object {}", id);
        Ok(reservation.fulfil(Idle {
            object,
            id,
            created_at: Instant::now(),
        }))
    }

    /// Takes an idle, non-stale instance without suspending or creating.
    pub fn try_borrow(&self) -> Option<PooledObject<T>> {
        let mut stale = Vec::new();
        let found = {
            let mut state = self.inner.lock();
            if state.closed {
                return None;
            }
            let mut found = None;
            while let Some(idle) = state.free.pop_front() {
                if self.inner.is_stale(idle.created_at) {
                    state.created -= 1;
                    stale.push(idle);
                } else {
                    state.borrowed += 1;
                    found = Some(idle);
                    break;
                }
            }
            found
        };
        for idle in stale {
            close_detached(Arc::clone(&self.inner.manager), idle);
        }
        found.map(|idle| PooledObject::new(Arc::clone(&self.inner), idle))
    }

    /// Returns `object` to the pool, or closes it if the pool is closing.
    pub async fn release(&self, mut object: PooledObject<T>) -> PoolResult<()> {
        let Some(idle) = object.take_idle() else {
            return Ok(());
        };
        let to_close = {
            let mut state = object.pool.lock();
            return_grant(&mut state, Grant::Reuse(idle))
        };
        match to_close {
            Some(idle) => object
                .pool
                .manager
                .close(idle.object)
                .await
                .map_err(|e| PoolError::CloseFailed(vec![e])),
            None => Ok(()),
        }
    }

    /// Borrows an instance and hands it to `f`; the instance returns to the
    /// pool when `f`'s future drops it.
    pub async fn with_object<F, Fut, R>(&self, f: F) -> PoolResult<R>
    where
        F: FnOnce(PooledObject<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let object = self.borrow().await?;
        Ok(f(object).await)
    }

    /// Closes every idle instance now and every borrowed one on release.
    /// Later borrows fail with [`PoolError::Closed`].
    pub async fn close(&self) -> PoolResult<()> {
        let idle: Vec<Idle<T>> = {
            let mut state = self.inner.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.waiters.clear();
            let idle: Vec<_> = state.free.drain(..).collect();
            state.created -= idle.len();
            idle
        };

        log::debug!("closing pool with {} idle instances", idle.len());
        let mut failures = Vec::new();
        for entry in idle {
            if let Err(e) = self.inner.manager.close(entry.object).await {
                log::warn!("failed to close pooled object {}: {}", entry.id, e);
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError::CloseFailed(failures))
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            size: self.inner.size,
            created: state.created,
            free: state.free.len(),
            borrowed: state.borrowed,
            waiters: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            closed: state.closed,
        }
    }

    /// Instances that could be handed out without waiting
    pub fn concurrency_info(&self) -> ConcurrencyInfo {
        let state = self.inner.lock();
        ConcurrencyInfo {
            total_permits: self.inner.size,
            available_permits: state.free.len() + (self.inner.size - state.created),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ObjectPool")
            .field("size", &self.inner.size)
            .field("created", &state.created)
            .field("free", &state.free.len())
            .field("borrowed", &state.borrowed)
            .field("max_age", &self.inner.max_age)
            .field("closed", &state.closed)
            .finish()
    }
}

/// One unit of counted capacity that has no instance attached yet.
struct Reservation<'a, T: Send + 'static> {
    inner: &'a Arc<Inner<T>>,
    armed: bool,
}

impl<T: Send + 'static> Reservation<'_, T> {
    fn fulfil(mut self, idle: Idle<T>) -> PooledObject<T> {
        self.armed = false;
        PooledObject::new(Arc::clone(self.inner), idle)
    }
}

impl<T: Send + 'static> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock();
            return_grant(&mut state, Grant::Create);
        }
    }
}

struct PoolWaiter<'a, T: Send + 'static> {
    rx: oneshot::Receiver<Grant<T>>,
    inner: &'a Arc<Inner<T>>,
    done: bool,
}

impl<T: Send + 'static> PoolWaiter<'_, T> {
    async fn recv(&mut self) -> PoolResult<Grant<T>> {
        let result = (&mut self.rx).await;
        self.done = true;
        result.map_err(|_| PoolError::Closed)
    }
}

impl<T: Send + 'static> Drop for PoolWaiter<'_, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            let to_close = {
                let mut state = self.inner.lock();
                return_grant(&mut state, grant)
            };
            if let Some(idle) = to_close {
                close_detached(Arc::clone(&self.inner.manager), idle);
            }
        }
    }
}

/// A borrowed instance. Dropping it returns the instance to its pool.
pub struct PooledObject<T: Send + 'static> {
    object: Option<T>,
    id: u64,
    created_at: Instant,
    pool: Arc<Inner<T>>,
}

impl<T: Send + 'static> PooledObject<T> {
    fn new(pool: Arc<Inner<T>>, idle: Idle<T>) -> Self {
        Self {
            object: Some(idle.object),
            id: idle.id,
            created_at: idle.created_at,
            pool,
        }
    }

    fn take_idle(&mut self) -> Option<Idle<T>> {
        self.object.take().map(|object| Idle {
            object,
            id: self.id,
            created_at: self.created_at,
        })
    }

    /// Unique for the lifetime of the pool; never reused
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Removes the instance from the pool, freeing its capacity.
    pub fn detach(mut self) -> Option<T> {
        let idle = self.take_idle()?;
        let mut state = self.pool.lock();
        return_grant(&mut state, Grant::Create);
        Some(idle.object)
    }
}

impl<T: Send + 'static> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("pooled object present until dropped")
    }
}

impl<T: Send + 'static> DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pooled object present until dropped")
    }
}

impl<T: Send + 'static> Drop for PooledObject<T> {
    fn drop(&mut self) {
        let Some(idle) = self.take_idle() else {
            return;
        };
        let to_close = {
            let mut state = self.pool.lock();
            return_grant(&mut state, Grant::Reuse(idle))
        };
        if let Some(idle) = to_close {
            close_detached(Arc::clone(&self.pool.manager), idle);
        }
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for PooledObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledObject")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("age", &self.age())
            .finish()
    }
}
