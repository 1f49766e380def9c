//! Counting permit semaphore with optional lease expiry
//!
//! Permits are `(slot, generation)` handles into a fixed arena of slots. A
//! slot's generation is bumped on every release, so a stale handle (already
//! released, or reclaimed by its lease) can never release a permit that was
//! since handed to somebody else.
//!
//! Waiters queue up FIFO and are served by direct hand-off from `release`;
//! nothing polls. The state lock is never held across an `.await`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{ConfigError, StreamError, StreamResult};
use crate::stream_configuration::SemaphoreConfig;

/// The right to run one unit of bounded concurrent work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Permit {
    index: usize,
    generation: u64,
}

impl Permit {
    /// Slot this permit occupies; reused after release
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Snapshot of a permit source handed to in-flight work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyInfo {
    pub total_permits: usize,
    pub available_permits: usize,
}

impl ConcurrencyInfo {
    pub fn in_use(&self) -> usize {
        self.total_permits.saturating_sub(self.available_permits)
    }
}

struct Slot {
    generation: u64,
    held: bool,
    lease: Option<JoinHandle<()>>,
}

struct State {
    slots: Vec<Slot>,
    free: Vec<usize>,
    waiters: VecDeque<oneshot::Sender<Permit>>,
    closed: bool,
}

struct Inner {
    total: usize,
    lease: Option<Duration>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in &mut state.slots {
            if let Some(handle) = slot.lease.take() {
                handle.abort();
            }
        }
    }
}

/// Marks `index` held and schedules its lease, if any.
fn grant(inner: &Arc<Inner>, state: &mut State, index: usize) -> Permit {
    let slot = &mut state.slots[index];
    slot.held = true;
    let permit = Permit {
        index,
        generation: slot.generation,
    };
    if let Some(lease) = inner.lease {
        slot.lease = schedule_expiry(Arc::downgrade(inner), permit, lease);
    }
    permit
}

fn schedule_expiry(inner: Weak<Inner>, permit: Permit, lease: Duration) -> Option<JoinHandle<()>> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        log::warn!("no Tokio runtime; permit {} acquired without lease expiry", permit.index);
        return None;
    };
    Some(handle.spawn(async move {
        tokio::time::sleep(lease).await;
        if let Some(inner) = inner.upgrade() {
            let mut state = inner.lock();
            if release_locked(&inner, &mut state, permit, true) {
                log::debug!("permit {} reclaimed after lease of {:?}", permit.index, lease);
            }
        }
    }))
}

/// Frees the slot behind `permit` and hands it to the oldest live waiter.
/// Returns `false` for stale handles.
fn release_locked(inner: &Arc<Inner>, state: &mut State, permit: Permit, expired: bool) -> bool {
    let Some(slot) = state.slots.get_mut(permit.index) else {
        return false;
    };
    if !slot.held || slot.generation != permit.generation {
        return false;
    }
    vacate(slot, !expired);

    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.is_closed() {
            continue;
        }
        let handed = grant(inner, state, permit.index);
        match waiter.send(handed) {
            Ok(()) => return true,
            Err(_) => vacate(&mut state.slots[permit.index], true),
        }
    }
    state.free.push(permit.index);
    true
}

fn vacate(slot: &mut Slot, abort_lease: bool) {
    if let Some(handle) = slot.lease.take() {
        if abort_lease {
            handle.abort();
        }
    }
    slot.held = false;
    slot.generation = slot.generation.wrapping_add(1);
}

/// Counting semaphore handing out [`Permit`]s.
///
/// Cloning is cheap and every clone shares the same permits.
///
/// # Examples
/// ```
/// use bounded_streams::semaphore::Semaphore;
///
/// # async fn example() {
/// let semaphore = Semaphore::new(2);
/// let a = semaphore.acquire().await.unwrap();
/// let _b = semaphore.try_acquire().unwrap();
/// assert!(semaphore.try_acquire().is_none());
///
/// assert!(semaphore.release(a));
/// assert!(!semaphore.release(a)); // already released
/// assert_eq!(semaphore.available(), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl Semaphore {
    /// A semaphore with `permits` permits and no lease. Zero is treated as one.
    pub fn new(permits: usize) -> Self {
        Self::build(permits.max(1), None)
    }

    pub fn with_config(config: SemaphoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config.permits, config.lease))
    }

    /// Permits not released within `lease` are reclaimed automatically.
    /// Leases are timed on the current Tokio runtime.
    pub fn with_lease(permits: usize, lease: Duration) -> Result<Self, ConfigError> {
        Self::with_config(SemaphoreConfig::new(permits).lease(lease))
    }

    fn build(total: usize, lease: Option<Duration>) -> Self {
        let slots = (0..total)
            .map(|_| Slot {
                generation: 0,
                held: false,
                lease: None,
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                total,
                lease,
                state: Mutex::new(State {
                    slots,
                    free: (0..total).rev().collect(),
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Waits for a free permit.
    ///
    /// Fails with [`StreamError::Cancelled`] if the semaphore is, or becomes,
    /// closed. Dropping the returned future never leaks a permit.
    pub async fn acquire(&self) -> StreamResult<Permit> {
        let rx = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(StreamError::Cancelled);
            }
            if let Some(index) = state.free.pop() {
                return Ok(grant(&self.inner, &mut state, index));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            rx,
            inner: &self.inner,
            done: false,
        };
        waiter.recv().await
    }

    /// Takes a permit if one is free, without suspending.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.lock();
        if state.closed {
            return None;
        }
        let index = state.free.pop()?;
        Some(grant(&self.inner, &mut state, index))
    }

    /// Returns `permit`; a no-op returning `false` if it was already released
    /// or reclaimed by its lease.
    pub fn release(&self, permit: Permit) -> bool {
        let mut state = self.inner.lock();
        release_locked(&self.inner, &mut state, permit, false)
    }

    /// Force-releases every outstanding permit. Returns how many were held.
    pub fn release_all(&self) -> usize {
        let mut state = self.inner.lock();
        let held: Vec<Permit> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.held)
            .map(|(index, slot)| Permit {
                index,
                generation: slot.generation,
            })
            .collect();
        let mut released = 0;
        for permit in held {
            if release_locked(&self.inner, &mut state, permit, false) {
                released += 1;
            }
        }
        if released > 0 {
            log::debug!("force-released {} permits", released);
        }
        released
    }

    /// Rejects current and future waiters with [`StreamError::Cancelled`].
    /// Outstanding permits stay valid and can still be released.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        let waiting = state.waiters.len();
        state.waiters.clear();
        if waiting > 0 {
            log::debug!("semaphore closed with {} waiters", waiting);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Best-effort count of free permits
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn total_permits(&self) -> usize {
        self.inner.total
    }

    pub fn lease(&self) -> Option<Duration> {
        self.inner.lease
    }

    pub fn concurrency_info(&self) -> ConcurrencyInfo {
        ConcurrencyInfo {
            total_permits: self.inner.total,
            available_permits: self.available(),
        }
    }

    /// Like [`acquire`](Self::acquire), but the permit is released on drop.
    pub async fn acquire_guard(&self) -> StreamResult<PermitGuard> {
        let permit = self.acquire().await?;
        Ok(PermitGuard::new(self.clone(), permit))
    }

    pub fn try_acquire_guard(&self) -> Option<PermitGuard> {
        self.try_acquire()
            .map(|permit| PermitGuard::new(self.clone(), permit))
    }

    /// Runs `fut` while holding a permit.
    pub async fn with_permit<F, T>(&self, fut: F) -> StreamResult<T>
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire_guard().await?;
        Ok(fut.await)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Semaphore")
            .field("total", &self.inner.total)
            .field("available", &state.free.len())
            .field("waiters", &state.waiters.len())
            .field("lease", &self.inner.lease)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Pending `acquire`. A permit handed off after the caller stopped waiting
/// is returned to the semaphore on drop.
struct Waiter<'a> {
    rx: oneshot::Receiver<Permit>,
    inner: &'a Arc<Inner>,
    done: bool,
}

impl Waiter<'_> {
    async fn recv(&mut self) -> StreamResult<Permit> {
        let result = (&mut self.rx).await;
        self.done = true;
        result.map_err(|_| StreamError::Cancelled)
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if let Ok(permit) = self.rx.try_recv() {
            let mut state = self.inner.lock();
            release_locked(self.inner, &mut state, permit, false);
        }
    }
}

/// A permit released when dropped
pub struct PermitGuard {
    semaphore: Semaphore,
    permit: Option<Permit>,
}

impl PermitGuard {
    fn new(semaphore: Semaphore, permit: Permit) -> Self {
        Self {
            semaphore,
            permit: Some(permit),
        }
    }

    pub fn permit(&self) -> Option<Permit> {
        self.permit
    }

    pub fn concurrency_info(&self) -> ConcurrencyInfo {
        self.semaphore.concurrency_info()
    }

    /// Releases now; equivalent to dropping the guard.
    pub fn release(mut self) -> bool {
        self.permit
            .take()
            .map(|permit| self.semaphore.release(permit))
            .unwrap_or(false)
    }

    /// Detaches the permit; the caller becomes responsible for releasing it.
    pub fn into_permit(mut self) -> Option<Permit> {
        self.permit.take()
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.semaphore.release(permit);
        }
    }
}

impl fmt::Debug for PermitGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermitGuard")
            .field("permit", &self.permit)
            .finish()
    }
}
