//! Fan-out of one stream to several independent consumers
//!
//! A single background task pulls the upstream and hands a clone of every
//! item to each branch before pulling the next one. Bounded branches
//! therefore pace the upstream: a branch nobody reads stalls all of them.
//! Unbounded branches never push back.

use futures_util::future::join_all;
use futures_util::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

use crate::stream_configuration::{BranchBuffer, BroadcastConfig};
use crate::FlowStream;

enum BranchSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T: Send> BranchSender<T> {
    /// `false` once the branch's consumer has gone away.
    async fn deliver(&self, item: T) -> bool {
        match self {
            BranchSender::Bounded(tx) => tx.send(item).await.is_ok(),
            BranchSender::Unbounded(tx) => tx.send(item).is_ok(),
        }
    }

    /// Resolves once the branch's consumer has gone away.
    async fn closed(&self) {
        match self {
            BranchSender::Bounded(tx) => tx.closed().await,
            BranchSender::Unbounded(tx) => tx.closed().await,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            BranchSender::Bounded(tx) => tx.is_closed(),
            BranchSender::Unbounded(tx) => tx.is_closed(),
        }
    }
}

fn branch<T: Send + 'static>(buffer: BranchBuffer) -> (BranchSender<T>, FlowStream<T>) {
    match buffer {
        BranchBuffer::Bounded(n) => {
            let (tx, rx) = mpsc::channel(n.max(1));
            (BranchSender::Bounded(tx), ReceiverStream::new(rx).boxed())
        }
        BranchBuffer::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (BranchSender::Unbounded(tx), UnboundedReceiverStream::new(rx).boxed())
        }
    }
}

/// Splits `s` into `config.branches()` streams that each see every item, in
/// order. Branches close when the upstream completes.
///
/// Must be called within a Tokio runtime. Every branch has to be read or
/// dropped; a dropped branch is skipped from then on, and the upstream stops
/// being pulled once all branches are gone.
///
/// # Examples
/// ```
/// use bounded_streams::broadcast::broadcast;
/// use bounded_streams::stream_configuration::{BranchBuffer, BroadcastConfig};
/// use futures_util::stream::{self, StreamExt};
///
/// # async fn example() {
/// let config = BroadcastConfig::uniform(2, BranchBuffer::Unbounded);
/// let mut branches = broadcast(stream::iter(vec![1, 2, 3]).boxed(), config);
/// let second = branches.pop().unwrap();
/// let first = branches.pop().unwrap();
/// assert_eq!(first.collect::<Vec<_>>().await, vec![1, 2, 3]);
/// assert_eq!(second.collect::<Vec<_>>().await, vec![1, 2, 3]);
/// # }
/// ```
pub fn broadcast<T>(s: FlowStream<T>, config: BroadcastConfig) -> Vec<FlowStream<T>>
where
    T: Clone + Send + 'static,
{
    fan_out(s, config, |_| false)
}

/// Broadcast for fallible streams: the first error reaches every branch,
/// after which all branches close.
pub fn try_broadcast<T, E>(s: FlowStream<Result<T, E>>, config: BroadcastConfig) -> Vec<FlowStream<Result<T, E>>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fan_out(s, config, Result::is_err)
}

fn fan_out<T, F>(s: FlowStream<T>, config: BroadcastConfig, is_last: F) -> Vec<FlowStream<T>>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    if let Err(e) = config.validate() {
        log::warn!("broadcast: {}", e);
    }
    let (senders, branches): (Vec<_>, Vec<_>) = config.buffers.iter().map(|buffer| branch(*buffer)).unzip();
    let mut senders: Vec<Option<BranchSender<T>>> = senders.into_iter().map(Some).collect();

    tokio::spawn(async move {
        let mut upstream = s;
        loop {
            for slot in senders.iter_mut() {
                if slot.as_ref().is_some_and(BranchSender::is_closed) {
                    *slot = None;
                }
            }
            if senders.iter().all(Option::is_none) {
                log::debug!("broadcast: every branch dropped, stopping upstream");
                break;
            }

            let pulled = tokio::select! {
                item = upstream.next() => item,
                _ = join_all(senders.iter().flatten().map(BranchSender::closed)) => {
                    log::debug!("broadcast: every branch dropped while waiting on upstream");
                    break;
                }
            };
            let Some(item) = pulled else {
                break;
            };
            let last = is_last(&item);
            for (index, slot) in senders.iter_mut().enumerate() {
                let delivered = match slot {
                    Some(tx) => tx.deliver(item.clone()).await,
                    None => continue,
                };
                if !delivered {
                    log::debug!("broadcast: branch {} dropped", index);
                    *slot = None;
                }
            }
            if last {
                break;
            }
        }
        // Dropping the senders closes every branch.
    });

    branches
}
