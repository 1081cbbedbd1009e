// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Subscriber-side iteration.
//!
//! # Structure
//!
//! A subscription is split in two halves:
//!
//! - [`SubscriptionState`] is shared (through an `Arc`) with exactly one shard.
//!   It carries the single-slot notification sender, the last surfaced index
//!   and the flag bits. The shard only reads `after` and flips flags.
//! - `Consumer` is owned by the iterator. It holds the notification receiver,
//!   the ring cursor and the caller's cancellation token.
//!
//! # Receive
//!
//! [`Subscription::recv`] drives one boxed `Consumer::recv` future through
//! `poll_fn`. The future is kept across calls, so dropping a `recv()` future
//! mid-await (for example inside a `select!`) never loses registration or
//! an in-flight event.
//!
//! # Registration
//!
//! Shards learn about a subscription on its first `recv()`. Until then its
//! `after` snapshot sits in [`PendingRegistrations`], which the publisher loop
//! folds into the watermark, so nothing published after `subscribe()` can be
//! overwritten before a shard holds the subscription.
//!
//! # Delivery
//!
//! Events are read from the cursor while their index is exactly `after + 1`.
//! Anything else with newer events in the ring means the cursor went stale:
//! the consumer resynchronises on the earliest contiguous event and reports
//! the gap once through [`Delivery::undelivered`].

use super::TopicShared;
use super::ring::NodeId;
use crate::error::Error;
use futures_core::Stream;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};
use std::task::{Context, Poll, ready};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// The iterator has stopped; its shard may reclaim the slot.
pub(crate) const DID_STOP: u32 = 1;
/// A notification is still pending; further fan-outs skip the subscriber.
pub(crate) const BUSY: u32 = 1 << 1;
/// The shard has tombstoned the slot.
pub(crate) const IN_FREE_LIST: u32 = 1 << 2;

/// Subscriber state shared with the owning shard.
pub(crate) struct SubscriptionState {
    notify: mpsc::Sender<()>,
    after: AtomicU64,
    flags: AtomicU32,
}

impl SubscriptionState {
    pub(crate) fn new(after: u64) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (notify, notified) = mpsc::channel(1);
        let state = Arc::new(Self {
            notify,
            after: AtomicU64::new(after),
            flags: AtomicU32::new(0),
        });
        (state, notified)
    }

    /// Index of the last event surfaced to the consumer.
    pub(crate) fn after(&self) -> u64 {
        self.after.load(Ordering::Acquire)
    }

    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        _ = self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    /// Clears `flag`, returning whether it was set.
    pub(crate) fn take_flag(&self, flag: u32) -> bool {
        self.flags.fetch_and(!flag, Ordering::AcqRel) & flag != 0
    }

    /// Posts a notification without waiting. Returns `false` when the
    /// previous one has not been consumed yet.
    pub(crate) fn try_notify(&self) -> bool {
        self.notify.try_send(()).is_ok()
    }
}

/// `after` snapshots of subscriptions no shard holds yet, with their
/// multiplicity.
///
/// The publisher loop only takes the lock while `count` is non-zero.
#[derive(Default)]
pub(crate) struct PendingRegistrations {
    count: AtomicUsize,
    floors: Mutex<BTreeMap<u64, usize>>,
}

impl PendingRegistrations {
    /// Snapshots `last_index` and records it as a floor.
    pub(crate) fn enter(&self, last_index: impl FnOnce() -> u64) -> u64 {
        let mut floors = self.floors.lock();
        _ = self.count.fetch_add(1, Ordering::AcqRel);
        // Pairs with the fence in `floor`: either the publisher loop sees the
        // count, or this snapshot sees every push it decided without it.
        fence(Ordering::SeqCst);
        let after = last_index();
        *floors.entry(after).or_insert(0) += 1;
        after
    }

    pub(crate) fn leave(&self, after: u64) {
        let mut floors = self.floors.lock();
        if let Some(count) = floors.get_mut(&after) {
            *count -= 1;
            if *count == 0 {
                _ = floors.remove(&after);
            }
            _ = self.count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Lowest pending floor, `u64::MAX` when there is none.
    pub(crate) fn floor(&self) -> u64 {
        fence(Ordering::SeqCst);
        if self.count.load(Ordering::Acquire) == 0 {
            return u64::MAX;
        }
        self.floors
            .lock()
            .first_key_value()
            .map_or(u64::MAX, |(after, _)| *after)
    }
}

/// A registration request handed to whichever shard admits first.
pub(crate) struct Admission {
    pub(crate) subscription: Arc<SubscriptionState>,
    pub(crate) accepted: oneshot::Sender<()>,
}

/// One event surfaced by a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<T> {
    index: u64,
    value: T,
    undelivered: Option<u64>,
}

impl<T> Delivery<T> {
    /// Topic-wide index of the event.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The published value.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Consumes the delivery, returning the value.
    #[must_use]
    pub fn into_value(self) -> T {
        self.value
    }

    /// Number of events skipped right before this one, when a gap was
    /// detected. Only the first event after a gap carries it.
    #[must_use]
    pub fn undelivered(&self) -> Option<u64> {
        self.undelivered
    }

    /// The advisory gap as an [`Error::UndeliveredEvents`].
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.undelivered
            .map(|dropped| Error::UndeliveredEvents { dropped })
    }

    /// Splits into `(value, advisory error)`.
    #[must_use]
    pub fn into_parts(self) -> (T, Option<Error>) {
        let error = self.error();
        (self.value, error)
    }
}

enum Phase {
    Registering,
    Active,
}

enum Wake {
    Cancelled,
    Disposed,
    Notified,
}

struct Consumer<T> {
    shared: Arc<TopicShared<T>>,
    state: Arc<SubscriptionState>,
    ctx: CancellationToken,
    notified: mpsc::Receiver<()>,
    cursor: NodeId,
    after: u64,
    // Floor held in `PendingRegistrations` until a shard accepts us.
    pending: Option<u64>,
    phase: Phase,
    // Keep reading the ring before waiting for the next notification.
    draining: bool,
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.state.set_flag(DID_STOP);
        self.release_floor();
    }
}

impl<T> Consumer<T> {
    fn release_floor(&mut self) {
        if let Some(after) = self.pending.take() {
            self.shared.pending.leave(after);
        }
    }
}

impl<T> Consumer<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn recv(&mut self) -> Option<Result<Delivery<T>, Error>> {
        if matches!(self.phase, Phase::Registering) {
            if let Err(err) = self.register().await {
                return Some(Err(err));
            }
            self.phase = Phase::Active;
            self.draining = true;
        }

        loop {
            if self.ctx.is_cancelled() {
                return Some(Err(Error::Cancelled));
            }
            if self.shared.done.is_cancelled() {
                return Some(Err(Error::TopicDisposed));
            }
            if self.draining {
                if let Some(delivery) = self.next_event() {
                    return Some(Ok(delivery));
                }
                // A fan-out may have marked us busy after the notification
                // was taken; it would never notify again.
                if self.state.take_flag(BUSY) {
                    continue;
                }
                self.draining = false;
            }

            let wake = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => Wake::Cancelled,
                _ = self.shared.done.cancelled() => Wake::Disposed,
                signal = self.notified.recv() => match signal {
                    Some(()) => Wake::Notified,
                    None => Wake::Disposed,
                },
            };
            match wake {
                Wake::Cancelled => return Some(Err(Error::Cancelled)),
                Wake::Disposed => return Some(Err(Error::TopicDisposed)),
                Wake::Notified => {
                    _ = self.state.take_flag(BUSY);
                    self.draining = true;
                }
            }
        }
    }

    /// Hands the subscription to a shard and waits for it to be accepted.
    async fn register(&mut self) -> Result<(), Error> {
        loop {
            let (accepted, on_accepted) = oneshot::channel();
            let admission = Admission {
                subscription: self.state.clone(),
                accepted,
            };
            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => return Err(Error::Cancelled),
                _ = self.shared.done.cancelled() => return Err(Error::TopicDisposed),
                sent = self.shared.admissions.send(admission) => {
                    if sent.is_err() {
                        return Err(Error::TopicDisposed);
                    }
                }
            }
            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => return Err(Error::Cancelled),
                _ = self.shared.done.cancelled() => return Err(Error::TopicDisposed),
                outcome = on_accepted => {
                    if outcome.is_ok() {
                        // The shard folded our `after` into its watermark
                        // before accepting.
                        self.release_floor();
                        return Ok(());
                    }
                    // The receiving shard went away before accepting; retry.
                }
            }
        }
    }

    /// Surfaces the next event after `after`, if the ring holds one.
    fn next_event(&mut self) -> Option<Delivery<T>> {
        let ring = &self.shared.ring;
        let expected = self.after + 1;
        let (node, event, undelivered) = match ring.load(self.cursor) {
            Some(event) if event.index == expected => (self.cursor, event, None),
            _ => {
                if ring.last_index() <= self.after {
                    return None;
                }
                let (node, event) = ring.earliest_event(self.after)?;
                if event.index < expected {
                    // The newest push has not stored its cell yet.
                    return None;
                }
                let dropped = event.index - expected;
                (node, event, (dropped > 0).then_some(dropped))
            }
        };
        self.after = event.index;
        self.state.after.store(event.index, Ordering::Release);
        self.cursor = ring.next(node);
        Some(Delivery {
            index: event.index,
            value: event.value.clone(),
            undelivered,
        })
    }
}

type RecvFuture<T> =
    Pin<Box<dyn Future<Output = (Consumer<T>, Option<Result<Delivery<T>, Error>>)> + Send>>;

/// A live subscription to a topic.
///
/// Yields every event published after the subscription was created, in index
/// order. Terminates after yielding [`Error::Cancelled`] or
/// [`Error::TopicDisposed`]. Dropping it releases its slot on the owning
/// shard.
pub struct Subscription<T> {
    state: Arc<SubscriptionState>,
    consumer: Option<Consumer<T>>,
    pending: Option<RecvFuture<T>>,
}

impl<T> Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(shared: Arc<TopicShared<T>>, ctx: CancellationToken) -> Self {
        let after = shared.pending.enter(|| shared.ring.last_index());
        let cursor = shared.ring.tail();
        let (state, notified) = SubscriptionState::new(after);
        let consumer = Consumer {
            shared,
            state: state.clone(),
            ctx,
            notified,
            cursor,
            after,
            pending: Some(after),
            phase: Phase::Registering,
            draining: false,
        };
        Self {
            state,
            consumer: Some(consumer),
            pending: None,
        }
    }

    /// Receives the next event.
    ///
    /// Returns `None` once a terminal error has been yielded. The returned
    /// future is cancel-safe.
    pub async fn recv(&mut self) -> Option<Result<Delivery<T>, Error>> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Delivery<T>, Error>>> {
        if self.pending.is_none() {
            let Some(mut consumer) = self.consumer.take() else {
                return Poll::Ready(None);
            };
            self.pending = Some(Box::pin(async move {
                let item = consumer.recv().await;
                (consumer, item)
            }));
        }
        let Some(pending) = self.pending.as_mut() else {
            return Poll::Ready(None);
        };
        let (consumer, item) = ready!(pending.as_mut().poll(cx));
        self.pending = None;
        match &item {
            Some(Ok(_)) => self.consumer = Some(consumer),
            // Dropping the consumer marks the subscription stopped.
            Some(Err(_)) | None => drop(consumer),
        }
        Poll::Ready(item)
    }
}

impl<T> Subscription<T> {
    /// Returns `true` once the iterator has terminated or been dropped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.has_flag(DID_STOP)
    }

    /// Index of the last event surfaced, or the topic's last index at the
    /// time of subscribing when nothing was surfaced yet.
    #[must_use]
    pub fn committed_index(&self) -> u64 {
        self.state.after()
    }
}

impl<T> Stream for Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = Result<Delivery<T>, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("committed_index", &self.committed_index())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
