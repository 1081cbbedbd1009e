// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Shard workers.
//!
//! Each shard is a Tokio task owning a disjoint set of subscriptions. The
//! publisher loop wakes every shard once per batch; the shard then walks its
//! subscriptions, folds their `after` into its watermark and forwards the
//! notification to those that are not busy. New subscriptions are admitted
//! from the topic-wide admission channel, but only while the shard's
//! effective capacity allows it.

use super::subscription::{Admission, BUSY, DID_STOP, IN_FREE_LIST, SubscriptionState};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Capacity value: admit without limit.
pub(crate) const UNLIMITED: i64 = -1;
/// Capacity value: admit nothing, exit once empty.
pub(crate) const DRAIN: i64 = -2;

/// Shard state visible to the publisher loop.
pub(crate) struct ShardState {
    id: usize,
    subscription_count: AtomicU64,
    watermark: AtomicU64,
    capacity: AtomicI64,
    did_stop: AtomicBool,
    notify: mpsc::Sender<()>,
    reload: mpsc::Sender<()>,
}

impl ShardState {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn subscription_count(&self) -> u64 {
        self.subscription_count.load(Ordering::Acquire)
    }

    /// Lowest `after` across live subscriptions, `u64::MAX` when there are
    /// none.
    pub(crate) fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> i64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.did_stop.load(Ordering::Acquire)
    }

    /// Wakes the shard for a new batch. Coalesces with a pending wake-up.
    pub(crate) fn notify(&self) {
        _ = self.notify.try_send(());
    }

    /// Stores a new capacity, signalling the worker when it changed.
    pub(crate) fn assign_capacity(&self, capacity: i64) -> bool {
        let changed = self.capacity.swap(capacity, Ordering::AcqRel) != capacity;
        if changed {
            _ = self.reload.try_send(());
        }
        changed
    }
}

/// Everything a shard worker needs from its topic.
#[derive(Clone)]
pub(crate) struct ShardContext {
    pub(crate) done: CancellationToken,
    pub(crate) admissions: async_channel::Receiver<Admission>,
    pub(crate) rescale: mpsc::Sender<()>,
    pub(crate) idle_timeout: Duration,
    pub(crate) target_shard_size: u64,
}

impl ShardContext {
    /// Starts a new shard worker. Must be called from within a Tokio runtime.
    pub(crate) fn spawn(&self, id: usize) -> Arc<ShardState> {
        let (notify, notified) = mpsc::channel(1);
        let (reload, reloaded) = mpsc::channel(1);
        let state = Arc::new(ShardState {
            id,
            subscription_count: AtomicU64::new(0),
            watermark: AtomicU64::new(u64::MAX),
            capacity: AtomicI64::new(UNLIMITED),
            did_stop: AtomicBool::new(false),
            notify,
            reload,
        });
        let worker = ShardWorker {
            state: state.clone(),
            context: self.clone(),
            notified,
            reloaded,
            subscriptions: Vec::new(),
            free: VecDeque::new(),
            capacity: UNLIMITED,
            admitting: true,
        };
        _ = tokio::spawn(worker.run());
        state
    }
}

struct ShardWorker {
    state: Arc<ShardState>,
    context: ShardContext,
    notified: mpsc::Receiver<()>,
    reloaded: mpsc::Receiver<()>,
    // Stopped entries stay as tombstones until the next compaction.
    subscriptions: Vec<Arc<SubscriptionState>>,
    free: VecDeque<usize>,
    capacity: i64,
    admitting: bool,
}

impl ShardWorker {
    async fn run(mut self) {
        let shard = self.state.id();
        debug!(shard, "shard started");
        self.reload_capacity();

        let idle_timeout = self.context.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);
        let mut idle_armed = true;

        loop {
            tokio::select! {
                biased;
                _ = self.context.done.cancelled() => break,
                Some(()) = self.notified.recv() => {
                    let tombstoned = self.fan_out();
                    if self.is_drained() {
                        break;
                    }
                    if tombstoned > 0 {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        idle_armed = true;
                    }
                }
                Some(()) = self.reloaded.recv() => {
                    self.reload_capacity();
                    if self.is_drained() {
                        break;
                    }
                }
                admission = self.context.admissions.recv(), if self.admitting => {
                    let Ok(admission) = admission else {
                        break;
                    };
                    self.admit(admission);
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    idle_armed = true;
                }
                () = &mut idle, if idle_armed => {
                    self.reload_capacity();
                    if self.compact() {
                        if self.capacity == DRAIN {
                            break;
                        }
                        idle_armed = false;
                    } else {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                }
            }
        }

        self.state.did_stop.store(true, Ordering::Release);
        _ = self.context.rescale.try_send(());
        debug!(shard, "shard stopped");
    }

    fn is_drained(&self) -> bool {
        self.capacity == DRAIN && self.state.subscription_count() == 0
    }

    /// Walks the subscriptions once. Returns the number of newly
    /// tombstoned entries.
    fn fan_out(&mut self) -> usize {
        let mut tombstoned = 0;
        let mut live = 0u64;
        let mut watermark = u64::MAX;
        for (slot, subscription) in self.subscriptions.iter().enumerate() {
            if subscription.has_flag(DID_STOP) {
                if !subscription.has_flag(IN_FREE_LIST) {
                    subscription.set_flag(IN_FREE_LIST);
                    self.free.push_back(slot);
                    tombstoned += 1;
                }
                continue;
            }
            watermark = watermark.min(subscription.after());
            live += 1;
            // A slow subscriber keeps its pending notification; skip it
            // until it has taken that one.
            if !subscription.has_flag(BUSY) && !subscription.try_notify() {
                subscription.set_flag(BUSY);
            }
        }
        self.state.subscription_count.store(live, Ordering::Release);
        self.state.watermark.store(watermark, Ordering::Release);
        tombstoned
    }

    fn admit(&mut self, admission: Admission) {
        let Admission {
            subscription,
            accepted,
        } = admission;
        // Cover the subscription before it drops its pending floor. A
        // subscriber that stopped waiting only keeps this low until the next
        // fan-out.
        _ = self
            .state
            .watermark
            .fetch_min(subscription.after(), Ordering::AcqRel);
        if accepted.send(()).is_err() {
            return;
        }
        match self.free.pop_front() {
            Some(slot) => self.subscriptions[slot] = subscription,
            None => self.subscriptions.push(subscription),
        }
        let count = self.state.subscription_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == self.context.target_shard_size || i64::try_from(count) == Ok(self.capacity) {
            _ = self.context.rescale.try_send(());
        }
        self.reload_capacity();
        trace!(shard = self.state.id(), count, "subscription admitted");
    }

    fn reload_capacity(&mut self) {
        self.capacity = self.state.capacity();
        let count = self.state.subscription_count();
        self.admitting = self.capacity == UNLIMITED
            || u64::try_from(self.capacity).is_ok_and(|cap| cap > 0 && count < cap);
    }

    /// Drops tombstones once the vector is mostly empty. Returns `true` when
    /// the shard holds no subscriptions afterwards.
    fn compact(&mut self) -> bool {
        let len = self.subscriptions.len();
        if len != 0 && len >= self.subscriptions.capacity() / 2 {
            return false;
        }
        let before = self.subscriptions.capacity();
        self.subscriptions
            .retain(|subscription| !subscription.has_flag(DID_STOP | IN_FREE_LIST));
        if self.subscriptions.is_empty() {
            self.subscriptions = Vec::new();
        } else {
            self.subscriptions.shrink_to(before / 2);
        }
        self.free.clear();
        let live = self.subscriptions.len() as u64;
        self.state.subscription_count.store(live, Ordering::Release);
        if live == 0 {
            self.state.watermark.store(u64::MAX, Ordering::Release);
        }
        debug!(shard = self.state.id(), live, "shard compacted");
        live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn context(
        idle_timeout: Duration,
    ) -> (
        ShardContext,
        async_channel::Sender<Admission>,
        mpsc::Receiver<()>,
    ) {
        let (admit_tx, admit_rx) = async_channel::bounded(1);
        let (rescale_tx, rescale_rx) = mpsc::channel(1);
        let context = ShardContext {
            done: CancellationToken::new(),
            admissions: admit_rx,
            rescale: rescale_tx,
            idle_timeout,
            target_shard_size: 2,
        };
        (context, admit_tx, rescale_rx)
    }

    async fn admit(
        admissions: &async_channel::Sender<Admission>,
        after: u64,
    ) -> (Arc<SubscriptionState>, mpsc::Receiver<()>) {
        let (subscription, notified) = SubscriptionState::new(after);
        let (accepted, on_accepted) = oneshot::channel();
        admissions
            .send(Admission {
                subscription: subscription.clone(),
                accepted,
            })
            .await
            .expect("admission channel should be open");
        on_accepted.await.expect("shard should accept");
        (subscription, notified)
    }

    // A shard admits subscriptions, tracks their lowest `after` and forwards
    // one notification per subscriber.
    #[tokio::test]
    async fn shard_fans_out_and_tracks_watermark() {
        let (context, admissions, mut rescale) = context(Duration::from_secs(60));
        let shard = context.spawn(0);
        assert_eq!(shard.watermark(), u64::MAX);

        let (first, mut first_notified) = admit(&admissions, 5).await;
        let (_second, mut second_notified) = admit(&admissions, 3).await;
        // Reaching the target size asks for a rescale.
        tokio::time::timeout(Duration::from_secs(1), rescale.recv())
            .await
            .expect("rescale should be requested")
            .expect("rescale channel should be open");

        shard.notify();
        tokio::time::timeout(Duration::from_secs(1), first_notified.recv())
            .await
            .expect("first subscriber should be notified");
        tokio::time::timeout(Duration::from_secs(1), second_notified.recv())
            .await
            .expect("second subscriber should be notified");
        assert_eq!(shard.subscription_count(), 2);
        assert_eq!(shard.watermark(), 3);
        assert_eq!(first.after(), 5);

        context.done.cancel();
    }

    // A subscriber that never takes its notification is marked busy and is
    // skipped by later fan-outs.
    #[tokio::test]
    async fn shard_marks_slow_subscriber_busy() {
        let (context, admissions, _rescale) = context(Duration::from_secs(60));
        let shard = context.spawn(0);
        let (slow, _notified) = admit(&admissions, 0).await;

        shard.notify();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!slow.has_flag(BUSY));
        shard.notify();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(slow.has_flag(BUSY));

        context.done.cancel();
    }

    // A draining shard exits once its last subscription stops.
    #[tokio::test]
    async fn draining_shard_exits_when_empty() {
        let (context, admissions, mut rescale) = context(Duration::from_secs(60));
        let shard = context.spawn(7);
        let (subscription, _notified) = admit(&admissions, 0).await;
        let _ = rescale.try_recv();

        assert!(shard.assign_capacity(DRAIN));
        assert!(!shard.assign_capacity(DRAIN));
        subscription.set_flag(DID_STOP);
        shard.notify();

        tokio::time::timeout(Duration::from_secs(1), rescale.recv())
            .await
            .expect("stopping shard should request a rescale")
            .expect("rescale channel should be open");
        assert!(shard.is_stopped());
        assert_eq!(shard.id(), 7);
        assert_eq!(shard.capacity(), DRAIN);
    }

    // A capped shard stops admitting once it is full; raising the cap
    // resumes admission.
    #[tokio::test]
    async fn capped_shard_stops_admitting() {
        let (context, admissions, _rescale) = context(Duration::from_secs(60));
        let shard = context.spawn(0);
        let _ = shard.assign_capacity(1);
        let _first = admit(&admissions, 0).await;

        let pending = tokio::spawn({
            let admissions = admissions.clone();
            async move { admit(&admissions, 0).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!pending.is_finished());
        assert_eq!(shard.subscription_count(), 1);

        let _ = shard.assign_capacity(UNLIMITED);
        let _second = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("admission should resume")
            .expect("admission task should not panic");
        assert_eq!(shard.subscription_count(), 2);

        context.done.cancel();
    }

    // Idle compaction removes stopped subscriptions and resets the watermark.
    #[tokio::test]
    async fn idle_compaction_reclaims_stopped_subscriptions() {
        let (context, admissions, _rescale) = context(Duration::from_millis(20));
        let shard = context.spawn(0);
        let (subscription, _notified) = admit(&admissions, 4).await;
        assert_eq!(shard.watermark(), 4);
        subscription.set_flag(DID_STOP);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(shard.subscription_count(), 0);
        assert_eq!(shard.watermark(), u64::MAX);
        assert!(!shard.is_stopped());

        context.done.cancel();
    }
}
