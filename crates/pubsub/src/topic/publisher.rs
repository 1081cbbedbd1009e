// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! The publisher loop: the single task allowed to change the ring structure
//! and the shard set.

use super::TopicShared;
use super::rescale::ShardSet;
use super::ring::RingWriter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// A value waiting to be appended.
pub(crate) struct PublishRequest<T> {
    pub(crate) value: T,
    // Set for rendezvous publishes.
    pub(crate) acceptance: Option<Acceptance>,
}

/// Loop side of a rendezvous publish.
///
/// The loop and the publisher race to settle the request: the loop claims it
/// before pushing, a cancelled publisher withdraws it. Whichever flips the
/// flag first decides whether the value reaches the ring.
pub(crate) struct Acceptance {
    settled: Arc<AtomicBool>,
    accepted: oneshot::Sender<()>,
}

/// Publisher side of a rendezvous publish.
pub(crate) struct PendingAcceptance {
    settled: Arc<AtomicBool>,
    pub(crate) accepted: oneshot::Receiver<()>,
}

pub(crate) fn acceptance() -> (Acceptance, PendingAcceptance) {
    let settled = Arc::new(AtomicBool::new(false));
    let (accepted, on_accepted) = oneshot::channel();
    (
        Acceptance {
            settled: settled.clone(),
            accepted,
        },
        PendingAcceptance {
            settled,
            accepted: on_accepted,
        },
    )
}

impl Acceptance {
    /// Returns `false` when the publisher withdrew first.
    fn claim(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    /// Fires once the claimed value is in the ring.
    fn confirm(self) {
        _ = self.accepted.send(());
    }
}

impl PendingAcceptance {
    /// Returns `false` when the loop claimed the value first; it is then
    /// published regardless and [`Self::accepted`] fires shortly.
    pub(crate) fn withdraw(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }
}

/// Timing and sizing knobs of the loop.
pub(crate) struct LoopSettings {
    pub(crate) capacity: usize,
    pub(crate) max_batch_wait: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) rescale_interval: Duration,
}

pub(crate) struct PublisherLoop<T> {
    shared: Arc<TopicShared<T>>,
    writer: RingWriter<T>,
    shards: ShardSet,
    publishes: mpsc::Receiver<PublishRequest<T>>,
    rescale_requests: mpsc::Receiver<()>,
    settings: LoopSettings,
}

impl<T> PublisherLoop<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        shared: Arc<TopicShared<T>>,
        writer: RingWriter<T>,
        shards: ShardSet,
        publishes: mpsc::Receiver<PublishRequest<T>>,
        rescale_requests: mpsc::Receiver<()>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            shared,
            writer,
            shards,
            publishes,
            rescale_requests,
            settings,
        }
    }

    pub(crate) fn rescale(&mut self) {
        self.shards.rescale();
        self.shared.set_shard_count(self.shards.len());
    }

    pub(crate) async fn run(mut self) {
        let LoopSettings {
            idle_timeout,
            rescale_interval,
            ..
        } = self.settings;
        let mut rescale_tick =
            tokio::time::interval_at(Instant::now() + rescale_interval, rescale_interval);
        rescale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);
        let mut idle_armed = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shared.done.cancelled() => break,
                Some(()) = self.rescale_requests.recv() => self.rescale(),
                _ = rescale_tick.tick() => self.rescale(),
                request = self.publishes.recv() => {
                    let Some(request) = request else {
                        // Every topic handle is gone; nothing can publish
                        // again.
                        self.shared.done.cancel();
                        break;
                    };
                    self.publish_batch(request);
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    idle_armed = true;
                }
                () = &mut idle, if idle_armed => {
                    idle_armed = self.on_idle();
                    if idle_armed {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                }
            }
        }
        debug!(last_index = self.shared.ring.last_index(), "topic stopped");
    }

    /// Appends `first` and whatever else is queued within the batch window,
    /// then wakes every shard once.
    fn publish_batch(&mut self, first: PublishRequest<T>) {
        let started = Instant::now();
        let mut size = usize::from(self.accept(first));
        while size < self.settings.capacity && started.elapsed() < self.settings.max_batch_wait {
            match self.publishes.try_recv() {
                Ok(request) => size += usize::from(self.accept(request)),
                Err(_) => break,
            }
        }
        if size == 0 {
            return;
        }
        self.shards.notify_all();
        trace!(
            size,
            last_index = self.shared.ring.last_index(),
            ring_len = self.writer.len(),
            "flushed publish batch"
        );
    }

    fn accept(&mut self, request: PublishRequest<T>) -> bool {
        let PublishRequest { value, acceptance } = request;
        if acceptance.as_ref().is_some_and(|acceptance| !acceptance.claim()) {
            // The publisher gave up before the loop got to it.
            return false;
        }
        let watermark = self.watermark();
        _ = self.writer.push(value, watermark);
        if let Some(acceptance) = acceptance {
            acceptance.confirm();
        }
        true
    }

    /// Lowest index still needed by a subscription, registered or not.
    fn watermark(&self) -> u64 {
        // Pending floors first: a floor is only released after its shard has
        // lowered its own watermark.
        let floor = self.shared.pending.floor();
        self.shards
            .watermark(self.shared.ring.last_index())
            .min(floor)
    }

    /// Shrinks the ring and returns whether the idle timer should stay armed.
    fn on_idle(&mut self) -> bool {
        let watermark = self.watermark();
        let released = self.writer.shrink(watermark);
        if released > 0 {
            debug!(
                released,
                watermark,
                ring_len = self.writer.len(),
                "ring shrunk"
            );
        }
        self.shards.compact();
        !(self.writer.len() == 1 && self.shards.len() <= 2)
    }
}
