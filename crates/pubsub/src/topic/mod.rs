// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! In-memory topic: ring, publisher loop, shards and subscriptions.
//!
//! ```text
//!   publish() ──► publish channel ──► PublisherLoop ──► EventRing (cells)
//!                                         │    ▲                ▲
//!                              notify     ▼    │ rescale        │ read
//!                                      ShardWorker × n          │
//!                                         │ notify              │
//!                                         ▼                     │
//!                                      Subscription ────────────┘
//! ```
//!
//! The publisher loop is the only writer of the ring structure and of the
//! shard set. Shards never touch the ring; they only relay wake-ups and report
//! the lowest index their subscribers still need (the watermark). Subscribers
//! read cells directly and validate each one against the index they expect.

mod publisher;
mod rescale;
mod ring;
mod shard;
mod subscription;


pub use subscription::{Delivery, Subscription};

use crate::error::Error;
use crate::options::TopicOptions;
use futures_core::Stream;
use publisher::{LoopSettings, PublishRequest, PublisherLoop};
use rescale::ShardSet;
use ring::EventRing;
use shard::ShardContext;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use subscription::{Admission, PendingRegistrations};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Largest payload accepted by value. Bigger payloads go behind an `Arc`.
pub const MAX_INLINE_PAYLOAD: usize = 128;

/// The future type returned by [`Topic::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;

/// The stream type returned by [`Topic::subscribe`].
pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<Delivery<T>, Error>> + Send>>;

/// Publish/subscribe contract shared by topic implementations.
pub trait Topic<T>: Send + Sync {
    /// Publishes `value`, see [`InMemoryTopic::publish`].
    fn publish<'a>(&'a self, ctx: &'a CancellationToken, value: T) -> PublishFuture<'a>;

    /// Subscribes to events published from now on.
    fn subscribe(&self, ctx: CancellationToken) -> EventStream<T>;
}

/// State reachable from every handle and subscription.
pub(crate) struct TopicShared<T> {
    pub(crate) ring: Arc<EventRing<T>>,
    pub(crate) done: CancellationToken,
    pub(crate) admissions: async_channel::Sender<Admission>,
    pub(crate) pending: PendingRegistrations,
    shard_count: AtomicUsize,
}

impl<T> TopicShared<T> {
    pub(crate) fn set_shard_count(&self, count: usize) {
        self.shard_count.store(count, Ordering::Relaxed);
    }
}

/// Point-in-time counters of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicStats {
    /// Index of the most recent event, 0 before the first publish.
    pub last_index: u64,
    /// Current number of ring slots.
    pub ring_len: usize,
    /// Live shard count as of the last rescale.
    pub shards: usize,
}

/// Self-scaling in-memory topic.
///
/// Cloning is cheap and shares the topic. The publisher loop stops when the
/// [`TopicDisposer`] fires or when every handle is dropped; either way,
/// subscriptions end with [`Error::TopicDisposed`].
pub struct InMemoryTopic<T> {
    shared: Arc<TopicShared<T>>,
    publishes: mpsc::Sender<PublishRequest<T>>,
    rendezvous: bool,
}

impl<T> Clone for InMemoryTopic<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            publishes: self.publishes.clone(),
            rendezvous: self.rendezvous,
        }
    }
}

/// Disposes a topic.
#[derive(Debug, Clone)]
pub struct TopicDisposer {
    done: CancellationToken,
}

impl TopicDisposer {
    /// Stops the topic. Pending and future publishes fail with
    /// [`Error::TopicDisposed`]; each subscription yields it once and ends.
    /// Idempotent.
    pub fn dispose(&self) {
        if !self.done.is_cancelled() {
            debug!("topic disposed");
        }
        self.done.cancel();
    }

    /// Returns `true` once the topic has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.done.is_cancelled()
    }
}

impl<T> InMemoryTopic<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a topic and starts its background tasks.
    ///
    /// # Panics
    ///
    /// Panics on invalid options, when `T` is larger than
    /// [`MAX_INLINE_PAYLOAD`] bytes, or outside a Tokio runtime.
    #[must_use]
    pub fn new(options: TopicOptions) -> (Self, TopicDisposer) {
        match Self::try_new(options) {
            Ok(topic) => topic,
            Err(err) => panic!("{err}"),
        }
    }

    /// Creates a topic, rejecting invalid options.
    ///
    /// # Panics
    ///
    /// Panics when `T` is larger than [`MAX_INLINE_PAYLOAD`] bytes, or outside
    /// a Tokio runtime.
    pub fn try_new(options: TopicOptions) -> Result<(Self, TopicDisposer), Error> {
        assert!(
            size_of::<T>() <= MAX_INLINE_PAYLOAD,
            "topic payload is {} bytes, wrap it in an Arc to stay within {MAX_INLINE_PAYLOAD}",
            size_of::<T>()
        );
        options.validate()?;

        let (ring, writer) = EventRing::new(options.capacity);
        let done = CancellationToken::new();
        let (admissions_tx, admissions_rx) = async_channel::bounded(1);
        let (publishes_tx, publishes_rx) = mpsc::channel(options.publish_buffer.max(1));
        let (rescale_tx, rescale_rx) = mpsc::channel(1);

        let shared = Arc::new(TopicShared {
            ring,
            done: done.clone(),
            admissions: admissions_tx,
            pending: PendingRegistrations::default(),
            shard_count: AtomicUsize::new(0),
        });
        let shards = ShardSet::new(
            ShardContext {
                done: done.clone(),
                admissions: admissions_rx,
                rescale: rescale_tx,
                idle_timeout: options.idle_timeout,
                target_shard_size: options.target_shard_size as u64,
            },
            options.target_shard_size,
            options.max_shards,
        );
        let mut publisher = PublisherLoop::new(
            shared.clone(),
            writer,
            shards,
            publishes_rx,
            rescale_rx,
            LoopSettings {
                capacity: options.capacity,
                max_batch_wait: options.max_batch_wait,
                idle_timeout: options.idle_timeout,
                rescale_interval: options.rescale_interval,
            },
        );
        publisher.rescale();
        _ = tokio::spawn(publisher.run());
        debug!(
            capacity = options.capacity,
            publish_buffer = options.publish_buffer,
            max_shards = options.max_shards,
            "topic started"
        );

        let topic = Self {
            shared,
            publishes: publishes_tx,
            rendezvous: options.publish_buffer == 0,
        };
        Ok((topic, TopicDisposer { done }))
    }

    /// Publishes `value`.
    ///
    /// Returns once the publisher loop has accepted the value. With a zero
    /// publish buffer that means the value is already in the ring, so a
    /// subscription created afterwards never sees it. A publish that returns
    /// [`Error::Cancelled`] never reaches the ring; one cancelled after the
    /// loop claimed its value returns `Ok(())`.
    pub async fn publish(&self, ctx: &CancellationToken, value: T) -> Result<(), Error> {
        let (acceptance, pending) = if self.rendezvous {
            let (acceptance, pending) = publisher::acceptance();
            (Some(acceptance), Some(pending))
        } else {
            (None, None)
        };
        let request = PublishRequest { value, acceptance };
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = self.shared.done.cancelled() => return Err(Error::TopicDisposed),
            sent = self.publishes.send(request) => {
                sent.map_err(|_| Error::TopicDisposed)?;
            }
        }
        let Some(mut pending) = pending else {
            return Ok(());
        };
        let abandoned = tokio::select! {
            biased;
            outcome = &mut pending.accepted => {
                return outcome.map_err(|_| Error::TopicDisposed);
            }
            _ = ctx.cancelled() => Error::Cancelled,
            _ = self.shared.done.cancelled() => Error::TopicDisposed,
        };
        if pending.withdraw() {
            return Err(abandoned);
        }
        // Claimed by the loop before we gave up: the push is under way.
        pending.accepted.await.map_err(|_| Error::TopicDisposed)
    }

    /// Subscribes to events published after this call.
    ///
    /// The subscription registers with a shard lazily, on the first
    /// [`Subscription::recv`]. Events published in between are retained for
    /// it, within the ring capacity.
    #[must_use]
    pub fn subscribe(&self, ctx: CancellationToken) -> Subscription<T> {
        Subscription::new(self.shared.clone(), ctx)
    }

    /// Returns current counters.
    #[must_use]
    pub fn stats(&self) -> TopicStats {
        TopicStats {
            last_index: self.shared.ring.last_index(),
            ring_len: self.shared.ring.len(),
            shards: self.shared.shard_count.load(Ordering::Relaxed),
        }
    }

    /// Returns `true` once the topic has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.done.is_cancelled()
    }
}

impl<T> Topic<T> for InMemoryTopic<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn publish<'a>(&'a self, ctx: &'a CancellationToken, value: T) -> PublishFuture<'a> {
        Box::pin(InMemoryTopic::publish(self, ctx, value))
    }

    fn subscribe(&self, ctx: CancellationToken) -> EventStream<T> {
        Box::pin(InMemoryTopic::subscribe(self, ctx))
    }
}

impl<T> std::fmt::Debug for InMemoryTopic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTopic")
            .field("last_index", &self.shared.ring.last_index())
            .field("ring_len", &self.shared.ring.len())
            .field("capacity", &self.shared.ring.capacity())
            .field("disposed", &self.shared.done.is_cancelled())
            .finish_non_exhaustive()
    }
}
