// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Construction parameters for [`InMemoryTopic`](crate::InMemoryTopic).

use crate::error::Error;
use std::time::Duration;

/// Default hard cap on the ring length.
pub const DEFAULT_CAPACITY: usize = 1024;
/// Default depth of the queue between publishers and the publisher loop.
pub const DEFAULT_PUBLISH_BUFFER: usize = 16;
/// Default upper bound on batch coalescing.
pub const DEFAULT_MAX_BATCH_WAIT: Duration = Duration::from_millis(5);
/// Default inactivity threshold before the ring shrinks and shards compact.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Default desired number of subscriptions per shard.
pub const DEFAULT_TARGET_SHARD_SIZE: usize = 512;
/// Default period of the rescale tick.
pub const DEFAULT_RESCALE_INTERVAL: Duration = Duration::from_secs(60);

/// Options for creating a topic.
///
/// Values are checked by [`TopicOptions::validate`] when the topic is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOptions {
    /// Hard cap on the ring length. A subscriber that falls further behind
    /// than this drops events.
    pub capacity: usize,
    /// Bounded queue between publishers and the publisher loop. Zero turns
    /// publish into a rendezvous with the loop.
    pub publish_buffer: usize,
    /// How long the publisher loop keeps coalescing a burst before waking
    /// the shards. This is a maximum, not a minimum: an empty queue flushes
    /// immediately.
    pub max_batch_wait: Duration,
    /// Inactivity threshold after which the ring shrinks and shards compact.
    pub idle_timeout: Duration,
    /// Desired average number of subscriptions per shard.
    pub target_shard_size: usize,
    /// Hard cap on concurrently live shards. Shards are never preallocated;
    /// an idle topic runs a single one.
    pub max_shards: usize,
    /// Period of the background rescale tick.
    pub rescale_interval: Duration,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            publish_buffer: DEFAULT_PUBLISH_BUFFER,
            max_batch_wait: DEFAULT_MAX_BATCH_WAIT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            target_shard_size: DEFAULT_TARGET_SHARD_SIZE,
            max_shards: default_max_shards(),
            rescale_interval: DEFAULT_RESCALE_INTERVAL,
        }
    }
}

impl TopicOptions {
    /// Sets the ring capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the publish queue depth.
    #[must_use]
    pub fn with_publish_buffer(mut self, publish_buffer: usize) -> Self {
        self.publish_buffer = publish_buffer;
        self
    }

    /// Sets the maximum batch coalescing window.
    #[must_use]
    pub fn with_max_batch_wait(mut self, max_batch_wait: Duration) -> Self {
        self.max_batch_wait = max_batch_wait;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the desired shard size.
    #[must_use]
    pub fn with_target_shard_size(mut self, target_shard_size: usize) -> Self {
        self.target_shard_size = target_shard_size;
        self
    }

    /// Sets the shard cap.
    #[must_use]
    pub fn with_max_shards(mut self, max_shards: usize) -> Self {
        self.max_shards = max_shards;
        self
    }

    /// Sets the rescale tick period.
    #[must_use]
    pub fn with_rescale_interval(mut self, rescale_interval: Duration) -> Self {
        self.rescale_interval = rescale_interval;
        self
    }

    /// Returns validation errors for these options, each prefixed with
    /// `path_prefix`.
    #[must_use]
    pub fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.capacity == 0 {
            errors.push(format!("{path_prefix}.capacity must be greater than 0"));
        }
        if self.target_shard_size == 0 {
            errors.push(format!(
                "{path_prefix}.target_shard_size must be greater than 0"
            ));
        }
        if self.max_shards == 0 {
            errors.push(format!("{path_prefix}.max_shards must be greater than 0"));
        }
        if self.idle_timeout.is_zero() {
            errors.push(format!("{path_prefix}.idle_timeout must be greater than 0"));
        }
        if self.rescale_interval.is_zero() {
            errors.push(format!(
                "{path_prefix}.rescale_interval must be greater than 0"
            ));
        }
        errors
    }

    /// Checks the options, joining every problem into one
    /// [`Error::InvalidOptions`].
    pub fn validate(&self) -> Result<(), Error> {
        let errors = self.validation_errors("topic");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidOptions {
                reason: errors.join("; "),
            })
        }
    }
}

/// `max(8, 2 × available cores)`.
#[must_use]
pub fn default_max_shards() -> usize {
    let available_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (available_cores * 2).max(8)
}
