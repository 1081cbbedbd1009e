// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Declarative topic configuration.
//!
//! [`TopicConfig`] is the serde-facing form of [`TopicOptions`]: durations are
//! plain millisecond integers and `max_shards` may be left unset to follow
//! the host's core count. Conversion validates and reports every problem at
//! once.

use crate::error::Error;
use crate::options::{self, TopicOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Topic configuration as it appears in a configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TopicConfig {
    /// Hard cap on the ring length.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Depth of the publish queue.
    #[serde(default = "default_publish_buffer")]
    pub publish_buffer: usize,
    /// Batch coalescing window in milliseconds.
    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,
    /// Idle timeout in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Desired subscriptions per shard.
    #[serde(default = "default_target_shard_size")]
    pub target_shard_size: usize,
    /// Shard cap. Unset means `max(8, 2 × cores)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_shards: Option<usize>,
    /// Rescale tick period in milliseconds.
    #[serde(default = "default_rescale_interval_ms")]
    pub rescale_interval_ms: u64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            publish_buffer: default_publish_buffer(),
            max_batch_wait_ms: default_max_batch_wait_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            target_shard_size: default_target_shard_size(),
            max_shards: None,
            rescale_interval_ms: default_rescale_interval_ms(),
        }
    }
}

impl TopicConfig {
    /// Converts to runtime options without validating.
    #[must_use]
    pub fn to_options(&self) -> TopicOptions {
        TopicOptions {
            capacity: self.capacity,
            publish_buffer: self.publish_buffer,
            max_batch_wait: Duration::from_millis(self.max_batch_wait_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            target_shard_size: self.target_shard_size,
            max_shards: self.max_shards.unwrap_or_else(options::default_max_shards),
            rescale_interval: Duration::from_millis(self.rescale_interval_ms),
        }
    }

    /// Returns validation errors for this configuration.
    #[must_use]
    pub fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        self.to_options().validation_errors(path_prefix)
    }
}

impl TryFrom<TopicConfig> for TopicOptions {
    type Error = Error;

    fn try_from(config: TopicConfig) -> Result<Self, Self::Error> {
        let options = config.to_options();
        options.validate()?;
        Ok(options)
    }
}

const fn default_capacity() -> usize {
    options::DEFAULT_CAPACITY
}

const fn default_publish_buffer() -> usize {
    options::DEFAULT_PUBLISH_BUFFER
}

const fn default_max_batch_wait_ms() -> u64 {
    5
}

const fn default_idle_timeout_ms() -> u64 {
    10 * 60 * 1000
}

const fn default_target_shard_size() -> usize {
    options::DEFAULT_TARGET_SHARD_SIZE
}

const fn default_rescale_interval_ms() -> u64 {
    60 * 1000
}
