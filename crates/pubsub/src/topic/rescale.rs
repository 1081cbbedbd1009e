// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Shard set owned by the publisher loop, and the rescaling policy.
//!
//! Rescaling never moves subscriptions. It only changes which shards admit
//! new ones: the busiest half admits without limit so registration never
//! stalls, the rest are capped at the average size, and surplus shards drain
//! by attrition.

use super::shard::{DRAIN, ShardContext, ShardState, UNLIMITED};
use std::sync::Arc;
use tracing::debug;

/// Number of shards wanted for `total` subscriptions.
pub(crate) fn wanted_shards(total: u64, target_shard_size: usize, max_shards: usize) -> usize {
    let target = (target_shard_size as u64).max(1);
    let wanted = usize::try_from(total.div_ceil(target)).unwrap_or(usize::MAX);
    wanted.clamp(1, max_shards.max(1))
}

/// Capacity assigned to the shard at `position` in the count-descending
/// order.
pub(crate) fn shard_capacity(position: usize, want: usize, total: u64) -> i64 {
    if position >= want {
        DRAIN
    } else if position < want.div_ceil(2) {
        UNLIMITED
    } else {
        i64::try_from(total / want as u64).unwrap_or(i64::MAX)
    }
}

/// Live shards, kept sorted by subscription count, descending.
pub(crate) struct ShardSet {
    context: ShardContext,
    shards: Vec<Arc<ShardState>>,
    next_id: usize,
    target_shard_size: usize,
    max_shards: usize,
}

impl ShardSet {
    pub(crate) fn new(context: ShardContext, target_shard_size: usize, max_shards: usize) -> Self {
        Self {
            context,
            shards: Vec::new(),
            next_id: 0,
            target_shard_size,
            max_shards,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.len()
    }

    /// Global watermark: the lowest live shard watermark, clamped to
    /// `last_index`. Zero when no shard is live.
    pub(crate) fn watermark(&self, last_index: u64) -> u64 {
        self.shards
            .iter()
            .filter(|shard| !shard.is_stopped())
            .map(|shard| shard.watermark())
            .min()
            .map_or(0, |watermark| watermark.min(last_index))
    }

    /// Wakes every shard once.
    pub(crate) fn notify_all(&self) {
        for shard in &self.shards {
            shard.notify();
        }
    }

    /// Releases spare vector capacity after the set shrank.
    pub(crate) fn compact(&mut self) {
        if self.shards.len() < self.shards.capacity() / 2 {
            self.shards.shrink_to_fit();
        }
    }

    /// Rebalances admission across shards, spawning shards up to the wanted
    /// count and marking surplus ones for draining.
    pub(crate) fn rescale(&mut self) {
        let mut snapshot: Vec<(Arc<ShardState>, u64)> = self
            .shards
            .drain(..)
            .filter(|shard| !shard.is_stopped())
            .map(|shard| {
                let count = shard.subscription_count();
                (shard, count)
            })
            .collect();
        snapshot.sort_by(|a, b| b.1.cmp(&a.1));
        let total: u64 = snapshot.iter().map(|(_, count)| count).sum();
        self.shards
            .extend(snapshot.into_iter().map(|(shard, _)| shard));

        let want = wanted_shards(total, self.target_shard_size, self.max_shards);
        while self.shards.len() < want {
            let shard = self.context.spawn(self.next_id);
            self.next_id += 1;
            self.shards.push(shard);
        }

        let mut reloaded = 0usize;
        for (position, shard) in self.shards.iter().enumerate() {
            if shard.assign_capacity(shard_capacity(position, want, total)) {
                reloaded += 1;
            }
        }
        debug!(
            total,
            want,
            shards = self.shards.len(),
            reloaded,
            "rescaled topic shards"
        );
    }

    #[cfg(test)]
    pub(crate) fn shards(&self) -> &[Arc<ShardState>] {
        &self.shards
    }
}
