// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Cyclic event log shared by the publisher loop and every subscriber.
//!
//! The ring is an arena of `capacity` nodes allocated once and linked into a
//! cycle through atomic node ids. Only the publisher loop changes the links
//! (through [`RingWriter`]); readers follow them without locks and validate
//! every cell they read against the index they expect. Arena nodes are never
//! released while the topic lives, so a stale cursor is always safe to
//! dereference and is detected through the stored index.

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Position of a node inside the ring arena.
pub(crate) type NodeId = usize;

/// One published event. Immutable once stored in a cell.
#[derive(Debug)]
pub(crate) struct Event<T> {
    pub(crate) index: u64,
    pub(crate) value: T,
}

struct Node<T> {
    // `None` for slots that were never written or were recycled by a shrink.
    cell: ArcSwapOption<Event<T>>,
    next: AtomicUsize,
    prev: AtomicUsize,
}

impl<T> Node<T> {
    fn new(id: NodeId) -> Self {
        Self {
            cell: ArcSwapOption::empty(),
            next: AtomicUsize::new(id),
            prev: AtomicUsize::new(id),
        }
    }
}

/// Read side of the event log.
pub(crate) struct EventRing<T> {
    nodes: Box<[Node<T>]>,
    // Next node to be written.
    tail: AtomicUsize,
    last_index: AtomicU64,
    // Mirror of the writer's length for stats.
    len: AtomicUsize,
}

impl<T> EventRing<T> {
    /// Creates a ring with a single self-linked node and its exclusive writer.
    pub(crate) fn new(capacity: usize) -> (Arc<Self>, RingWriter<T>) {
        debug_assert!(capacity > 0, "ring capacity must be greater than zero");
        let nodes = (0..capacity).map(Node::new).collect::<Vec<_>>();
        let ring = Arc::new(Self {
            nodes: nodes.into_boxed_slice(),
            tail: AtomicUsize::new(0),
            last_index: AtomicU64::new(0),
            len: AtomicUsize::new(1),
        });
        // Node 0 is live; the rest wait in the free pool. Popping from the
        // back hands out low ids first.
        let free = (1..capacity).rev().collect();
        let writer = RingWriter {
            ring: ring.clone(),
            len: 1,
            free,
        };
        (ring, writer)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    pub(crate) fn tail(&self) -> NodeId {
        self.tail.load(Ordering::Acquire)
    }

    pub(crate) fn next(&self, node: NodeId) -> NodeId {
        self.nodes[node].next.load(Ordering::Acquire)
    }

    pub(crate) fn prev(&self, node: NodeId) -> NodeId {
        self.nodes[node].prev.load(Ordering::Acquire)
    }

    /// Returns the event stored at `node`, if any.
    pub(crate) fn load(&self, node: NodeId) -> Option<Arc<Event<T>>> {
        self.nodes[node].cell.load_full()
    }

    /// Index stored at `node`, 0 for an empty cell.
    pub(crate) fn cell_index(&self, node: NodeId) -> u64 {
        self.nodes[node]
            .cell
            .load()
            .as_ref()
            .map_or(0, |event| event.index)
    }

    /// Locates the earliest event of the contiguous run that ends at the most
    /// recently written slot, stopping early once the run reaches `after + 1`.
    ///
    /// The returned event may still be at or below `after` when the newest
    /// push has bumped `last_index` but not yet stored its cell; callers must
    /// compare the index before surfacing it.
    pub(crate) fn earliest_event(&self, after: u64) -> Option<(NodeId, Arc<Event<T>>)> {
        let mut cursor = self.prev(self.tail());
        let mut event = self.load(cursor)?;
        // A cycle never holds more than `capacity` events.
        for _ in 1..self.capacity() {
            if event.index <= after + 1 {
                break;
            }
            let prev = self.prev(cursor);
            match self.load(prev) {
                Some(prev_event) if prev_event.index + 1 == event.index => {
                    cursor = prev;
                    event = prev_event;
                }
                _ => break,
            }
        }
        Some((cursor, event))
    }
}

/// Exclusive write access to the ring structure, owned by the publisher loop.
pub(crate) struct RingWriter<T> {
    ring: Arc<EventRing<T>>,
    len: usize,
    // Arena nodes currently unlinked from the cycle.
    free: Vec<NodeId>,
}

impl<T> RingWriter<T> {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Appends `value` at the tail and returns its index.
    ///
    /// When the slot about to be overwritten next still holds an event above
    /// `watermark` and the ring is below capacity, an empty node is linked in
    /// right after the written slot instead.
    pub(crate) fn push(&mut self, value: T, watermark: u64) -> u64 {
        let ring = &*self.ring;
        let index = ring.last_index.load(Ordering::Relaxed) + 1;
        ring.last_index.store(index, Ordering::Release);

        let tail = ring.tail.load(Ordering::Relaxed);
        ring.nodes[tail]
            .cell
            .store(Some(Arc::new(Event { index, value })));

        let next = ring.next(tail);
        let grow = self.len < ring.capacity() && ring.cell_index(next) > watermark;
        let new_tail = if grow {
            self.link_after(tail).unwrap_or(next)
        } else {
            next
        };
        self.ring.tail.store(new_tail, Ordering::Release);
        index
    }

    fn link_after(&mut self, at: NodeId) -> Option<NodeId> {
        let ring = &*self.ring;
        let Some(node) = self.free.pop() else {
            debug_assert!(false, "free pool exhausted below capacity");
            return None;
        };
        let next = ring.next(at);
        let slot = &ring.nodes[node];
        slot.cell.store(None);
        slot.next.store(next, Ordering::Relaxed);
        slot.prev.store(at, Ordering::Relaxed);
        ring.nodes[next].prev.store(node, Ordering::Release);
        ring.nodes[at].next.store(node, Ordering::Release);
        self.set_len(self.len + 1);
        Some(node)
    }

    /// Shrinks the ring after an idle period and returns the number of slots
    /// released.
    ///
    /// With `under = watermark - oldest`, the target length is
    /// `max(len / 2, len - under)` and never below one. Slots are unlinked
    /// starting right after the tail, which is never released.
    pub(crate) fn shrink(&mut self, watermark: u64) -> usize {
        let ring = &*self.ring;
        if watermark == 0 || self.len <= 1 {
            return 0;
        }
        let tail = ring.tail.load(Ordering::Relaxed);
        let oldest = match ring.cell_index(tail) {
            0 => ring.cell_index(ring.next(tail)),
            index => index,
        };
        if oldest == 0 || oldest > watermark {
            return 0;
        }
        let under = usize::try_from(watermark - oldest).unwrap_or(usize::MAX);
        let target = (self.len / 2).max(self.len.saturating_sub(under)).max(1);
        let remove = self.len - target;
        if remove == 0 {
            return 0;
        }

        let mut cursor = ring.next(tail);
        for _ in 0..remove {
            debug_assert_ne!(cursor, tail, "shrink must never unlink the tail");
            debug_assert!(
                ring.cell_index(cursor) <= watermark,
                "shrink must never release an event above the watermark"
            );
            let next = ring.next(cursor);
            ring.nodes[cursor].cell.store(None);
            self.free.push(cursor);
            cursor = next;
        }
        ring.nodes[cursor].prev.store(tail, Ordering::Release);
        ring.nodes[tail].next.store(cursor, Ordering::Release);
        self.set_len(target);
        remove
    }

    fn set_len(&mut self, len: usize) {
        self.len = len;
        self.ring.len.store(len, Ordering::Relaxed);
    }
}
