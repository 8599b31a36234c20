// queue.rs — Bounded pending-change queue.
//
// Changes arrive from the host faster than they are committed. Only the
// newest snapshot is ever written, but the queue keeps a short history so
// a commit can clear exactly the changes it covered. Once the bound is
// reached the oldest entries are dropped.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use redstring_document::GraphSnapshot;
use tracing::{debug, warn};

/// One queued change.
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// Monotonic sequence number assigned at enqueue time.
    pub seq: u64,
    pub snapshot: GraphSnapshot,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PendingQueue {
    queue: VecDeque<PendingChange>,
    max: usize,
    next_seq: u64,
    dropped: u64,
}

impl PendingQueue {
    pub fn new(max: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max: max.max(1),
            next_seq: 0,
            dropped: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total changes dropped since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Enqueue a change, dropping the oldest if full. Returns the number of
    /// changes dropped by this call.
    pub fn push(&mut self, snapshot: GraphSnapshot, now: DateTime<Utc>, slug: &str) -> u64 {
        let mut dropped = 0;
        while self.queue.len() >= self.max {
            self.queue.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.dropped += dropped;
            warn!(slug, max = self.max, dropped, "pending queue full; dropped oldest change");
        }

        self.next_seq += 1;
        self.queue.push_back(PendingChange {
            seq: self.next_seq,
            snapshot,
            queued_at: now,
        });
        debug!(slug, pending = self.queue.len(), "queued change");
        dropped
    }

    /// The newest queued change.
    pub fn latest(&self) -> Option<&PendingChange> {
        self.queue.back()
    }

    /// Sequence number of the newest change ever queued (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.next_seq
    }

    /// Remove every change with `seq <= upto`; later arrivals stay queued.
    pub fn clear_through(&mut self, upto: u64) {
        self.queue.retain(|c| c.seq > upto);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redstring_document::Node;

    fn snapshot(id: &str) -> GraphSnapshot {
        let mut s = GraphSnapshot::default();
        s.nodes.insert(Node::new(id, id));
        s
    }

    #[test]
    fn drops_oldest_beyond_bound() {
        let mut queue = PendingQueue::new(2);
        let now = Utc::now();
        assert_eq!(queue.push(snapshot("a"), now, "w"), 0);
        assert_eq!(queue.push(snapshot("b"), now, "w"), 0);
        assert_eq!(queue.push(snapshot("c"), now, "w"), 1);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert!(queue.latest().unwrap().snapshot.nodes.contains("c"));
    }

    #[test]
    fn clear_through_keeps_later_arrivals() {
        let mut queue = PendingQueue::new(10);
        let now = Utc::now();
        queue.push(snapshot("a"), now, "w");
        queue.push(snapshot("b"), now, "w");
        let covered = queue.last_seq();
        queue.push(snapshot("c"), now, "w");

        queue.clear_through(covered);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.latest().unwrap().seq, covered + 1);
    }
}
