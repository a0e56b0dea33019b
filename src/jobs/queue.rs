//! Per-tier FIFO queues with strict priority across tiers.

use std::collections::{BTreeMap, VecDeque};
use std::cmp::Reverse;

use serde::Serialize;

use super::model::JobId;
use crate::pricing::Tier;

/// One FIFO per tier, drained highest rank first.
#[derive(Debug, Default)]
pub struct QueueSet {
    /// Keyed by descending rank so iteration order is dispatch order.
    queues: BTreeMap<Reverse<u8>, (Tier, VecDeque<JobId>)>,
}

impl QueueSet {
    /// Create a queue set with an empty FIFO for each `(tier, rank)`.
    pub fn new(tiers: impl IntoIterator<Item = (Tier, u8)>) -> Self {
        let queues = tiers
            .into_iter()
            .map(|(tier, rank)| (Reverse(rank), (tier, VecDeque::new())))
            .collect();
        Self { queues }
    }

    /// Append a job to the back of its tier's queue.
    pub fn push(&mut self, tier: Tier, rank: u8, id: JobId) {
        self.queues
            .entry(Reverse(rank))
            .or_insert_with(|| (tier, VecDeque::new()))
            .1
            .push_back(id);
    }

    /// Pop the oldest job from the highest-ranked non-empty tier.
    pub fn pop_next(&mut self) -> Option<(Tier, JobId)> {
        self.queues
            .values_mut()
            .find_map(|(tier, queue)| queue.pop_front().map(|id| (*tier, id)))
    }

    /// Remove a job wherever it sits. Returns whether it was queued.
    pub fn remove(&mut self, id: JobId) -> bool {
        for (_, queue) in self.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|q| *q == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(|(_, q)| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|(_, q)| q.is_empty())
    }

    /// Depth of every tier, highest rank first.
    pub fn depths(&self) -> Vec<TierDepth> {
        self.queues
            .iter()
            .map(|(Reverse(rank), (tier, queue))| TierDepth {
                tier: *tier,
                rank: *rank,
                queued: queue.len(),
            })
            .collect()
    }
}

/// Queue depth of one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierDepth {
    pub tier: Tier,
    pub rank: u8,
    pub queued: usize,
}
