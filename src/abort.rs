//! Abort handling and escalation of repeatedly conflicting items
//!
//! An aborted item is cheap to retry on the worker that aborted it, but under
//! high contention local retries can starve each other forever. The handler
//! therefore escalates items as their retry count grows: first retry in
//! place, then hop up a binary tree of workers toward the group leader, then
//! hop across groups toward worker 0. Since worker 0 forwards to itself,
//! persistently conflicting items end up serialized at a single point and
//! must eventually commit.

use crate::topology::Topology;
use crossbeam::{queue::SegQueue, utils::CachePadded};

/// An aborted item together with the number of attempts made so far
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AbortRecord<T> {
    /// The work item to retry
    pub item: T,

    /// Number of aborted attempts, starting at 1 and driving escalation
    pub retries: u32,
}
//
impl<T> AbortRecord<T> {
    /// Record the first abort of a fresh item
    pub fn first(item: T) -> Self {
        Self { item, retries: 1 }
    }

    /// Record one more aborted attempt
    pub fn bump(mut self) -> Self {
        self.retries += 1;
        self
    }
}

/// Escalation policy selecting where a retried item goes next
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Escalation {
    /// [`Escalation::Direct`] when the topology has more than two groups,
    /// [`Escalation::Tiered`] otherwise
    #[default]
    Auto,

    /// Retry locally every other abort, in between hop up the intra-group
    /// worker tree, then across groups
    ///
    /// Cheapest under low contention since most retries stay on the aborting
    /// worker and cross-thread traffic only builds up gradually.
    Tiered,

    /// Forward straight into the inter-group tree on every abort
    ///
    /// With many groups, the intermediate intra-group tier mostly adds
    /// latency before the inevitable funneling, so skip it.
    Direct,
}

/// Per-worker retry queues plus the policy routing items between them
///
/// Each queue belongs to one worker, which is the only one popping from it;
/// any worker may push into it when forwarding an escalated item, hence the
/// concurrent queue type.
#[derive(Debug)]
pub(crate) struct AbortHandler<T> {
    /// Retry queue of each worker
    queues: Box<[CachePadded<SegQueue<AbortRecord<T>>>]>,

    /// Resolved escalation policy (never [`Escalation::Auto`])
    policy: Escalation,
}
//
impl<T> AbortHandler<T> {
    /// Set up retry queues for every worker of `topology`
    pub fn new(topology: &Topology, policy: Escalation) -> Self {
        let policy = match policy {
            Escalation::Auto if topology.num_groups() > 2 => Escalation::Direct,
            Escalation::Auto => Escalation::Tiered,
            other => other,
        };
        Self {
            queues: (0..topology.num_workers())
                .map(|_| CachePadded::new(SegQueue::new()))
                .collect(),
            policy,
        }
    }

    /// Queue a freshly aborted item for local retry on worker `idx`
    ///
    /// The first retry is always local: one conflict is no evidence of
    /// contention worth paying cross-thread traffic for.
    pub fn record_first(&self, idx: usize, item: T) {
        self.queues[idx].push(AbortRecord::first(item));
    }

    /// Route a re-aborted record from worker `idx` toward serialization
    pub fn escalate(&self, topology: &Topology, idx: usize, record: AbortRecord<T>) {
        let target = match self.policy {
            Escalation::Tiered => self.tiered_target(topology, idx, record.retries),
            Escalation::Direct => self.direct_target(topology, idx),
            Escalation::Auto => unreachable!("policy resolved at construction"),
        };
        if target != idx {
            log::trace!(
                "escalating item after {} retries: worker {idx} -> worker {target}",
                record.retries,
            );
        }
        self.queues[target].push(record);
    }

    /// Pop one record from worker `idx`'s own retry queue
    pub fn pop_local(&self, idx: usize) -> Option<AbortRecord<T>> {
        self.queues[idx].pop()
    }

    /// Best-effort check that no retry queue holds an item
    ///
    /// Only meaningful while no worker is processing or forwarding, which is
    /// the case in the post-barrier termination re-check where it is used.
    pub fn all_empty(&self) -> bool {
        self.queues.iter().all(|queue| queue.is_empty())
    }

    /// Three-tier policy: local retry, intra-group tree, inter-group tree
    ///
    /// `retries` has already been bumped for the abort being handled; the
    /// count before it selects the tier, so a persistent conflicter
    /// alternates between one local retry and one hop toward serialization.
    fn tiered_target(&self, topology: &Topology, idx: usize, retries: u32) -> usize {
        if (retries - 1) % 2 == 1 {
            return idx;
        }
        let leader = topology.leader_of(idx);
        if idx != leader {
            // Halve the distance to the group leader
            leader + (idx - leader) / 2
        } else {
            self.direct_target(topology, idx)
        }
    }

    /// Two-tier policy: straight to the leader of the parent group
    ///
    /// Halving the group index funnels every chain of forwards to the leader
    /// of group 0, i.e. worker 0, which forwards to itself from then on.
    fn direct_target(&self, topology: &Topology, idx: usize) -> usize {
        topology.leader_of_group(topology.group_of(idx) / 2)
    }
}
