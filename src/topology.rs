//! Precomputed worker topology table
//!
//! The abort-escalation policy routes repeatedly conflicting items toward
//! coarser serialization points: first up a binary tree of workers inside a
//! topology group, then across groups toward worker 0. To keep every routing
//! decision O(1) and side-effect-free, the group and leader relationships are
//! computed once per invocation into this immutable table rather than derived
//! from raw worker ids on each escalation.

/// Immutable map from worker index to its place in the escalation hierarchy
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Topology {
    /// Group of each worker, indexed by worker
    group_of: Box<[usize]>,

    /// Leader worker of each group, indexed by group
    ///
    /// The leader is the lowest worker index in the group, so the leader of
    /// group 0 is worker 0, which is the loop's global serialization point.
    leader_of_group: Box<[usize]>,
}
//
impl Topology {
    /// Partition `workers` threads into groups of (at most) `per_group`
    ///
    /// Groups model a coarser hardware locality unit that several workers
    /// share; in the absence of real placement information, consecutive
    /// worker indices are assumed close to each other.
    pub fn uniform(workers: usize, per_group: usize) -> Self {
        assert!(workers > 0, "a topology needs at least one worker");
        assert!(per_group > 0, "a topology group needs at least one worker");
        let num_groups = workers.div_ceil(per_group);
        let group_of = (0..workers).map(|w| w / per_group).collect();
        let leader_of_group = (0..num_groups).map(|g| g * per_group).collect();
        Self {
            group_of,
            leader_of_group,
        }
    }

    /// Number of workers covered by this table
    pub fn num_workers(&self) -> usize {
        self.group_of.len()
    }

    /// Number of topology groups
    pub fn num_groups(&self) -> usize {
        self.leader_of_group.len()
    }

    /// Group which worker `w` belongs to
    pub fn group_of(&self, w: usize) -> usize {
        self.group_of[w]
    }

    /// Leader of the group which worker `w` belongs to
    pub fn leader_of(&self, w: usize) -> usize {
        self.leader_of_group[self.group_of[w]]
    }

    /// Leader of group `g`
    pub fn leader_of_group(&self, g: usize) -> usize {
        self.leader_of_group[g]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn uniform_invariants(workers in 1usize..256, per_group in 1usize..32) {
            let topo = Topology::uniform(workers, per_group);
            prop_assert_eq!(topo.num_workers(), workers);
            prop_assert_eq!(topo.num_groups(), workers.div_ceil(per_group));
            // Worker 0 leads group 0: the global serialization point
            prop_assert_eq!(topo.leader_of_group(0), 0);
            for w in 0..workers {
                let g = topo.group_of(w);
                let leader = topo.leader_of(w);
                // A leader is a member of its own group and not above it
                prop_assert_eq!(topo.group_of(leader), g);
                prop_assert!(leader <= w);
                prop_assert_eq!(leader, topo.leader_of_group(g));
            }
            // Groups cover consecutive workers in order
            for w in 1..workers {
                let (prev, cur) = (topo.group_of(w - 1), topo.group_of(w));
                prop_assert!(cur == prev || cur == prev + 1);
            }
        }

        #[test]
        fn halving_group_chain_reaches_zero(workers in 1usize..256, per_group in 1usize..32) {
            // The inter-group escalation hop goes from group g to the leader
            // of group g / 2, so it must funnel every worker to worker 0 in
            // at most log2(groups) + 1 hops.
            let topo = Topology::uniform(workers, per_group);
            for start in 0..workers {
                let mut g = topo.group_of(start);
                let mut hops = 0;
                while topo.leader_of_group(g / 2) != 0 {
                    g /= 2;
                    hops += 1;
                    prop_assert!(hops <= topo.num_groups());
                }
            }
        }
    }
}
