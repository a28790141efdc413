//! Work list storing pending items
//!
//! Split the usual way: a shared part holding the global injector and one
//! stealer handle per worker, and a per-worker [`LocalQueue`] owning the
//! worker end of its deque. Workers push into and pop from their own queue
//! without synchronization on the happy path; when it runs dry they fall
//! back to batch-stealing from the injector and then from peers in a
//! randomized rotation, so that a contended victim does not get hammered by
//! every thief at once.
//!
//! Pop order is unspecified. The engine's correctness relies only on
//! conflict detection, plus the happens-before edge the deques provide from
//! a committed push to any subsequent pop of the same item.

use crossbeam::deque::{self, Injector, Steal, Stealer};
use rand::Rng;

/// Shared side of the work list
#[derive(Debug)]
pub struct WorkList<T> {
    /// Overflow/seed queue that any worker may push to or steal from
    injector: Injector<T>,

    /// A way to steal from each worker's queue, indexed by worker
    stealers: Box<[Stealer<T>]>,
}
//
impl<T: Send> WorkList<T> {
    /// Set up the shared state and the worker ends for `workers` threads
    pub fn for_workers(workers: usize) -> (Self, Vec<deque::Worker<T>>) {
        assert!(workers > 0, "a work list needs at least one worker queue");
        let queues: Vec<_> = (0..workers).map(|_| deque::Worker::new_lifo()).collect();
        let shared = Self {
            injector: Injector::new(),
            stealers: queues.iter().map(deque::Worker::stealer).collect(),
        };
        (shared, queues)
    }

    /// Seed the work list with the loop's initial items
    ///
    /// Called once before workers start; items land in the injector and
    /// spread across workers through their first steals.
    pub fn push_initial(&self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.injector.push(item);
        }
    }

    /// Best-effort emptiness check
    ///
    /// May race with concurrent pushes and pops; only trustworthy at points
    /// where no worker is mutating any queue, like the engine's post-barrier
    /// termination re-check.
    pub fn is_empty(&self) -> bool {
        self.injector.is_empty() && self.stealers.iter().all(Stealer::is_empty)
    }
}

/// One worker's handle on the work list
#[derive(Debug)]
pub struct LocalQueue<'shared, T> {
    /// Shared side, for stealing and emptiness checks
    shared: &'shared WorkList<T>,

    /// This worker's own queue
    queue: deque::Worker<T>,

    /// Index of this worker in the shared stealer table
    idx: usize,
}
//
impl<'shared, T: Send> LocalQueue<'shared, T> {
    /// Attach worker `idx`'s queue to the shared state
    pub fn new(shared: &'shared WorkList<T>, queue: deque::Worker<T>, idx: usize) -> Self {
        debug_assert!(idx < shared.stealers.len());
        Self { shared, queue, idx }
    }

    /// Queue a batch of items on this worker, returning how many there were
    pub fn push_all(&mut self, items: impl IntoIterator<Item = T>) -> usize {
        let mut count = 0;
        for item in items {
            self.queue.push(item);
            count += 1;
        }
        count
    }

    /// Take one item, stealing from the injector or peers if needed
    pub fn pop(&mut self) -> Option<T> {
        if let Some(item) = self.queue.pop() {
            return Some(item);
        }
        self.steal()
    }

    /// Best-effort global emptiness, see [`WorkList::is_empty`]
    pub fn all_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Look for work in the injector, then across peers
    ///
    /// Batch steals refill the local queue so that a worker that found a
    /// productive victim does not need to come back for every single item.
    #[cold]
    fn steal(&mut self) -> Option<T> {
        if let Some(item) = Self::steal_with(|| self.shared.injector.steal_batch_and_pop(&self.queue))
        {
            return Some(item);
        }

        // Rotate over peers from a random starting point
        let stealers = &self.shared.stealers;
        let start = rand::thread_rng().gen_range(0..stealers.len());
        for offset in 0..stealers.len() {
            let victim = (start + offset) % stealers.len();
            if victim == self.idx {
                continue;
            }
            if let Some(item) =
                Self::steal_with(|| stealers[victim].steal_batch_and_pop(&self.queue))
            {
                return Some(item);
            }
        }
        None
    }

    /// Run one stealing attempt to completion
    fn steal_with(mut attempt: impl FnMut() -> Steal<T>) -> Option<T> {
        loop {
            match attempt() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_push_pop() {
        let (shared, mut queues) = WorkList::for_workers(1);
        let mut local = LocalQueue::new(&shared, queues.remove(0), 0);
        assert!(local.all_empty());
        assert_eq!(local.push_all([1, 2]), 2);
        assert!(!local.all_empty());
        // LIFO on the owner side
        assert_eq!(local.pop(), Some(2));
        assert_eq!(local.pop(), Some(1));
        assert_eq!(local.pop(), None);
        assert!(local.all_empty());
    }

    #[test]
    fn batch_push() {
        let (shared, mut queues) = WorkList::for_workers(1);
        let mut local = LocalQueue::new(&shared, queues.remove(0), 0);
        assert_eq!(local.push_all([1, 2, 3]), 3);
        // An empty batch leaves no trace
        assert_eq!(local.push_all(std::iter::empty()), 0);
        let mut drained = 0;
        while local.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 3);
    }

    #[test]
    fn initial_items_reach_workers() {
        let (shared, mut queues) = WorkList::for_workers(2);
        shared.push_initial([1, 2, 3]);
        assert!(!shared.is_empty());
        let mut local = LocalQueue::new(&shared, queues.remove(1), 1);
        let mut seen = Vec::new();
        while let Some(item) = local.pop() {
            seen.push(item);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn steal_from_peer() {
        let (shared, queues) = WorkList::for_workers(2);
        let mut queues = queues.into_iter();
        let mut victim = LocalQueue::new(&shared, queues.next().unwrap(), 0);
        let mut thief = LocalQueue::new(&shared, queues.next().unwrap(), 1);
        victim.push_all(0..10);
        assert!(thief.pop().is_some());
        // Batch stealing moved more than one item over
        assert!(thief.queue.pop().is_some());
    }
}
