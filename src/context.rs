//! Per-iteration conflict detection context
//!
//! Every iteration runs inside a [`UserContext`]: the operator acquires the
//! [`Resource`] handles it intends to touch, buffers newly discovered items
//! with [`UserContext::push`], and the executor makes everything visible at
//! once on commit or discards it all on abort. The one correctness property
//! this module must uphold is exclusivity: no two live iterations ever hold
//! the same resource handle at the same time, which is what prevents an
//! iteration from observing another's uncommitted effects.

use std::{
    cell::{Cell, RefCell},
    error::Error,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    vec::Drain,
};
use typed_arena::Arena;

/// Owner tag of a resource that nobody holds
const FREE: usize = 0;

/// Signal that an attempted resource acquisition lost to another live
/// iteration
///
/// Operators are expected to propagate this out of the application function
/// with `?`; the executor then rolls the iteration back and re-queues the
/// item. A `Conflict` never escapes a loop invocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Conflict;
//
impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource already owned by another live iteration")
    }
}
//
impl Error for Conflict {}

/// Abstract ownership token arbitrated by the engine
///
/// Applications allocate one `Resource` per entity that iterations must not
/// touch concurrently (a graph node, a bucket, ...) and acquire it through
/// [`UserContext::acquire`] before reading or writing the protected data.
/// The engine never interprets the handle beyond its ownership word.
#[derive(Debug, Default)]
pub struct Resource {
    /// Tag of the live iteration owning this handle, or [`FREE`]
    ///
    /// Successful acquisition uses an Acquire CAS and release uses a Release
    /// store, so data writes made under ownership are visible to the next
    /// owner.
    owner: AtomicUsize,
}
//
impl Resource {
    /// Create an unowned resource handle
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(FREE),
        }
    }

    /// Attempt to acquire this handle on behalf of iteration `tag`
    fn try_acquire(&self, tag: usize) -> Acquired {
        debug_assert_ne!(tag, FREE);
        // Common paths first: the handle is free or we already own it. A
        // relaxed pre-load keeps the contended failure path read-only.
        let current = self.owner.load(Ordering::Relaxed);
        if current == tag {
            return Acquired::AlreadyOwned;
        }
        if current != FREE {
            return Acquired::Busy;
        }
        match self
            .owner
            .compare_exchange(FREE, tag, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Acquired::Fresh,
            Err(owner) if owner == tag => Acquired::AlreadyOwned,
            Err(_) => Acquired::Busy,
        }
    }

    /// Release this handle at the end of the owning iteration
    fn release(&self, tag: usize) {
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), tag);
        self.owner.store(FREE, Ordering::Release);
    }
}

/// Outcome of [`Resource::try_acquire`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Acquired {
    /// The handle was free and now belongs to the requesting iteration
    Fresh,

    /// The requesting iteration already owned the handle
    AlreadyOwned,

    /// Another live iteration owns the handle
    Busy,
}

/// Execution context handed to the application function
///
/// One `UserContext` lives on each worker and is recycled across that
/// worker's iterations; at most one iteration per worker is current at a
/// time. All operator-facing methods take `&self` so the operator may hold
/// scratch allocations across calls.
pub struct UserContext<'env, T> {
    /// Tag identifying this worker's live iteration (worker index + 1, so
    /// that [`FREE`] is never a valid tag)
    tag: usize,

    /// Whether acquisitions actually arbitrate ownership
    ///
    /// Single-worker invocations and loops configured without conflict
    /// detection skip the CAS entirely; with one live iteration in the whole
    /// system, exclusivity holds trivially.
    detection: bool,

    /// Handles owned by the current iteration, released on commit/cancel
    held: RefCell<Vec<&'env Resource>>,

    /// Items discovered by the current iteration, published on commit only
    pushed: RefCell<Vec<T>>,

    /// Scratch storage reclaimed wholesale when the iteration ends
    scratch: Arena<T>,

    /// Best-effort early-shutdown request
    stop: Cell<bool>,
}
//
impl<'env, T> UserContext<'env, T> {
    /// Set up the context of one worker's iterations
    pub(crate) fn new(worker_idx: usize, detection: bool) -> Self {
        Self {
            tag: worker_idx + 1,
            detection,
            held: RefCell::new(Vec::new()),
            pushed: RefCell::new(Vec::new()),
            scratch: Arena::new(),
            stop: Cell::new(false),
        }
    }

    /// Register intent to use `resource` for the rest of this iteration
    ///
    /// Fails if the handle is owned by a different live iteration, in which
    /// case the operator must unwind by propagating the [`Conflict`] as its
    /// own result. Acquiring a handle twice in one iteration is fine.
    pub fn acquire(&self, resource: &'env Resource) -> Result<(), Conflict> {
        if !self.detection {
            return Ok(());
        }
        match resource.try_acquire(self.tag) {
            Acquired::Fresh => {
                self.held.borrow_mut().push(resource);
                Ok(())
            }
            Acquired::AlreadyOwned => Ok(()),
            Acquired::Busy => Err(Conflict),
        }
    }

    /// Buffer a newly discovered work item
    ///
    /// The item joins the work list when this iteration commits, and is
    /// discarded if it aborts.
    pub fn push(&self, item: T) {
        self.pushed.borrow_mut().push(item);
    }

    /// Scratch arena for intermediate values of the item type
    ///
    /// Allocations live until the end of the current iteration and are
    /// reclaimed in one go afterwards, whether it commits or aborts.
    pub fn scratch(&self) -> &Arena<T> {
        &self.scratch
    }

    /// Request best-effort early shutdown of the whole loop
    ///
    /// The current iteration still commits normally; workers stop picking up
    /// new work once they observe the request. Nothing already committed is
    /// rolled back.
    pub fn stop(&self) {
        self.stop.set(true);
    }

    /// Make the current iteration's effects permanent
    ///
    /// Releases every owned handle; calling it again before the next
    /// iteration starts is a no-op. The push buffer is drained separately by
    /// the executor (see [`Self::drain_pushes`]) so items reach the work
    /// list before the handles guarding them are released.
    pub(crate) fn commit(&mut self) {
        self.release_held();
        self.reclaim_scratch();
    }

    /// Roll the current iteration back
    ///
    /// Releases every owned handle and discards buffered pushes and scratch
    /// allocations, leaving no visible trace of the attempt.
    pub(crate) fn cancel(&mut self) {
        self.release_held();
        self.pushed.get_mut().clear();
        self.reclaim_scratch();
    }

    /// Drain the items buffered by the committing iteration
    pub(crate) fn drain_pushes(&mut self) -> Drain<'_, T> {
        self.pushed.get_mut().drain(..)
    }

    /// Check and clear the early-shutdown request
    pub(crate) fn take_stop(&mut self) -> bool {
        self.stop.replace(false)
    }

    /// Release all handles owned by the current iteration
    fn release_held(&mut self) {
        for resource in self.held.get_mut().drain(..) {
            resource.release(self.tag);
        }
    }

    /// Throw away this iteration's scratch allocations
    fn reclaim_scratch(&mut self) {
        // The arena has no reset operation; replacing it drops every
        // allocation while the buffer vector's capacity stays modest because
        // scratch use is per-iteration.
        self.scratch = Arena::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_free_resource() {
        let resource = Resource::new();
        let mut ctx = UserContext::<u32>::new(0, true);
        assert_eq!(ctx.acquire(&resource), Ok(()));
        // Re-acquiring a handle we own must not fail nor double-register
        assert_eq!(ctx.acquire(&resource), Ok(()));
        assert_eq!(ctx.held.get_mut().len(), 1);
        assert_eq!(resource.owner.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn conflicting_acquire_fails_and_leaves_owner() {
        let resource = Resource::new();
        let mut owner = UserContext::<u32>::new(0, true);
        let other = UserContext::<u32>::new(1, true);
        owner.acquire(&resource).unwrap();
        assert_eq!(other.acquire(&resource), Err(Conflict));
        assert_eq!(resource.owner.load(Ordering::Relaxed), 1);
        owner.commit();
        assert_eq!(resource.owner.load(Ordering::Relaxed), FREE);
        // Once released, the loser can take it
        assert_eq!(other.acquire(&resource), Ok(()));
    }

    #[test]
    fn commit_is_idempotent() {
        let resource = Resource::new();
        let mut ctx = UserContext::<u32>::new(2, true);
        ctx.acquire(&resource).unwrap();
        ctx.commit();
        ctx.commit();
        assert_eq!(resource.owner.load(Ordering::Relaxed), FREE);
    }

    #[test]
    fn cancel_discards_pushes_and_releases() {
        let resource = Resource::new();
        let mut ctx = UserContext::<u32>::new(0, true);
        ctx.acquire(&resource).unwrap();
        ctx.push(42);
        ctx.cancel();
        assert_eq!(resource.owner.load(Ordering::Relaxed), FREE);
        assert_eq!(ctx.drain_pushes().count(), 0);
    }

    #[test]
    fn commit_publishes_pushes() {
        let mut ctx = UserContext::<u32>::new(0, true);
        ctx.push(1);
        ctx.push(2);
        let drained: Vec<u32> = ctx.drain_pushes().collect();
        ctx.commit();
        assert_eq!(drained, vec![1, 2]);
    }

    #[test]
    fn detection_disabled_never_conflicts() {
        let resource = Resource::new();
        let a = UserContext::<u32>::new(0, false);
        let b = UserContext::<u32>::new(1, false);
        assert_eq!(a.acquire(&resource), Ok(()));
        assert_eq!(b.acquire(&resource), Ok(()));
        // Ownership is not even recorded
        assert_eq!(resource.owner.load(Ordering::Relaxed), FREE);
    }

    #[test]
    fn stop_request_is_latched_until_taken() {
        let mut ctx = UserContext::<u32>::new(0, true);
        assert!(!ctx.take_stop());
        ctx.stop();
        assert!(ctx.take_stop());
        assert!(!ctx.take_stop());
    }

    #[test]
    fn scratch_reclaimed_per_iteration() {
        let mut ctx = UserContext::<u32>::new(0, true);
        let value = ctx.scratch().alloc(7);
        assert_eq!(*value, 7);
        ctx.commit();
        assert_eq!(ctx.scratch().len(), 0);
    }
}
