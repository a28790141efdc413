//! Reusable generation-gated worker barrier
//!
//! All coordination state lives in one `AtomicU32` futex word so that late
//! arrivals can block through [`atomic_wait`] after a short spin phase, the
//! same mechanism workers use elsewhere for cheap blocking. Release is gated
//! on the generation counter, not the arrival count: a fast thread that
//! re-enters `wait()` for the next generation observes a different word value
//! and cannot be confused with a straggler of the previous cycle.
//!
//! Barrier instances are relatively expensive and an engine invocation at a
//! given parallelism level always needs the same participant count, so
//! instances are cached process-wide, keyed by participant count, and leased
//! to one invocation at a time.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, OnceLock,
    },
};

/// Spin-loop iterations before a waiter falls back to blocking in the OS
///
/// Peers usually arrive within the time of a few iterations; going through
/// the futex costs two syscalls, so only do it when the wait drags on.
const SPIN_ITERS_BEFORE_BLOCK: usize = 1 << 8;

/// Epoch-word bit marking the barrier as poisoned
const POISON_BIT: u32 = 1 << 31;

/// Epoch-word bits holding the generation counter
const GENERATION_MASK: u32 = POISON_BIT - 1;

/// Rendezvous point for a fixed set of worker threads
///
/// Reusable indefinitely: every completed generation immediately opens the
/// next one. Generations wrap around after 2^31 cycles, which no invocation
/// gets anywhere near.
#[derive(Debug)]
pub(crate) struct Barrier {
    /// Futex word: poison flag plus current generation
    epoch: AtomicU32,

    /// Arrivals within the current generation
    arrived: AtomicU32,

    /// Number of threads that must arrive to complete a generation
    participants: u32,

    /// Truth that an invocation currently holds this instance
    leased: AtomicBool,
}
//
impl Barrier {
    /// Set up a barrier for `participants` threads
    fn new(participants: usize) -> Self {
        assert!(participants > 0, "a barrier without participants cannot release anyone");
        let participants =
            u32::try_from(participants).expect("unsupported number of barrier participants");
        Self {
            epoch: AtomicU32::new(0),
            arrived: AtomicU32::new(0),
            participants,
            leased: AtomicBool::new(false),
        }
    }

    /// Block until all participants have arrived for the current generation
    ///
    /// Returns `true` on a normally completed cycle and `false` if the
    /// barrier was poisoned, in which case the caller must unwind instead of
    /// relying on peers ever arriving.
    pub fn wait(&self) -> bool {
        // Acquire pairs with the Release generation bump of the last arrival,
        // so everything peers did before their wait() is visible after ours.
        let initial = self.epoch.load(Ordering::Acquire);
        if initial & POISON_BIT != 0 {
            return false;
        }

        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(arrived <= self.participants, "barrier participant set mismatch");
        if arrived == self.participants {
            // Last arrival: reset the count for the next generation, then
            // release everyone by advancing the generation. The count store
            // is published by the Release bump, so re-entering threads start
            // the next generation from zero.
            self.arrived.store(0, Ordering::Relaxed);
            let updated = self.epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            atomic_wait::wake_all(&self.epoch);
            return updated & POISON_BIT == 0;
        }

        // Wait for the generation to advance (or for poison), spinning
        // briefly before each OS-level block
        let mut spins = 0;
        loop {
            let current = self.epoch.load(Ordering::Acquire);
            if current != initial {
                return current & POISON_BIT == 0;
            }
            if spins < SPIN_ITERS_BEFORE_BLOCK {
                spins += 1;
                std::hint::spin_loop();
            } else {
                // Re-checked against `initial` by the futex itself: if the
                // word changed since the load above, this returns immediately
                atomic_wait::wait(&self.epoch, initial);
            }
        }
    }

    /// Poison the barrier, unblocking current and future waiters
    ///
    /// Used when a worker unwinds (break request or operator failure) and
    /// will therefore never arrive at the barrier again. Idempotent; cleared
    /// when the instance is leased to a fresh invocation.
    pub fn poison(&self) {
        self.epoch.fetch_or(POISON_BIT, Ordering::Release);
        atomic_wait::wake_all(&self.epoch);
    }

    /// Truth that this barrier has been poisoned
    #[cfg(test)]
    fn is_poisoned(&self) -> bool {
        self.epoch.load(Ordering::Relaxed) & POISON_BIT != 0
    }
}

/// Exclusive lease of a cached [`Barrier`] instance
///
/// Holding a lease guarantees no other invocation shares the instance, which
/// would otherwise mix two disjoint participant sets in one count. Dropping
/// the lease returns the instance to the cache.
#[derive(Debug)]
pub(crate) struct BarrierLease {
    barrier: Arc<Barrier>,
}
//
impl BarrierLease {
    /// Lease the process-wide barrier for `participants` threads
    ///
    /// Lazily creates the instance on first use at this parallelism level.
    /// Leasing an instance that is already in use is a programming error
    /// (two overlapping invocations at the same parallelism level would need
    /// distinct barriers) and asserts.
    pub fn acquire(participants: usize) -> Self {
        static REGISTRY: OnceLock<Mutex<HashMap<usize, Arc<Barrier>>>> = OnceLock::new();
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let barrier = registry
            .lock()
            .expect("poisoned barrier registry")
            .entry(participants)
            .or_insert_with(|| Arc::new(Barrier::new(participants)))
            .clone();
        assert!(
            !barrier.leased.swap(true, Ordering::Acquire),
            "barrier for {participants} threads is already leased by another invocation"
        );
        // A previous invocation may have left the instance poisoned or with
        // stale arrivals after an unwind; start from a clean cycle. No
        // concurrent access is possible before worker threads are spawned.
        barrier.epoch.fetch_and(GENERATION_MASK, Ordering::Relaxed);
        barrier.arrived.store(0, Ordering::Relaxed);
        Self { barrier }
    }

    /// See [`Barrier::wait`]
    pub fn wait(&self) -> bool {
        self.barrier.wait()
    }

    /// See [`Barrier::poison`]
    pub fn poison(&self) {
        self.barrier.poison()
    }
}
//
impl Drop for BarrierLease {
    fn drop(&mut self) {
        self.barrier.leased.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_cycles() {
        let barrier = Arc::new(Barrier::new(2));
        let peer = {
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    assert!(barrier.wait());
                }
            })
        };
        for _ in 0..100 {
            assert!(barrier.wait());
        }
        peer.join().unwrap();
    }

    #[test]
    fn generation_advances_per_cycle() {
        let barrier = Barrier::new(1);
        assert!(barrier.wait());
        assert!(barrier.wait());
        assert_eq!(barrier.epoch.load(Ordering::Relaxed), 2);
        assert_eq!(barrier.arrived.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn poison_unblocks_waiters() {
        let barrier = Arc::new(Barrier::new(2));
        let waiter = {
            let barrier = barrier.clone();
            std::thread::spawn(move || barrier.wait())
        };
        // Give the waiter a chance to actually block
        std::thread::sleep(std::time::Duration::from_millis(10));
        barrier.poison();
        assert!(!waiter.join().unwrap());
        // Later waits fail fast
        assert!(!barrier.wait());
        assert!(barrier.is_poisoned());
    }

    #[test]
    fn lease_resets_poison_and_is_exclusive() {
        // Participant count nobody else uses, to keep the registry entry to
        // ourselves
        let lease = BarrierLease::acquire(63);
        lease.poison();
        assert!(!lease.wait());
        drop(lease);
        let lease = BarrierLease::acquire(63);
        assert!(!lease.barrier.is_poisoned());
        drop(lease);
    }

    #[test]
    #[should_panic(expected = "already leased")]
    fn double_lease_asserts() {
        let _first = BarrierLease::acquire(62);
        let _second = BarrierLease::acquire(62);
    }

    #[test]
    fn cache_reuses_instances() {
        let first = BarrierLease::acquire(61);
        let ptr = Arc::as_ptr(&first.barrier);
        drop(first);
        let second = BarrierLease::acquire(61);
        assert_eq!(Arc::as_ptr(&second.barrier), ptr);
    }
}
