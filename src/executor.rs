//! Speculative execution loop
//!
//! Each worker drives an unbounded sequence of iterations through a small
//! state machine:
//!
//! - **Running**: pop up to a bounded batch of fresh items and execute each
//!   speculatively, committing or aborting.
//! - **HandlingAborts**: drain the worker's own retry queue without bound, so
//!   retried items cannot starve behind a perpetual stream of fresh items.
//! - **CheckingTermination**: report whether this pass completed any
//!   iteration; loop back to Running until quiescence is declared.
//! - **Barriered**: rendezvous with all workers, then re-check for residual
//!   work: a commit may have raced quiescence detection, and the barrier
//!   guarantees every such push is visible to every worker's emptiness check.
//! - **Done**: exit the loop.
//!
//! Optional behaviors (conflict detection, batch bound, escalation flavor)
//! are selected by a plain [`Config`] value and ordinary conditionals; an
//! invocation running on a single worker skips conflict arbitration
//! entirely since exclusivity is trivial with one live iteration.

use crate::{
    abort::AbortHandler,
    barrier::BarrierLease,
    context::{Conflict, UserContext},
    stats::{LoopStats, Tally, Totals},
    termination::Termination,
    topology::Topology,
    worklist::{LocalQueue, WorkList},
    YIELD_DURATION,
};
pub use crate::abort::Escalation;
use std::{
    any::Any,
    marker::PhantomData,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

/// Default bound on fresh items processed per Running pass
///
/// Bounds the time until a worker next checks for termination, retries and
/// shutdown requests; large enough that the per-pass bookkeeping is noise.
const DEFAULT_FRESH_BATCH: usize = 64;

/// Default number of workers sharing one topology group
const DEFAULT_WORKERS_PER_GROUP: usize = 8;

/// Tuning knobs of one loop invocation
#[derive(Clone, Debug)]
pub struct Config {
    /// Invocation name used in statistics reports
    pub name: String,

    /// Number of worker threads, or 0 to use all available parallelism
    pub threads: usize,

    /// Fresh items per Running pass, or 0 for no bound
    pub fresh_batch: usize,

    /// Whether iterations arbitrate [`crate::Resource`] ownership
    ///
    /// Disable for loops whose operator never signals conflicts; the
    /// simplified loop skips the retry machinery entirely.
    pub conflict_detection: bool,

    /// How repeatedly conflicting items escalate toward serialization
    pub escalation: Escalation,

    /// Workers per topology group, or 0 for the default
    ///
    /// Ideally the number of workers sharing a physical package; any value
    /// preserves correctness, only escalation traffic patterns change.
    pub workers_per_group: usize,
}
//
impl Config {
    /// Default configuration with a statistics name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}
//
impl Default for Config {
    fn default() -> Self {
        Self {
            name: "(unnamed loop)".to_owned(),
            threads: 0,
            fresh_batch: DEFAULT_FRESH_BATCH,
            conflict_detection: true,
            escalation: Escalation::Auto,
            workers_per_group: 0,
        }
    }
}

/// Speculatively execute `operator` over `initial` items and everything they
/// transitively push, until no work remains anywhere
///
/// The operator receives each item together with the iteration's
/// [`UserContext`] and must propagate any [`Conflict`] reported by
/// [`UserContext::acquire`] as its own result; the engine rolls the
/// iteration back and retries it elsewhere. An operator panic aborts the
/// in-flight iteration on every worker, tears the invocation down and
/// resumes unwinding on the caller.
///
/// Commit order across workers is unspecified. Items pushed by a committed
/// iteration are visible to any worker's subsequent pop.
///
/// ```
/// use speculoop::{for_each, Config};
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let sum = AtomicU64::new(0);
/// let stats = for_each(Config::named("sum"), 1..=100u64, |&item, _ctx| {
///     sum.fetch_add(item, Ordering::Relaxed);
///     Ok(())
/// });
/// assert_eq!(sum.load(Ordering::Relaxed), 5050);
/// assert_eq!(stats.commits, 100);
/// ```
pub fn for_each<'env, T, I, F>(config: Config, initial: I, operator: F) -> LoopStats
where
    T: Send,
    I: IntoIterator<Item = T>,
    F: Fn(&T, &UserContext<'env, T>) -> Result<(), Conflict> + Sync,
{
    let threads = match config.threads {
        0 => std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1),
        n => n,
    };
    let per_group = match config.workers_per_group {
        0 => DEFAULT_WORKERS_PER_GROUP,
        n => n,
    };
    let topology = Topology::uniform(threads, per_group);
    let executor = Executor {
        operator,
        aborts: AbortHandler::new(&topology, config.escalation),
        term: Termination::new(threads),
        barrier: BarrierLease::acquire(threads),
        topology,
        broke: AtomicBool::new(false),
        failed: AtomicBool::new(false),
        failure: Mutex::new(None),
        totals: Totals::default(),
        aborts_enabled: config.conflict_detection && threads > 1,
        fresh_batch: config.fresh_batch,
        _env: PhantomData,
    };

    let (worklist, queues) = WorkList::for_workers(threads);
    worklist.push_initial(initial);

    if threads == 1 {
        // No point spawning: run the loop on the caller's thread
        let queue = queues.into_iter().next().expect("one worker queue");
        executor.worker(0, LocalQueue::new(&worklist, queue, 0));
    } else {
        let executor = &executor;
        let worklist = &worklist;
        std::thread::scope(|scope| {
            for (idx, queue) in queues.into_iter().enumerate() {
                scope.spawn(move || executor.worker(idx, LocalQueue::new(worklist, queue, idx)));
            }
        });
    }

    let payload = executor.failure.lock().expect("poisoned failure slot").take();
    if let Some(payload) = payload {
        log::warn!("loop {:?} terminated by operator failure", config.name);
        panic::resume_unwind(payload);
    }
    executor.totals.report(&config.name);
    executor.totals.snapshot()
}

/// How one iteration ended
enum Flow {
    /// Effects published, item consumed
    Committed,

    /// Rolled back; the caller re-queues the item
    Conflicted,

    /// The operator panicked; the payload has been recorded
    Failed,
}

/// Why a worker left its loop
enum Exit {
    /// Global quiescence: every queue empty after a barrier-synchronized
    /// re-check
    Done,

    /// Early shutdown: break request, operator failure, or a peer unwinding
    Interrupted,
}

/// State shared by all workers of one invocation
struct Executor<'env, T, F> {
    /// Application function
    operator: F,

    /// Retry queues and escalation policy
    aborts: AbortHandler<T>,

    /// Escalation routing table
    topology: Topology,

    /// Quiescence detector
    term: Termination,

    /// Loop-back rendezvous
    barrier: BarrierLease,

    /// Best-effort early-shutdown request, observed at pass boundaries
    broke: AtomicBool,

    /// Truth that some worker's operator panicked
    failed: AtomicBool,

    /// First recorded panic payload, re-raised by the invoking call
    failure: Mutex<Option<Box<dyn Any + Send>>>,

    /// Statistics accumulator
    totals: Totals,

    /// Bound on fresh items per Running pass (0 = unbounded)
    fresh_batch: usize,

    /// Whether iterations may conflict and retry
    aborts_enabled: bool,

    /// Ties the executor to the lifetime of application resources
    _env: PhantomData<&'env ()>,
}
//
impl<'env, T, F> Executor<'env, T, F>
where
    T: Send,
    F: Fn(&T, &UserContext<'env, T>) -> Result<(), Conflict> + Sync,
{
    /// Run one worker to completion
    fn worker(&self, idx: usize, mut local: LocalQueue<'_, T>) {
        let mut ctx = UserContext::new(idx, self.aborts_enabled);
        let mut tally = Tally::default();
        if matches!(
            self.drive(idx, &mut local, &mut ctx, &mut tally),
            Exit::Interrupted
        ) {
            // Peers may be blocked at the barrier waiting for us; we will
            // never arrive, so unblock them into their own unwind path
            self.barrier.poison();
        }
        self.totals.merge(&tally);
    }

    /// The per-worker state machine
    fn drive(
        &self,
        idx: usize,
        local: &mut LocalQueue<'_, T>,
        ctx: &mut UserContext<'env, T>,
        tally: &mut Tally,
    ) -> Exit {
        let mut last_iterations = 0;
        let mut epoch_base = self.term.epoch();
        loop {
            // Running, HandlingAborts, CheckingTermination
            loop {
                if !self.run_fresh(idx, local, ctx, tally) {
                    return Exit::Interrupted;
                }
                if self.aborts_enabled && !self.drain_retries(idx, local, ctx, tally) {
                    return Exit::Interrupted;
                }
                let did_work = tally.iterations != last_iterations;
                last_iterations = tally.iterations;
                self.term.report(idx, did_work);
                // Give the token a moment to propagate
                std::hint::spin_loop();
                if self.interrupted() {
                    return Exit::Interrupted;
                }
                if self.term.epoch() > epoch_base {
                    break;
                }
                if !did_work {
                    // Idle pass: yield to whoever holds the work
                    std::thread::sleep(YIELD_DURATION);
                }
            }

            // Barriered: every flush that happened before the wait is
            // visible to every emptiness check after it. Between the wait
            // and the per-worker checks nobody pushes or pops, so all
            // workers reach the same verdict.
            if !self.barrier.wait() {
                return Exit::Interrupted;
            }
            if local.all_empty() && self.aborts.all_empty() {
                return Exit::Done;
            }
            // A commit raced quiescence detection: restart it. Re-arming is
            // only safe while nobody reports, hence the second rendezvous.
            self.term.arm(idx);
            epoch_base = self.term.epoch();
            if !self.barrier.wait() {
                return Exit::Interrupted;
            }
        }
    }

    /// Running: process up to one batch of fresh items
    ///
    /// Returns false if the loop must unwind.
    fn run_fresh(
        &self,
        idx: usize,
        local: &mut LocalQueue<'_, T>,
        ctx: &mut UserContext<'env, T>,
        tally: &mut Tally,
    ) -> bool {
        let mut remaining = self.fresh_batch;
        while self.fresh_batch == 0 || remaining > 0 {
            remaining = remaining.saturating_sub(1);
            let Some(item) = local.pop() else { break };
            match self.execute(&item, local, ctx, tally) {
                Flow::Committed => {}
                // A first conflict is no evidence of real contention: retry
                // locally before any escalation
                Flow::Conflicted => self.aborts.record_first(idx, item),
                Flow::Failed => return false,
            }
            if self.interrupted() {
                return false;
            }
        }
        true
    }

    /// HandlingAborts: drain this worker's retry queue completely
    fn drain_retries(
        &self,
        idx: usize,
        local: &mut LocalQueue<'_, T>,
        ctx: &mut UserContext<'env, T>,
        tally: &mut Tally,
    ) -> bool {
        while let Some(record) = self.aborts.pop_local(idx) {
            match self.execute(&record.item, local, ctx, tally) {
                Flow::Committed => {}
                Flow::Conflicted => self.aborts.escalate(&self.topology, idx, record.bump()),
                Flow::Failed => return false,
            }
            if self.interrupted() {
                return false;
            }
        }
        true
    }

    /// Run one iteration over `item` and commit or roll back
    fn execute(
        &self,
        item: &T,
        local: &mut LocalQueue<'_, T>,
        ctx: &mut UserContext<'env, T>,
        tally: &mut Tally,
    ) -> Flow {
        tally.iterations += 1;
        // The contract check runs inside the catch so that a violation tears
        // the invocation down like any other operator panic instead of
        // stranding peers at the barrier
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let result = (self.operator)(item, ctx);
            assert!(
                result.is_ok() || self.aborts_enabled,
                "operator signalled a conflict but conflict detection is disabled"
            );
            result
        }));
        match outcome {
            Ok(Ok(())) => {
                // Publish discovered items, then release resources. A peer
                // may pop a fresh item while we still hold its resources and
                // bounce off with a conflict; that is cheaper than holding
                // the push buffer across the releases.
                tally.pushes += local.push_all(ctx.drain_pushes()) as u64;
                ctx.commit();
                if ctx.take_stop() {
                    self.broke.store(true, Ordering::Release);
                }
                Flow::Committed
            }
            Ok(Err(Conflict)) => {
                ctx.cancel();
                // A rolled-back iteration's shutdown request dies with it
                let _ = ctx.take_stop();
                tally.conflicts += 1;
                Flow::Conflicted
            }
            Err(payload) => {
                // Best-effort cleanup: no effect of the failed iteration
                // stays visible, then the whole invocation unwinds
                ctx.cancel();
                self.record_failure(payload);
                Flow::Failed
            }
        }
    }

    /// Truth that this worker should unwind at the next pass boundary
    fn interrupted(&self) -> bool {
        self.failed.load(Ordering::Acquire) || self.broke.load(Ordering::Acquire)
    }

    /// Record the first operator panic and signal everyone to unwind
    #[cold]
    fn record_failure(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.failure.lock().expect("poisoned failure slot");
        if slot.is_none() {
            *slot = Some(payload);
        }
        drop(slot);
        self.failed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::named("test");
        assert_eq!(config.name, "test");
        assert_eq!(config.threads, 0);
        assert_eq!(config.fresh_batch, DEFAULT_FRESH_BATCH);
        assert!(config.conflict_detection);
        assert_eq!(config.escalation, Escalation::Auto);
    }
}
