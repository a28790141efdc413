//! Distributed termination detection
//!
//! Token-passing quiescence detector: worker 0 (the master) emits a white
//! token around the ring of workers, and any worker that performed work since
//! its previous report blackens either its own process flag or the token it
//! forwards. The master declares global quiescence after receiving a white
//! token twice in a row, which guarantees one full round in which no worker
//! reported activity. There is no shared counter on the hot path, only one
//! flag store per pass plus a token hand-off when the worker happens to hold
//! it.
//!
//! Quiescence is published as a monotonically increasing epoch, not a flag
//! that needs resetting: workers compare against the epoch they sampled when
//! the current round was armed, so a straggler that observes the declaration
//! late cannot be trapped by an early re-arm for the next round. Re-arming
//! itself (after residual work is discovered) is only safe between two
//! barrier waits, when no worker is reporting; the executor upholds that.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Index of the worker that owns the declaration decision
const MASTER: usize = 0;

/// Per-worker slot of the token ring
#[derive(Debug, Default)]
struct TokenHolder {
    /// Truth that the ring token currently sits at this worker
    ///
    /// Stored with Release by the forwarding worker and loaded with Acquire
    /// by the receiving one, so the token color below travels with it.
    has_token: AtomicBool,

    /// Color the token arrived with (black = some worker was active)
    token_is_black: AtomicBool,

    /// Truth that this worker did work since it last forwarded the token
    ///
    /// Written and read only by the owning worker.
    process_is_black: AtomicBool,

    /// Master only: whether the previously received token was white
    last_was_white: AtomicBool,
}

/// Quiescence detector shared by all workers of one invocation
#[derive(Debug)]
pub(crate) struct Termination {
    /// Ring slot of each worker
    holders: Box<[CachePadded<TokenHolder>]>,

    /// Number of quiescence declarations so far
    epoch: AtomicUsize,
}
//
impl Termination {
    /// Set up detection across `workers` ring slots
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "termination detection needs at least one worker");
        let holders: Box<[_]> = (0..workers)
            .map(|_| CachePadded::new(TokenHolder::default()))
            .collect();
        holders[MASTER].has_token.store(true, Ordering::Relaxed);
        // The initial token is black: declaration then requires two full
        // white circulations, closing the window where work performed right
        // behind the token would otherwise go unnoticed.
        holders[MASTER].token_is_black.store(true, Ordering::Relaxed);
        Self {
            holders,
            epoch: AtomicUsize::new(0),
        }
    }

    /// Current quiescence epoch
    ///
    /// A worker that sampled epoch `e` when its round was armed knows the
    /// system went globally quiescent once this exceeds `e`.
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Report one pass of worker `idx`, forwarding the token if held
    ///
    /// `did_work` is whether the worker completed any iteration since its
    /// previous report. Called once per executor pass.
    pub fn report(&self, idx: usize, did_work: bool) {
        let holder = &self.holders[idx];
        if did_work {
            holder.process_is_black.store(true, Ordering::Relaxed);
        }
        // Acquire pairs with the Release hand-off below so the token color
        // written by the forwarding worker is visible.
        if !holder.has_token.load(Ordering::Acquire) {
            return;
        }
        let token_black = holder.token_is_black.load(Ordering::Relaxed);
        let process_black = holder.process_is_black.load(Ordering::Relaxed);
        let tainted = token_black || process_black;
        holder.token_is_black.store(false, Ordering::Relaxed);
        holder.process_is_black.store(false, Ordering::Relaxed);

        if idx == MASTER {
            if holder.last_was_white.load(Ordering::Relaxed) && !tainted {
                // Two consecutive white receipts: a full round passed with no
                // activity anywhere. Keep the token; the ring stops here.
                self.epoch.fetch_add(1, Ordering::Release);
                return;
            }
            holder.last_was_white.store(!tainted, Ordering::Relaxed);
            // The master always re-emits a white token; activity observed
            // during the next round will blacken it en route.
            self.pass_token(idx, false);
        } else {
            self.pass_token(idx, tainted);
        }
    }

    /// Re-arm worker `idx`'s ring slot for a fresh detection round
    ///
    /// Must not run concurrently with any worker's [`Self::report`]; the
    /// executor brackets re-arming between two barrier waits.
    pub fn arm(&self, idx: usize) {
        let holder = &self.holders[idx];
        holder.has_token.store(idx == MASTER, Ordering::Relaxed);
        // Re-armed rounds start from a black token too, see `new()`
        holder.token_is_black.store(idx == MASTER, Ordering::Relaxed);
        holder.process_is_black.store(false, Ordering::Relaxed);
        holder.last_was_white.store(false, Ordering::Relaxed);
    }

    /// Hand the token to the next worker in the ring
    fn pass_token(&self, idx: usize, tainted: bool) {
        let holder = &self.holders[idx];
        holder.has_token.store(false, Ordering::Relaxed);
        let next = &self.holders[(idx + 1) % self.holders.len()];
        next.token_is_black.store(tainted, Ordering::Relaxed);
        // Release publishes the color store above along with the token
        next.has_token.store(true, Ordering::Release);
    }
}
