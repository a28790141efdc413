#![warn(clippy::print_stdout, clippy::print_stderr, clippy::dbg_macro)]

mod abort;
mod barrier;
mod context;
mod executor;
mod stats;
mod termination;
mod topology;
mod worklist;

pub use crate::{
    abort::Escalation,
    context::{Conflict, Resource, UserContext},
    executor::{for_each, Config},
    stats::LoopStats,
};

use std::time::Duration;

/// Sleep duration used for busy waiting
///
/// Need a non-zero sleep duration to trigger a scheduler yield on Linux.
const YIELD_DURATION: Duration = Duration::from_nanos(1);
