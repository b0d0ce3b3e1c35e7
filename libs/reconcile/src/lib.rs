//! Reconciliation loop primitives.
//!
//! This library provides the pure building blocks used by the fleet
//! controllers to converge observed instance populations toward each
//! build's desired state. Key concepts:
//!
//! - **Desired state**: `standingBy` and `max` on a build.
//! - **Observed state**: instances bucketed by lifecycle state.
//! - **Expectations**: creates and deletes that were issued but are not yet
//!   visible in the watch cache.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A plan never takes a build past its `max`
//! - Active instances are never chosen for scale-down

mod backoff;
mod crash;
mod deletion;
mod expectations;
mod scale;

use std::time::Duration;

use thiserror::Error;

pub use backoff::Backoff;
pub use crash::{crash_threshold_reached, CrashLedger};
pub use deletion::{select_for_deletion, DeletionPriority};
pub use expectations::Expectations;
pub use scale::{BatchLimits, DesiredScale, PopulationCounts, ScalePlan};

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A pass exceeded its deadline.
    #[error("timeout after {elapsed:?} reconciling {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },
}

/// Default periodic resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default cap on instances created by one pass over a build.
pub const DEFAULT_MAX_CREATE_PER_PASS: usize = 20;

/// Default cap on instances deleted by one pass over a build.
pub const DEFAULT_MAX_DELETE_PER_PASS: usize = 20;

/// Default crash count at which a build is marked unhealthy.
pub const DEFAULT_CRASHES_TO_MARK_UNHEALTHY: u32 = 5;
