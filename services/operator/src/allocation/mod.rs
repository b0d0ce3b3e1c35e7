//! Allocation of standing-by instances to sessions.

pub mod engine;
pub mod queue;
pub mod sync;

pub use engine::{
    attempt, AllocateArgs, AllocateRequest, AllocateResponse, AllocationEngine, AllocationError,
    AttemptError, DEFAULT_ATTEMPTS, REQUEUE_CAPACITY,
};
pub use queue::{InstanceQueue, QueueEntry, Upsert};
pub use sync::QueueSyncReconciler;
