//! Background job coordination
//!
//! One execution context per job kind, cooperative cancellation, and bounded
//! teardown. The page render queue and the cache janitor both run as jobs.

mod cancel;
mod coordinator;
mod janitor;

pub use cancel::CancellationToken;
pub use coordinator::{
    JobContext, JobEvent, JobKind, JobResult, JobState, JobUpdate, WorkerConfig,
    WorkerCoordinator, WorkerError,
};
pub use janitor::spawn_cache_janitor;
