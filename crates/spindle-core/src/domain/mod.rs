//! Domain model (ids, job record, outcomes, decisions, events, errors).

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod outcome;

pub use decision::RetryDecision;
pub use errors::{ListenerError, QueueError};
pub use events::{EventKind, LifecycleEvent};
pub use ids::{JobId, LeaseId, WorkerId};
pub use job::{
    Commit, JobOptions, JobRecord, JobState, Lease, NewJob, STALLED_REASON, StallOutcome,
    Transition,
};
pub use outcome::{FailureOutcome, ProcessError};
