//! Lifecycle events published by the state machine and the scheduler.

use serde::{Deserialize, Serialize};

use super::ids::JobId;

/// One event per committed transition.
///
/// Wire names follow the queue-events vocabulary (`completed`, `failed`,
/// `retries-exhausted`, `stalled`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    Completed {
        queue: String,
        job_id: JobId,
        attempts_made: u32,
        return_value: serde_json::Value,
    },

    /// Emitted for every failed attempt, whether or not it will be retried.
    Failed {
        queue: String,
        job_id: JobId,
        attempts_made: u32,
        reason: String,
    },

    /// Emitted once, right after the `Failed` event of the last attempt.
    RetriesExhausted {
        queue: String,
        job_id: JobId,
        attempts_made: u32,
        reason: String,
    },

    /// Stall recovery took the job away from a lease holder that went quiet.
    Stalled {
        queue: String,
        job_id: JobId,
        stalled_count: u32,
    },
}

/// Event discriminant, used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Completed,
    Failed,
    RetriesExhausted,
    Stalled,
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Completed { .. } => EventKind::Completed,
            LifecycleEvent::Failed { .. } => EventKind::Failed,
            LifecycleEvent::RetriesExhausted { .. } => EventKind::RetriesExhausted,
            LifecycleEvent::Stalled { .. } => EventKind::Stalled,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            LifecycleEvent::Completed { job_id, .. }
            | LifecycleEvent::Failed { job_id, .. }
            | LifecycleEvent::RetriesExhausted { job_id, .. }
            | LifecycleEvent::Stalled { job_id, .. } => *job_id,
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            LifecycleEvent::Completed { queue, .. }
            | LifecycleEvent::Failed { queue, .. }
            | LifecycleEvent::RetriesExhausted { queue, .. }
            | LifecycleEvent::Stalled { queue, .. } => queue,
        }
    }
}
