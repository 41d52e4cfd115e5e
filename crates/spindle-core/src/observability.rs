use serde::{Deserialize, Serialize};

use crate::domain::JobState;

/// Jobs per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Active => self.active += 1,
            JobState::DelayedRetry => self.delayed += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }
}
