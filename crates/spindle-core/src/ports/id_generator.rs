//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + ランダム部分から ULID を作る

use crate::domain::ids::{JobId, LeaseId, WorkerId};
use crate::ports::Clock;
use ulid::Ulid;

/// Thread-safe id source.
pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;

    fn generate_lease_id(&self) -> LeaseId;

    fn generate_worker_id(&self) -> WorkerId;
}

/// ULID generator. Timestamps come from the clock, so a FixedClock gives ids
/// that share the timestamp part.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn generate_lease_id(&self) -> LeaseId {
        LeaseId::from(self.next())
    }

    fn generate_worker_id(&self) -> WorkerId {
        WorkerId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_job_id();
        let id2 = id_gen.generate_job_id();

        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_uses_the_clock_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let lease1 = id_gen.generate_lease_id();
        let lease2 = id_gen.generate_lease_id();

        assert_ne!(lease1, lease2);
        assert_eq!(lease1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(lease2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
