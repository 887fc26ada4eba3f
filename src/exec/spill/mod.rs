// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
pub mod block_manager;
pub mod dir_manager;
pub mod io_pool;
pub mod ipc_serde;
pub mod spill_stream;
pub mod spiller;

use crate::runtime::mem_tracker::MemTracker;

pub use io_pool::{SpillIoExecutor, SpillIoTask};
pub use spiller::{SpillFile, Spiller};

/// Decides when the container should spill its current in-memory partition.
///
/// Injected as a strategy object so tests can force deterministic spill
/// timing without manufacturing real memory pressure, and so the trigger
/// stays coupled to live tracker accounting rather than to a global hook.
pub trait SpillPolicy: Send + Sync {
    fn should_spill(&self, partition_rows: i64, mem_tracker: &MemTracker) -> bool;
}

/// Proactive quota policy: spill once consumption attributed to the tracker
/// crosses `alarm_ratio * memory_quota_bytes`, leaving headroom below the
/// hard quota.
#[derive(Debug)]
pub struct QuotaSpillPolicy {
    threshold_bytes: i64,
}

impl QuotaSpillPolicy {
    pub fn new(memory_quota_bytes: u64, alarm_ratio: f64) -> Self {
        let threshold_bytes = if memory_quota_bytes == 0 {
            // 0 = unlimited: never trigger proactively.
            i64::MAX
        } else {
            let ratio = alarm_ratio.clamp(0.0, 1.0);
            let threshold = (memory_quota_bytes as f64 * ratio) as i64;
            threshold.max(1)
        };
        Self { threshold_bytes }
    }

    pub fn threshold_bytes(&self) -> i64 {
        self.threshold_bytes
    }
}

impl SpillPolicy for QuotaSpillPolicy {
    fn should_spill(&self, partition_rows: i64, mem_tracker: &MemTracker) -> bool {
        partition_rows > 0 && mem_tracker.current() >= self.threshold_bytes
    }
}

/// Deterministic test hook: spill after every append that left rows in the
/// partition, regardless of actual memory pressure.
#[derive(Debug, Default)]
pub struct ForceSpillPolicy;

impl SpillPolicy for ForceSpillPolicy {
    fn should_spill(&self, partition_rows: i64, _mem_tracker: &MemTracker) -> bool {
        partition_rows > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_policy_fires_at_alarm_threshold() {
        let tracker = MemTracker::new_root("test");
        let policy = QuotaSpillPolicy::new(1000, 0.8);
        assert_eq!(policy.threshold_bytes(), 800);
        tracker.consume(799);
        assert!(!policy.should_spill(10, &tracker));
        tracker.consume(1);
        assert!(policy.should_spill(10, &tracker));
        assert!(!policy.should_spill(0, &tracker));
    }

    #[test]
    fn zero_quota_means_unlimited() {
        let tracker = MemTracker::new_root("test");
        tracker.consume(i64::MAX / 2);
        let policy = QuotaSpillPolicy::new(0, 0.8);
        assert!(!policy.should_spill(10, &tracker));
    }

    #[test]
    fn force_policy_fires_on_any_rows() {
        let tracker = MemTracker::new_root("test");
        let policy = ForceSpillPolicy;
        assert!(policy.should_spill(1, &tracker));
        assert!(!policy.should_spill(0, &tracker));
    }
}
