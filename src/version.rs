//! Version Stamps
//!
//! Every write carries a stamp used for latest-wins comparison between
//! replicas. Stamps are approximately monotonic across masters (the high
//! bits are wall-clock milliseconds) and unique within one process.
//!
//! Stamp Structure (64 bits, always positive):
//! - 1 bit: unused (sign bit)
//! - 41 bits: timestamp (milliseconds since STAMP_EPOCH)
//! - 10 bits: master ID (0-1023)
//! - 12 bits: sequence (0-4095 per millisecond)

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01 00:00:00 UTC
const STAMP_EPOCH: u64 = 1704067200000;

const MASTER_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;

const MAX_MASTER_ID: u64 = (1 << MASTER_ID_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

const MASTER_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = MASTER_ID_BITS + SEQUENCE_BITS;

/// Opaque recency token; higher is more recent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionStamp(i64);

impl VersionStamp {
    /// Stamp of a missing value; older than every real stamp
    pub const ABSENT: VersionStamp = VersionStamp(-1);

    /// Create from a raw value
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Raw value
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Wall-clock milliseconds (since UNIX epoch) the stamp was issued at
    pub fn timestamp(&self) -> Option<u64> {
        if self.0 < 0 {
            return None;
        }
        Some(((self.0 as u64) >> TIMESTAMP_SHIFT) + STAMP_EPOCH)
    }
}

impl std::fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for VersionStamp {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Thread-safe stamp issuer for one master process
pub struct VersionClock {
    master_id: u64,
    /// Packed state: upper bits = last timestamp, lower 12 bits = sequence
    state: AtomicU64,
}

impl VersionClock {
    /// Create a clock for the given master ID (masked to 10 bits)
    pub fn new(master_id: u16) -> Self {
        Self {
            master_id: master_id as u64 & MAX_MASTER_ID,
            state: AtomicU64::new(0),
        }
    }

    /// Create a clock whose master ID is derived from a node name
    pub fn for_node(node_id: &str) -> Self {
        Self::new((crc32fast::hash(node_id.as_bytes()) as u64 % (MAX_MASTER_ID + 1)) as u16)
    }

    /// Issue the next stamp. Lock-free.
    pub fn next(&self) -> VersionStamp {
        loop {
            let now = Self::current_time_millis();
            let old_state = self.state.load(Ordering::Relaxed);
            let old_timestamp = old_state >> SEQUENCE_BITS;
            let old_sequence = old_state & MAX_SEQUENCE;

            // A clock that steps backwards keeps issuing from the last timestamp
            let timestamp = now.max(old_timestamp);
            let sequence = if timestamp == old_timestamp && old_state != 0 {
                old_sequence + 1
            } else {
                0
            };

            let (timestamp, sequence) = if sequence > MAX_SEQUENCE {
                (old_timestamp + 1, 0)
            } else {
                (timestamp, sequence)
            };

            let new_state = (timestamp << SEQUENCE_BITS) | sequence;
            if self
                .state
                .compare_exchange(old_state, new_state, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                let raw = (timestamp << TIMESTAMP_SHIFT)
                    | (self.master_id << MASTER_ID_SHIFT)
                    | sequence;
                return VersionStamp((raw & i64::MAX as u64) as i64);
            }
        }
    }

    fn current_time_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(STAMP_EPOCH)
            .saturating_sub(STAMP_EPOCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_stamps_unique_and_increasing() {
        let clock = VersionClock::new(7);
        let mut last = VersionStamp::ABSENT;
        let mut seen = HashSet::new();

        for _ in 0..10000 {
            let stamp = clock.next();
            assert!(stamp > last, "stamps should increase within a process");
            assert!(seen.insert(stamp));
            last = stamp;
        }
    }

    #[test]
    fn test_absent_is_oldest() {
        let clock = VersionClock::for_node("master-1");
        assert!(clock.next() > VersionStamp::ABSENT);
        assert!(VersionStamp::ABSENT.timestamp().is_none());
    }

    #[test]
    fn test_concurrent_issue() {
        let clock = Arc::new(VersionClock::new(1));
        let mut handles = vec![];

        for _ in 0..4 {
            let clock = Arc::clone(&clock);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| clock.next()).collect::<Vec<_>>()
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for stamp in handle.join().unwrap() {
                assert!(all.insert(stamp), "duplicate stamp under concurrency");
            }
        }
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let clock = VersionClock::new(3);
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let stamp = clock.next();
        let at = stamp.timestamp().unwrap();
        assert!(at + 5 >= before);
    }
}
