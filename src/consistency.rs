//! Read Consistency
//!
//! Reconciles the answers of two replicas into a single read result.

use serde::{Deserialize, Serialize};

use crate::network::StoredValue;
use crate::version::VersionStamp;

/// Read consistency policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// First replica that has the key wins
    #[default]
    Weak,
    /// Like `Weak`, but the secondary is always asked first
    Medium,
    /// Ask primary and secondary, keep the newer stamp
    Strong,
}

impl std::fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyMode::Weak => write!(f, "weak"),
            ConsistencyMode::Medium => write!(f, "medium"),
            ConsistencyMode::Strong => write!(f, "strong"),
        }
    }
}

/// What one replica said about a key
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaRead {
    Found(StoredValue),
    Missing,
    /// No answer: network failure, or the replica was not eligible
    Unreachable,
}

impl ReplicaRead {
    fn answered(&self) -> bool {
        !matches!(self, ReplicaRead::Unreachable)
    }

    fn version(&self) -> VersionStamp {
        match self {
            ReplicaRead::Found(stored) => stored.version,
            _ => VersionStamp::ABSENT,
        }
    }
}

/// A resolved read
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadOutcome {
    pub value: Option<StoredValue>,
}

impl ReadOutcome {
    pub fn found(&self) -> bool {
        self.value.is_some()
    }

    /// Winning stamp, `ABSENT` when not found
    pub fn version(&self) -> VersionStamp {
        self.value.as_ref().map(|v| v.version).unwrap_or(VersionStamp::ABSENT)
    }

    pub fn into_value(self) -> Option<StoredValue> {
        self.value
    }
}

impl From<ReplicaRead> for ReadOutcome {
    fn from(read: ReplicaRead) -> Self {
        match read {
            ReplicaRead::Found(value) => ReadOutcome { value: Some(value) },
            _ => ReadOutcome::default(),
        }
    }
}

/// Combines replica answers according to a `ConsistencyMode`
pub struct ConsistencyResolver;

impl ConsistencyResolver {
    /// Resolve two answers. For `Strong`, `first` must be the primary's.
    ///
    /// Returns `None` when neither replica answered.
    pub fn resolve(mode: ConsistencyMode, first: ReplicaRead, second: ReplicaRead) -> Option<ReadOutcome> {
        if !first.answered() && !second.answered() {
            return None;
        }

        let winner = match mode {
            ConsistencyMode::Weak | ConsistencyMode::Medium => match (first, second) {
                (found @ ReplicaRead::Found(_), _) | (_, found @ ReplicaRead::Found(_)) => found,
                _ => ReplicaRead::Missing,
            },
            ConsistencyMode::Strong => {
                // ties go to the primary
                if first.version() >= second.version() {
                    first
                } else {
                    second
                }
            }
        };

        Some(winner.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(value: &str, version: i64) -> ReplicaRead {
        ReplicaRead::Found(StoredValue {
            value: value.as_bytes().to_vec(),
            version: VersionStamp::from_raw(version),
        })
    }

    fn value_of(outcome: Option<ReadOutcome>) -> Option<Vec<u8>> {
        outcome.unwrap().into_value().map(|v| v.value)
    }

    #[test]
    fn test_strong_picks_larger_stamp() {
        let primary_newer = ConsistencyResolver::resolve(ConsistencyMode::Strong, found("p", 20), found("s", 10));
        assert_eq!(value_of(primary_newer), Some(b"p".to_vec()));

        let secondary_newer = ConsistencyResolver::resolve(ConsistencyMode::Strong, found("p", 10), found("s", 20));
        let outcome = secondary_newer.unwrap();
        assert_eq!(outcome.version(), VersionStamp::from_raw(20));
        assert_eq!(outcome.into_value().unwrap().value, b"s".to_vec());
    }

    #[test]
    fn test_strong_missing_side_loses() {
        let outcome = ConsistencyResolver::resolve(ConsistencyMode::Strong, ReplicaRead::Missing, found("s", 0));
        assert_eq!(value_of(outcome), Some(b"s".to_vec()));

        let outcome = ConsistencyResolver::resolve(ConsistencyMode::Strong, found("p", 0), ReplicaRead::Unreachable);
        assert_eq!(value_of(outcome), Some(b"p".to_vec()));
    }

    #[test]
    fn test_strong_tie_prefers_primary() {
        let outcome = ConsistencyResolver::resolve(ConsistencyMode::Strong, found("p", 5), found("s", 5));
        assert_eq!(value_of(outcome), Some(b"p".to_vec()));
    }

    #[test]
    fn test_weak_takes_first_found() {
        let outcome = ConsistencyResolver::resolve(ConsistencyMode::Weak, found("a", 1), found("b", 99));
        assert_eq!(value_of(outcome), Some(b"a".to_vec()));

        let outcome = ConsistencyResolver::resolve(ConsistencyMode::Medium, ReplicaRead::Missing, found("b", 1));
        assert_eq!(value_of(outcome), Some(b"b".to_vec()));
    }

    #[test]
    fn test_not_found_and_unreachable() {
        let outcome =
            ConsistencyResolver::resolve(ConsistencyMode::Strong, ReplicaRead::Missing, ReplicaRead::Unreachable);
        assert!(!outcome.unwrap().found());

        assert!(
            ConsistencyResolver::resolve(ConsistencyMode::Weak, ReplicaRead::Unreachable, ReplicaRead::Unreachable)
                .is_none()
        );
    }
}
