//! Attempt Plans
//!
//! Replica fallback expressed as an ordered list of roles evaluated by one
//! loop. A network error moves on to the next step; any other error stops the
//! plan immediately.

use std::future::Future;
use std::sync::Arc;

use crate::dispatch::{ReplicaSet, Role};
use crate::error::{Error, Result};
use crate::state::{FailoverController, FailureReason, NodeDescriptor};

/// What to do after a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Try the next step
    Next,
    /// Give up and surface the error
    Stop,
}

/// Decide whether an error allows falling through to another replica
pub fn verdict(error: &Error) -> Verdict {
    if error.is_retryable() {
        Verdict::Next
    } else {
        Verdict::Stop
    }
}

/// The step that produced an answer
#[derive(Debug)]
pub struct Answered<T> {
    pub role: Role,
    pub node: Arc<NodeDescriptor>,
    pub value: T,
}

/// Ordered replica roles to try
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPlan {
    steps: Vec<Role>,
}

impl AttemptPlan {
    /// Primary, secondary, tertiary
    pub fn role_order() -> Self {
        Self {
            steps: vec![Role::Primary, Role::Secondary, Role::Tertiary],
        }
    }

    /// `[first, second, first again, tertiary]` for single-answer reads
    pub fn read_fallback(prefer_secondary: bool) -> Self {
        let (first, second) = if prefer_secondary {
            (Role::Secondary, Role::Primary)
        } else {
            (Role::Primary, Role::Secondary)
        };
        Self {
            steps: vec![first, second, first, Role::Tertiary],
        }
    }

    pub fn steps(&self) -> &[Role] {
        &self.steps
    }

    /// Walk the plan against `set` until a step answers.
    ///
    /// Roles missing from the set or whose node is not eligible are skipped.
    /// Every network failure is reported to `failover`.
    pub async fn run<T, F, Fut>(
        &self,
        set: &ReplicaSet,
        failover: &FailoverController,
        key: &[u8],
        mut attempt: F,
    ) -> Result<Answered<T>>
    where
        F: FnMut(Arc<NodeDescriptor>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempted = 0;

        for &role in &self.steps {
            let Some(replica) = set.role(role) else {
                continue;
            };
            let name = &replica.node.full_name;
            let Some(_lease) = failover.acquire(name) else {
                tracing::trace!("Skipping {} {}: not eligible", role, name);
                continue;
            };

            attempted += 1;
            match attempt(Arc::clone(&replica.node)).await {
                Ok(value) => {
                    failover.record_success(name);
                    return Ok(Answered {
                        role,
                        node: Arc::clone(&replica.node),
                        value,
                    });
                }
                Err(e) => match verdict(&e) {
                    Verdict::Next => {
                        tracing::debug!("{} {} failed, trying next replica: {}", role, name, e);
                        failover.record_failure(name, FailureReason::from_error(&e));
                    }
                    Verdict::Stop => {
                        if matches!(e, Error::Rejected(_)) {
                            failover.record_success(name);
                        }
                        return Err(e);
                    }
                },
            }
        }

        if attempted == 0 && !(set.is_empty() && set.excluded().is_empty()) {
            let nodes: Vec<&str> = set
                .replicas()
                .iter()
                .chain(set.excluded())
                .map(|r| r.node.full_name.as_str())
                .collect();
            return Err(Error::NodeUnavailable(nodes.join(", ")));
        }

        Err(Error::NoReplicaReachable {
            key: String::from_utf8_lossy(key).into_owned(),
            attempted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{HashAlgorithm, KeyDispatcher, PlacementRule, ReplicaGroup};
    use std::sync::Mutex;
    use std::time::Duration;

    fn setup() -> (KeyDispatcher, Arc<FailoverController>) {
        let node = |a: &str| Arc::new(NodeDescriptor::parse(a).unwrap());
        let failover = Arc::new(FailoverController::new(["p:1", "s:1", "t:1"], 3, Duration::from_millis(5)));
        let rule = PlacementRule::new(
            1,
            HashAlgorithm::Modulo,
            vec![ReplicaGroup {
                primary: node("p:1"),
                secondary: Some(node("s:1")),
                tertiary: Some(node("t:1")),
            }],
        )
        .unwrap();
        (KeyDispatcher::new(vec![rule], Arc::clone(&failover)).unwrap(), failover)
    }

    #[test]
    fn test_read_fallback_order() {
        assert_eq!(
            AttemptPlan::read_fallback(true).steps(),
            &[Role::Secondary, Role::Primary, Role::Secondary, Role::Tertiary]
        );
    }

    #[tokio::test]
    async fn test_network_error_falls_through() {
        let (dispatcher, failover) = setup();
        let set = dispatcher.resolve_write(b"k");
        let seen = Mutex::new(Vec::new());

        let answered = AttemptPlan::read_fallback(false)
            .run(&set, &failover, b"k", |node| {
                seen.lock().unwrap().push(node.full_name.clone());
                let down = node.full_name != "t:1";
                async move {
                    if down {
                        Err(Error::ConnectionTimeout(node.full_name.clone()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(answered.role, Role::Tertiary);
        assert_eq!(answered.value, 7);
        assert_eq!(*seen.lock().unwrap(), vec!["p:1", "s:1", "p:1", "t:1"]);
        assert_eq!(failover.report("p:1").unwrap().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_logical_error_stops() {
        let (dispatcher, failover) = setup();
        let set = dispatcher.resolve_write(b"k");
        let calls = Mutex::new(0);

        let result: Result<Answered<()>> = AttemptPlan::role_order()
            .run(&set, &failover, b"k", |_| {
                *calls.lock().unwrap() += 1;
                async { Err(Error::Rejected("data has already been updated".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Rejected(_))));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_plan() {
        let (dispatcher, failover) = setup();
        failover.mark_dead("s:1").unwrap();
        let set = dispatcher.resolve_write(b"k");

        let result: Result<Answered<()>> = AttemptPlan::role_order()
            .run(&set, &failover, b"k", |node| async move {
                Err(Error::ConnectionFailed {
                    address: node.full_name.clone(),
                    reason: "refused".into(),
                })
            })
            .await;

        match result {
            Err(Error::NoReplicaReachable { attempted, .. }) => assert_eq!(attempted, 2),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_every_node_excluded() {
        let (dispatcher, failover) = setup();
        for name in ["p:1", "s:1", "t:1"] {
            failover.mark_dead(name).unwrap();
        }
        let set = dispatcher.resolve_write(b"k");

        let result: Result<Answered<()>> = AttemptPlan::role_order()
            .run(&set, &failover, b"k", |_| async { Err(Error::Internal("attempted an excluded node".into())) })
            .await;

        match result {
            Err(Error::NodeUnavailable(nodes)) => assert_eq!(nodes, "p:1, s:1, t:1"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
