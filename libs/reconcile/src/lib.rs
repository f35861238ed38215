//! Convergence decision primitives.
//!
//! The reconciliation engine compares three views of every managed object:
//!
//! - **Recorded state**: what the last successful run persisted.
//! - **Observed state**: what the cloud reports right now.
//! - **Desired state**: what the networking intent asks for.
//!
//! The functions here turn those views into a single action. They never talk to
//! the cloud, so every decision is deterministic and cheap to test.
//!
//! # Invariants
//!
//! - Deciding twice on the same inputs yields the same action
//! - An action is only mutating when the observed state differs from the desired one
//! - A destination the engine never recorded is never deleted

use serde::Serialize;
use sha2::{Digest, Sha256};

// =============================================================================
// Routes
// =============================================================================

/// What the cloud currently has at a route destination.
#[derive(Debug, PartialEq, Eq)]
pub enum Observed<'a, T> {
    /// No route for the destination.
    Absent,
    /// A route exists but its target is not one the engine manages (for
    /// example the implicit `local` route).
    Foreign,
    /// A route exists with a managed target.
    Present(&'a T),
}

impl<T> Clone for Observed<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Observed<'_, T> {}

impl<T> Observed<'_, T> {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Action needed to converge a single route destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction<T> {
    /// Create the route and record it.
    Create(T),
    /// Replace the live route's target and record it.
    Replace(T),
    /// The live route already matches; only the recorded state changes.
    Record(T),
    /// Delete the live route and drop it from state.
    Delete,
    /// The route is recorded but already gone live; drop it from state.
    Forget,
    /// Nothing to do.
    Unchanged,
}

impl<T> RouteAction<T> {
    /// Returns true if applying this action calls the cloud.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Create(_) | Self::Replace(_) | Self::Delete)
    }

    /// Returns true if the recorded state changes.
    pub fn changes_state(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Decide how to converge one route destination.
///
/// `recorded` is the target stored in state, `observed` the live route and
/// `desired` the target the intent asks for (`None` means "no route").
pub fn plan_route<T>(
    recorded: Option<&T>,
    observed: Observed<'_, T>,
    desired: Option<&T>,
) -> RouteAction<T>
where
    T: PartialEq + Clone,
{
    match desired {
        None => match (recorded, observed) {
            (None, _) => RouteAction::Unchanged,
            (Some(_), Observed::Absent) => RouteAction::Forget,
            (Some(_), _) => RouteAction::Delete,
        },
        Some(want) => match observed {
            Observed::Absent => RouteAction::Create(want.clone()),
            Observed::Foreign => RouteAction::Replace(want.clone()),
            Observed::Present(live) if live != want => RouteAction::Replace(want.clone()),
            Observed::Present(_) if recorded == Some(want) => RouteAction::Unchanged,
            Observed::Present(_) => RouteAction::Record(want.clone()),
        },
    }
}

// =============================================================================
// Associations
// =============================================================================

/// A live route table association of one subnet or gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedAssociation<'a> {
    pub association_id: &'a str,
    pub route_table_id: &'a str,
}

/// Action needed so a subnet (or gateway) is associated with exactly one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationAction {
    /// Already associated with the desired table.
    Keep { association_id: String },
    /// Associated with another table; swap it in place.
    Replace { association_id: String },
    /// No association yet.
    Associate,
    /// More than one association was observed. This is never repaired
    /// automatically.
    Conflict { count: usize },
}

/// Decide how to associate a target with `desired_route_table_id`.
pub fn plan_association(
    desired_route_table_id: &str,
    observed: &[ObservedAssociation<'_>],
) -> AssociationAction {
    match observed {
        [] => AssociationAction::Associate,
        [only] if only.route_table_id == desired_route_table_id => AssociationAction::Keep {
            association_id: only.association_id.to_string(),
        },
        [only] => AssociationAction::Replace {
            association_id: only.association_id.to_string(),
        },
        many => AssociationAction::Conflict { count: many.len() },
    }
}

// =============================================================================
// Run summaries
// =============================================================================

/// Convergence status of one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// No mutating call was needed.
    Converged,
    /// The run changed live resources; a rerun should report `Converged`.
    Converging,
}

impl ConvergenceStatus {
    pub fn from_changes(mutations: usize) -> Self {
        if mutations == 0 {
            Self::Converged
        } else {
            Self::Converging
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Converging => "converging",
        }
    }
}

impl std::fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// State digests
// =============================================================================

/// Content digest of a persisted snapshot.
///
/// Used by the state store to skip writes that would not change anything.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateDigest(String);

impl StateDigest {
    /// Digest of canonical JSON (sorted keys, no whitespace).
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(digest)))
    }

    /// Digest of any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    /// Wraps a digest previously produced by [`StateDigest::as_str`].
    pub fn from_stored(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String((*k).clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        // Scalars already serialize canonically.
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Hop {
        Igw(&'static str),
        Nat(&'static str),
    }

    const IGW: Hop = Hop::Igw("igw-1");
    const NAT: Hop = Hop::Nat("nat-1");

    #[rstest]
    #[case::fresh(None, Observed::Absent, Some(&IGW), RouteAction::Create(IGW))]
    #[case::adopt_live(None, Observed::Present(&IGW), Some(&IGW), RouteAction::Record(IGW))]
    #[case::retarget(Some(&NAT), Observed::Present(&NAT), Some(&IGW), RouteAction::Replace(IGW))]
    #[case::overwrite_local(None, Observed::Foreign, Some(&IGW), RouteAction::Replace(IGW))]
    #[case::drifted_away(Some(&IGW), Observed::Absent, Some(&IGW), RouteAction::Create(IGW))]
    #[case::steady(Some(&IGW), Observed::Present(&IGW), Some(&IGW), RouteAction::Unchanged)]
    #[case::remove(Some(&IGW), Observed::Present(&IGW), None, RouteAction::Delete)]
    #[case::already_gone(Some(&IGW), Observed::Absent, None, RouteAction::Forget)]
    #[case::not_ours(None, Observed::Present(&NAT), None, RouteAction::Unchanged)]
    fn route_decisions(
        #[case] recorded: Option<&Hop>,
        #[case] observed: Observed<'_, Hop>,
        #[case] desired: Option<&Hop>,
        #[case] expected: RouteAction<Hop>,
    ) {
        assert_eq!(plan_route(recorded, observed, desired), expected);
    }

    #[test]
    fn test_steady_route_is_not_mutating() {
        let action = plan_route(Some(&IGW), Observed::Present(&IGW), Some(&IGW));
        assert!(!action.is_mutating());
        assert!(!action.changes_state());

        let action = plan_route(None, Observed::Present(&IGW), Some(&IGW));
        assert!(!action.is_mutating());
        assert!(action.changes_state());
    }

    #[test]
    fn test_association_decisions() {
        assert_eq!(plan_association("rtb-a", &[]), AssociationAction::Associate);

        let current = [ObservedAssociation {
            association_id: "rtbassoc-1",
            route_table_id: "rtb-a",
        }];
        assert_eq!(
            plan_association("rtb-a", &current),
            AssociationAction::Keep {
                association_id: "rtbassoc-1".to_string()
            }
        );
        assert_eq!(
            plan_association("rtb-b", &current),
            AssociationAction::Replace {
                association_id: "rtbassoc-1".to_string()
            }
        );

        let doubled = [
            current[0],
            ObservedAssociation {
                association_id: "rtbassoc-2",
                route_table_id: "rtb-b",
            },
        ];
        assert_eq!(
            plan_association("rtb-a", &doubled),
            AssociationAction::Conflict { count: 2 }
        );
    }

    #[test]
    fn test_convergence_status() {
        assert!(ConvergenceStatus::from_changes(0).is_converged());
        assert_eq!(ConvergenceStatus::from_changes(3), ConvergenceStatus::Converging);
        assert_eq!(ConvergenceStatus::Converging.to_string(), "converging");
    }

    #[test]
    fn test_state_digest_ignores_key_order() {
        let a = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "q\"uote"}});
        let b = serde_json::json!({"a": {"x": "q\"uote", "y": [1, 2]}, "b": 2});
        assert_eq!(StateDigest::from_json(&a), StateDigest::from_json(&b));
    }

    #[test]
    fn test_state_digest_sees_array_order() {
        let a = serde_json::json!({"routes": ["a", "b"]});
        let b = serde_json::json!({"routes": ["b", "a"]});
        assert_ne!(StateDigest::from_json(&a), StateDigest::from_json(&b));
    }

    #[test]
    fn test_state_digest_format() {
        let digest = StateDigest::of(&vec![1, 2, 3]).unwrap();
        assert!(digest.as_str().starts_with("sha256:"));
        assert_eq!(digest.as_str().len(), "sha256:".len() + 64);
        assert_eq!(StateDigest::from_stored(digest.as_str()), digest);
    }
}
