//! Placement policy seam.
//!
//! The reconciler does not decide where shards go; it hands the full
//! namespace state to a policy and commits whatever comes back. The
//! invariants (one shard, at most one active executor; transactional
//! reassignment) are enforced by the store, not the policy.

use crate::types::{AssignedState, ExecutorId, NamespaceState, ShardAssignment, ShardKey};
use std::collections::{BTreeMap, HashMap};

/// Input to a placement computation.
#[derive(Debug)]
pub struct PlacementInput<'a> {
    /// Full namespace snapshot the decision is based on.
    pub state: &'a NamespaceState,

    /// Executors eligible for assignment: ACTIVE status and a live
    /// heartbeat. Sorted for determinism.
    pub active_executors: Vec<ExecutorId>,

    /// The shard universe to place: configured fixed shards plus every
    /// shard known from reports and prior assignments.
    pub shards: Vec<ShardKey>,
}

/// Computes a new assignment from current state.
///
/// The returned map must contain an entry for every executor whose
/// assignment should change, including an empty entry for executors
/// that must be stripped (draining, expired). Entries carry the
/// `mod_revision` of the state they were derived from; the store uses it
/// as the optimistic-concurrency token.
pub trait PlacementPolicy: Send + Sync + 'static {
    fn compute(&self, input: &PlacementInput<'_>) -> HashMap<ExecutorId, AssignedState>;
}

/// Spread policy: stability first, then balance.
///
/// Shards keep their current owner while it stays eligible; orphaned
/// shards go to the eligible executor with the fewest shards, ties broken
/// by executor id. When shard counts diverge by more than one (an
/// executor joined late), excess shards move from the most to the least
/// loaded executor until counts are level. Executors that are no longer
/// eligible get an explicit empty assignment so READY entries never
/// survive on a non-ACTIVE executor.
#[derive(Debug, Default)]
pub struct SpreadPlacementPolicy;

impl PlacementPolicy for SpreadPlacementPolicy {
    fn compute(&self, input: &PlacementInput<'_>) -> HashMap<ExecutorId, AssignedState> {
        // BTreeMap keeps iteration deterministic across runs.
        let mut desired: BTreeMap<&ExecutorId, Vec<&ShardKey>> = BTreeMap::new();
        for executor in &input.active_executors {
            desired.entry(executor).or_default();
        }

        let mut orphans = Vec::new();
        for shard in &input.shards {
            match input.state.owner_of(shard) {
                Some(owner) if desired.contains_key(owner) => {
                    desired.get_mut(owner).unwrap().push(shard);
                }
                _ => orphans.push(shard),
            }
        }

        for shard in orphans {
            let Some((&executor, _)) = desired
                .iter()
                .min_by_key(|(executor, shards)| (shards.len(), executor.as_str()))
            else {
                // No eligible executor: the shard stays unassigned.
                continue;
            };
            desired.get_mut(executor).unwrap().push(shard);
        }

        // Level out imbalances left by staggered joins: move the
        // lexicographically largest shard off the most loaded executor
        // until counts differ by at most one.
        while !desired.is_empty() {
            let most = *desired
                .iter()
                .max_by_key(|(executor, shards)| {
                    (shards.len(), std::cmp::Reverse(executor.as_str()))
                })
                .map(|(executor, _)| executor)
                .unwrap();
            let least = *desired
                .iter()
                .min_by_key(|(executor, shards)| (shards.len(), executor.as_str()))
                .map(|(executor, _)| executor)
                .unwrap();
            if desired[most].len() <= desired[least].len() + 1 {
                break;
            }
            let donor = desired.get_mut(most).unwrap();
            donor.sort();
            let moved = donor.pop().unwrap();
            desired.get_mut(least).unwrap().push(moved);
        }

        // Emit one entry per executor known to the snapshot, so stripped
        // executors are explicitly emptied.
        let mut result = HashMap::new();
        for (executor, current) in &input.state.shard_assignments {
            let shards = desired.get(executor).cloned().unwrap_or_default();
            result.insert(
                executor.clone(),
                AssignedState {
                    assigned_shards: shards
                        .into_iter()
                        .map(|shard| (shard.clone(), ShardAssignment::ready()))
                        .collect(),
                    mod_revision: current.mod_revision,
                },
            );
        }
        // Executors that appear eligible but have no stored assignment
        // yet (first heartbeat raced the snapshot) enter at revision 0.
        for executor in &input.active_executors {
            if result.contains_key(executor) {
                continue;
            }
            let shards = desired.get(executor).cloned().unwrap_or_default();
            result.insert(
                executor.clone(),
                AssignedState {
                    assigned_shards: shards
                        .into_iter()
                        .map(|shard| (shard.clone(), ShardAssignment::ready()))
                        .collect(),
                    mod_revision: 0,
                },
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutorStatus, HeartbeatState};

    fn state_with(executors: &[(&str, ExecutorStatus, &[&str])]) -> NamespaceState {
        let mut state = NamespaceState::default();
        for (id, status, shards) in executors {
            state.executors.insert(
                id.to_string(),
                HeartbeatState {
                    status: *status,
                    ..Default::default()
                },
            );
            let mut assigned = AssignedState::default();
            for shard in *shards {
                assigned
                    .assigned_shards
                    .insert(shard.to_string(), ShardAssignment::ready());
            }
            state.shard_assignments.insert(id.to_string(), assigned);
        }
        state
    }

    fn shards(keys: &[&str]) -> Vec<ShardKey> {
        keys.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_spreads_over_active_executors() {
        let state = state_with(&[
            ("e1", ExecutorStatus::Active, &[]),
            ("e2", ExecutorStatus::Active, &[]),
        ]);
        let input = PlacementInput {
            state: &state,
            active_executors: vec!["e1".to_string(), "e2".to_string()],
            shards: shards(&["0", "1", "2", "3"]),
        };

        let result = SpreadPlacementPolicy.compute(&input);
        assert_eq!(result["e1"].assigned_shards.len(), 2);
        assert_eq!(result["e2"].assigned_shards.len(), 2);
    }

    #[test]
    fn test_keeps_shards_on_current_owner() {
        let state = state_with(&[
            ("e1", ExecutorStatus::Active, &["0", "1"]),
            ("e2", ExecutorStatus::Active, &[]),
        ]);
        let input = PlacementInput {
            state: &state,
            active_executors: vec!["e1".to_string(), "e2".to_string()],
            shards: shards(&["0", "1", "2", "3"]),
        };

        let result = SpreadPlacementPolicy.compute(&input);
        assert!(result["e1"].assigned_shards.contains_key("0"));
        assert!(result["e1"].assigned_shards.contains_key("1"));
        // The two new shards land on the emptier executor.
        assert!(result["e2"].assigned_shards.contains_key("2"));
        assert!(result["e2"].assigned_shards.contains_key("3"));
    }

    #[test]
    fn test_strips_draining_executor() {
        let state = state_with(&[
            ("e1", ExecutorStatus::Draining, &["0", "1"]),
            ("e2", ExecutorStatus::Active, &[]),
        ]);
        let input = PlacementInput {
            state: &state,
            active_executors: vec!["e2".to_string()],
            shards: shards(&["0", "1"]),
        };

        let result = SpreadPlacementPolicy.compute(&input);
        assert!(result["e1"].assigned_shards.is_empty());
        assert_eq!(result["e2"].assigned_shards.len(), 2);
    }

    #[test]
    fn test_rebalances_after_late_join() {
        // e1 took everything before e2 joined.
        let state = state_with(&[
            ("e1", ExecutorStatus::Active, &["0", "1", "2", "3"]),
            ("e2", ExecutorStatus::Active, &[]),
        ]);
        let input = PlacementInput {
            state: &state,
            active_executors: vec!["e1".to_string(), "e2".to_string()],
            shards: shards(&["0", "1", "2", "3"]),
        };

        let result = SpreadPlacementPolicy.compute(&input);
        assert_eq!(result["e1"].assigned_shards.len(), 2);
        assert_eq!(result["e2"].assigned_shards.len(), 2);
        // Stability: the shards that stayed on e1 are the low ones.
        assert!(result["e1"].assigned_shards.contains_key("0"));
        assert!(result["e1"].assigned_shards.contains_key("1"));
    }

    #[test]
    fn test_no_eligible_executors_leaves_shards_unassigned() {
        let state = state_with(&[("e1", ExecutorStatus::Drained, &["0"])]);
        let input = PlacementInput {
            state: &state,
            active_executors: vec![],
            shards: shards(&["0"]),
        };

        let result = SpreadPlacementPolicy.compute(&input);
        assert!(result["e1"].assigned_shards.is_empty());
    }
}
