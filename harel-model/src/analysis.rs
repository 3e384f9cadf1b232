//! Static model analysis: reachability and capacity derivation.
//!
//! Capacities are derived once at construction so that generated code can
//! size every buffer at compile time.

use crate::arena::{StateArena, StateId, StateKind};
use crate::error::ModelError;
use crate::machine::TransitionDef;
use crate::raw::{OverflowPolicy, RawMachine};
use std::collections::BTreeSet;

/// Fixed bounds derived from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capacities {
    /// Event queue capacity per instance.
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Completion cascade bound per instance.
    pub cascade_limit: u32,
    /// Maximum number of simultaneously active leaf states.
    pub max_regions: usize,
    /// Number of distinct deferrable event kinds.
    pub deferred_kinds: usize,
    /// Sorted distinct external event names used as triggers.
    pub event_alphabet: Vec<String>,
}

/// Derives all fixed bounds from the raw definition and the state tree.
pub fn derive_capacities(raw: &RawMachine, arena: &StateArena) -> Capacities {
    let mut events: BTreeSet<String> = BTreeSet::new();
    for t in &raw.transitions {
        if let Some(event) = &t.event {
            events.insert(event.clone());
        }
    }

    let mut deferred: BTreeSet<&str> = BTreeSet::new();
    for node in arena.iter() {
        for name in &node.deferred {
            deferred.insert(name);
        }
    }

    Capacities {
        queue_capacity: raw.queue_capacity,
        overflow: raw.overflow,
        cascade_limit: raw.cascade_limit,
        max_regions: concurrent_leaves(arena, StateId::ROOT),
        deferred_kinds: deferred.len(),
        event_alphabet: events.into_iter().collect(),
    }
}

/// Maximum leaf states active at once under `state`.
fn concurrent_leaves(arena: &StateArena, state: StateId) -> usize {
    let node = arena.get(state);
    match node.kind {
        StateKind::Simple | StateKind::Final => 1,
        StateKind::ShallowHistory | StateKind::DeepHistory => 0,
        StateKind::Composite => node
            .children
            .iter()
            .map(|&c| concurrent_leaves(arena, c))
            .max()
            .unwrap_or(1),
        StateKind::Parallel => node
            .children
            .iter()
            .map(|&c| concurrent_leaves(arena, c))
            .sum(),
    }
}

/// Flags states that no initial chain, history default, or transition target
/// can ever activate. History pseudostates are entry devices and are exempt,
/// though a targeted one propagates reachability to its default.
pub fn check_reachability(
    arena: &StateArena,
    transitions: &[TransitionDef],
) -> Result<(), ModelError> {
    let mut reached = vec![false; arena.len()];
    let mut work = vec![StateId::ROOT];

    while let Some(id) = work.pop() {
        if reached[id.index()] {
            continue;
        }
        reached[id.index()] = true;

        let node = arena.get(id);
        match node.kind {
            StateKind::Composite => {
                if let Some(initial) = node.initial {
                    work.push(initial);
                }
            }
            StateKind::Parallel => {
                work.extend(node.children.iter().copied());
            }
            StateKind::ShallowHistory | StateKind::DeepHistory => {
                if let Some(default) = node.history_default {
                    work.push(default);
                }
            }
            StateKind::Simple | StateKind::Final => {}
        }

        // Every transition sourced on a now-reachable state makes its target
        // (and the target's ancestors) reachable.
        for t in transitions {
            if t.source == id {
                work.extend(arena.ancestors_and_self(t.target));
            }
        }
    }

    for node in arena.iter() {
        if !reached[node.id.index()] && node.kind.is_activatable() {
            return Err(ModelError::UnreachableState {
                name: node.name.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use serde_json::json;

    #[test]
    fn test_unreachable_state_detected() {
        let result = Machine::from_json(&json!({
            "name": "m",
            "initial": "a",
            "states": [{"name": "a"}, {"name": "orphan"}]
        }));
        assert!(matches!(result, Err(ModelError::UnreachableState { .. })));
    }

    #[test]
    fn test_transition_target_is_reachable() {
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "a",
            "states": [{"name": "a"}, {"name": "b"}],
            "transitions": [{"from": "a", "event": "GO", "to": "b"}]
        }));
        assert!(m.is_ok());
    }

    #[test]
    fn test_max_regions_for_parallel() {
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "p",
            "states": [
                {"name": "p", "regions": [
                    {"name": "r1", "initial": "x", "states": [{"name": "x"}]},
                    {"name": "r2", "initial": "y", "states": [{"name": "y"}]},
                    {"name": "r3", "initial": "z", "states": [{"name": "z"}]}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(m.caps.max_regions, 3);
    }

    #[test]
    fn test_alphabet_and_deferred_kinds() {
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "a",
            "states": [
                {"name": "a", "defer": ["CFG", "AUX"]},
                {"name": "b", "defer": ["CFG"]}
            ],
            "transitions": [
                {"from": "a", "event": "GO", "to": "b"},
                {"from": "b", "event": "BACK", "to": "a"}
            ]
        }))
        .unwrap();
        assert_eq!(m.caps.event_alphabet, vec!["BACK", "GO"]);
        assert_eq!(m.caps.deferred_kinds, 2);
    }

    #[test]
    fn test_queue_defaults() {
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "a",
            "states": [{"name": "a"}]
        }))
        .unwrap();
        assert_eq!(m.caps.queue_capacity, 16);
        assert_eq!(m.caps.cascade_limit, 8);
        assert_eq!(m.caps.overflow, OverflowPolicy::Reject);
        assert_eq!(m.caps.max_regions, 1);
    }
}
