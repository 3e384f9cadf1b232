//! Transition selection.
//!
//! A selector maps (active configuration, event, context) to a conflict-free
//! set of transitions, one per affected region at most. Two strategies
//! implement the same contract: the runtime ancestor walk below, and the
//! precomputed dispatch table in `harel-codegen`. Their observable behavior
//! must be identical, so the level matching, tie breaking, and conflict
//! resolution helpers here are shared by both.

use crate::error::EngineError;
use crate::eval::Evaluator;
use crate::event::{Event, EventKind};
use harel_model::{Machine, StateId, TransitionId, Trigger};
use serde_json::Value;

/// Strategy interface for event-triggered selection. Completion transitions
/// are selected separately (see [`select_completion`]); they depend on the
/// completion state, not on a queued event.
pub trait Selector: Send + Sync {
    fn select(
        &self,
        machine: &Machine,
        config: &[StateId],
        event: &Event,
        ctx: &Value,
        eval: &dyn Evaluator,
    ) -> Result<Vec<TransitionId>, EngineError>;
}

/// Ancestor-walk strategy: for each active leaf, walk from the leaf toward
/// the root; the first level with an enabled match shadows everything
/// farther out.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalkSelector;

impl Selector for WalkSelector {
    fn select(
        &self,
        machine: &Machine,
        config: &[StateId],
        event: &Event,
        ctx: &Value,
        eval: &dyn Evaluator,
    ) -> Result<Vec<TransitionId>, EngineError> {
        let mut picked: Vec<TransitionId> = Vec::new();

        for &leaf in config {
            for level in machine.arena().ancestors_and_self(leaf) {
                let candidates = match_level(machine, level, &event.kind);
                if candidates.is_empty() {
                    continue;
                }
                if let Some(t) = pick_enabled(machine, &candidates, &event.payload, ctx, eval)? {
                    if !picked.contains(&t) {
                        picked.push(t);
                    }
                    break;
                }
                // Declared-but-disabled transitions do not shadow outer
                // levels; keep walking.
            }
        }

        Ok(resolve_conflicts(machine, config, picked))
    }
}

/// Transitions declared on `level` whose trigger matches the event, in
/// priority order.
pub fn match_level(machine: &Machine, level: StateId, kind: &EventKind) -> Vec<TransitionId> {
    machine
        .outgoing(level)
        .iter()
        .copied()
        .filter(|&id| trigger_matches(&machine.transition(id).trigger, kind))
        .collect()
}

fn trigger_matches(trigger: &Trigger, kind: &EventKind) -> bool {
    match (trigger, kind) {
        (Trigger::Event(name), EventKind::Signal(event)) => name == event,
        (Trigger::Timer(id), EventKind::Timer { timer, .. }) => id == timer,
        _ => false,
    }
}

/// Evaluates guards over priority-sorted candidates of one level. Returns the
/// winner, or a determinism fault when two enabled candidates share the
/// lowest enabled priority.
pub fn pick_enabled(
    machine: &Machine,
    candidates: &[TransitionId],
    payload: &Value,
    ctx: &Value,
    eval: &dyn Evaluator,
) -> Result<Option<TransitionId>, EngineError> {
    let mut winner: Option<TransitionId> = None;

    for &id in candidates {
        let t = machine.transition(id);
        if let Some(w) = winner {
            if machine.transition(w).priority < t.priority {
                break;
            }
        }

        let enabled = match &t.guard {
            None => true,
            Some(guard) => {
                eval.eval_guard(guard, ctx, payload)
                    .map_err(|e| EngineError::GuardEvaluation {
                        from: machine.arena().name(t.source).to_string(),
                        target: machine.arena().name(t.target).to_string(),
                        reason: e.reason,
                    })?
            }
        };
        if !enabled {
            continue;
        }

        match winner {
            None => winner = Some(id),
            Some(w) if machine.transition(w).priority == t.priority => {
                return Err(EngineError::AmbiguousSelection {
                    state: machine.arena().name(t.source).to_string(),
                    trigger: machine.trigger_label(&t.trigger),
                });
            }
            Some(_) => break,
        }
    }

    Ok(winner)
}

/// Resolves cross-region conflicts in a merged selection: when two picked
/// transitions would exit overlapping configuration, the deeper-sourced one
/// wins. The survivors are ordered by source document order for execution.
pub fn resolve_conflicts(
    machine: &Machine,
    config: &[StateId],
    mut picked: Vec<TransitionId>,
) -> Vec<TransitionId> {
    let arena = machine.arena();
    picked.sort_by_key(|&id| {
        let t = machine.transition(id);
        (std::cmp::Reverse(arena.depth(t.source)), t.source, id)
    });

    let mut kept: Vec<TransitionId> = Vec::new();
    let mut kept_leaves: Vec<Vec<StateId>> = Vec::new();

    for id in picked {
        let t = machine.transition(id);
        let leaves = exit_leaves(machine, config, machine.transition_domain(t));
        let conflicts = !leaves.is_empty()
            && kept_leaves
                .iter()
                .any(|k| k.iter().any(|l| leaves.contains(l)));
        if !conflicts {
            kept.push(id);
            kept_leaves.push(leaves);
        }
    }

    kept.sort_by_key(|&id| (machine.transition(id).source, id));
    kept
}

/// Active leaves that transitioning through `domain` would exit.
pub fn exit_leaves(
    machine: &Machine,
    config: &[StateId],
    domain: Option<StateId>,
) -> Vec<StateId> {
    let Some(domain) = domain else {
        return Vec::new();
    };
    config
        .iter()
        .copied()
        .filter(|&leaf| leaf != domain && machine.arena().is_ancestor_or_self(domain, leaf))
        .collect()
}

/// Picks the completion transition to fire for a completed state, if any.
/// Completion transitions may carry guards; ambiguity rules match event
/// selection.
pub fn select_completion(
    machine: &Machine,
    state: StateId,
    ctx: &Value,
    eval: &dyn Evaluator,
) -> Result<Option<TransitionId>, EngineError> {
    let candidates: Vec<TransitionId> = machine
        .outgoing(state)
        .iter()
        .copied()
        .filter(|&id| machine.transition(id).trigger == Trigger::Completion)
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }
    pick_enabled(machine, &candidates, &Value::Null, ctx, eval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::ContextEvaluator;
    use serde_json::json;

    fn machine() -> Machine {
        Machine::from_json(&json!({
            "name": "m",
            "initial": "outer",
            "states": [
                {"name": "outer", "initial": "inner",
                 "states": [
                    {"name": "inner", "initial": "leaf",
                     "states": [{"name": "leaf"}]},
                    {"name": "other"}
                 ]},
                {"name": "elsewhere"}
            ],
            "transitions": [
                {"from": "outer", "event": "GO", "to": "elsewhere"},
                {"from": "inner", "event": "GO", "to": "other", "guard": "ctx.inner_enabled"},
                {"from": "leaf", "event": "ONLY_OUTER", "to": "other", "guard": "ctx.never"}
            ]
        }))
        .unwrap()
    }

    fn select(m: &Machine, event: &str, ctx: Value) -> Vec<TransitionId> {
        let leaf = m.state_named("leaf").unwrap();
        WalkSelector
            .select(m, &[leaf], &Event::named(event), &ctx, &ContextEvaluator)
            .unwrap()
    }

    #[test]
    fn test_inner_shadows_outer() {
        let m = machine();
        let picked = select(&m, "GO", json!({"inner_enabled": true}));
        assert_eq!(picked.len(), 1);
        assert_eq!(
            m.arena().name(m.transition(picked[0]).source),
            "inner"
        );
    }

    #[test]
    fn test_disabled_inner_falls_through_to_outer() {
        let m = machine();
        let picked = select(&m, "GO", json!({"inner_enabled": false}));
        assert_eq!(picked.len(), 1);
        assert_eq!(m.arena().name(m.transition(picked[0]).source), "outer");
    }

    #[test]
    fn test_no_match_selects_nothing() {
        let m = machine();
        assert!(select(&m, "UNKNOWN", json!({})).is_empty());
        // A declared but guard-false transition with no outer fallback.
        assert!(select(&m, "ONLY_OUTER", json!({})).is_empty());
    }

    #[test]
    fn test_priority_breaks_tie() {
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "a",
            "states": [{"name": "a"}, {"name": "b"}, {"name": "c"}],
            "transitions": [
                {"from": "a", "event": "GO", "to": "b", "priority": 1, "guard": "ctx.x"},
                {"from": "a", "event": "GO", "to": "c", "priority": 2, "guard": "ctx.x"}
            ]
        }))
        .unwrap();
        let a = m.state_named("a").unwrap();
        let picked = WalkSelector
            .select(
                &m,
                &[a],
                &Event::named("GO"),
                &json!({"x": true}),
                &ContextEvaluator,
            )
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(m.arena().name(m.transition(picked[0]).target), "b");
    }

    #[test]
    fn test_equal_priority_both_enabled_is_a_fault() {
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "a",
            "states": [{"name": "a"}, {"name": "b"}, {"name": "c"}],
            "transitions": [
                {"from": "a", "event": "GO", "to": "b", "guard": "ctx.x"},
                {"from": "a", "event": "GO", "to": "c", "guard": "ctx.y"}
            ]
        }))
        .unwrap();
        let a = m.state_named("a").unwrap();
        let result = WalkSelector.select(
            &m,
            &[a],
            &Event::named("GO"),
            &json!({"x": true, "y": true}),
            &ContextEvaluator,
        );
        assert!(matches!(
            result,
            Err(EngineError::AmbiguousSelection { .. })
        ));
    }

    #[test]
    fn test_guard_error_is_attributed() {
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "a",
            "states": [{"name": "a"}, {"name": "b"}],
            "transitions": [
                {"from": "a", "event": "GO", "to": "b", "guard": "ctx.v > 1"}
            ]
        }))
        .unwrap();
        let a = m.state_named("a").unwrap();
        let result = WalkSelector.select(
            &m,
            &[a],
            &Event::named("GO"),
            &json!({"v": "text"}),
            &ContextEvaluator,
        );
        match result {
            Err(EngineError::GuardEvaluation { from, .. }) => assert_eq!(from, "a"),
            other => panic!("expected guard fault, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_parallel_regions_select_independently() {
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "p",
            "states": [
                {"name": "p", "regions": [
                    {"name": "r1", "initial": "x1", "states": [{"name": "x1"}, {"name": "x2"}]},
                    {"name": "r2", "initial": "y1", "states": [{"name": "y1"}, {"name": "y2"}]}
                ]}
            ],
            "transitions": [
                {"from": "x1", "event": "STEP", "to": "x2"},
                {"from": "y1", "event": "STEP", "to": "y2"}
            ]
        }))
        .unwrap();
        let config = [m.state_named("x1").unwrap(), m.state_named("y1").unwrap()];
        let picked = WalkSelector
            .select(&m, &config, &Event::named("STEP"), &json!({}), &ContextEvaluator)
            .unwrap();
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_deeper_source_wins_cross_region_conflict() {
        // Region r1 matches inside; region r2 falls through to a transition
        // on the parallel state itself, which would exit both regions.
        let m = Machine::from_json(&json!({
            "name": "m",
            "initial": "p",
            "states": [
                {"name": "p", "regions": [
                    {"name": "r1", "initial": "x1", "states": [{"name": "x1"}, {"name": "x2"}]},
                    {"name": "r2", "initial": "y1", "states": [{"name": "y1"}]}
                ]},
                {"name": "out"}
            ],
            "transitions": [
                {"from": "x1", "event": "STEP", "to": "x2"},
                {"from": "p", "event": "STEP", "to": "out"}
            ]
        }))
        .unwrap();
        let config = [m.state_named("x1").unwrap(), m.state_named("y1").unwrap()];
        let picked = WalkSelector
            .select(&m, &config, &Event::named("STEP"), &json!({}), &ContextEvaluator)
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(m.arena().name(m.transition(picked[0]).source), "x1");
    }
}
