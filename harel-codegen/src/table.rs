//! Precomputed flat dispatch tables.
//!
//! The table strategy trades memory for dispatch speed: for every
//! (state, trigger) pair it precomputes the chain of candidate transition
//! lists the ancestor walk would visit, innermost level first. Selection at
//! runtime then reuses the exact same enabling, tie-break, and conflict
//! logic as the walk, so the two strategies cannot diverge on any input.

use crate::error::CodegenError;
use harel_engine::selector::{match_level, pick_enabled, resolve_conflicts};
use harel_engine::{EngineError, Event, EventKind, Evaluator, Selector};
use harel_model::{Machine, StateId, TimerId, TransitionId};
use serde_json::Value;
use std::collections::HashMap;

/// Default ceiling on precomputed rows before falling back to the walk.
pub const DEFAULT_TABLE_ROW_LIMIT: usize = 4096;

/// Which dispatch strategy an instance should run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Walk,
    Table,
}

/// Picks a strategy from the machine's table footprint.
pub fn choose_strategy(machine: &Machine, row_limit: usize) -> Strategy {
    if DispatchTable::row_count(machine) <= row_limit {
        Strategy::Table
    } else {
        Strategy::Walk
    }
}

/// Builds the selector matching [`choose_strategy`] with the default limit.
pub fn selector_for(machine: &Machine) -> Box<dyn Selector> {
    match choose_strategy(machine, DEFAULT_TABLE_ROW_LIMIT) {
        Strategy::Walk => Box::new(harel_engine::WalkSelector),
        Strategy::Table => Box::new(TableSelector::build(machine)),
    }
}

/// Trigger column index: external events first, then timers. Completion
/// transitions are not dispatched through tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TriggerKey {
    Event(usize),
    Timer(TimerId),
}

/// Candidate level chains per (state, trigger).
#[derive(Debug, Clone)]
pub struct DispatchTable {
    events: HashMap<String, usize>,
    /// `chains[state][key]` = candidate lists per ancestor level,
    /// innermost first, each list priority-sorted.
    chains: HashMap<(StateId, TriggerKey), Vec<Vec<TransitionId>>>,
}

impl DispatchTable {
    /// Rows the table for `machine` would hold.
    pub fn row_count(machine: &Machine) -> usize {
        let columns = machine.caps.event_alphabet.len() + machine.timers().len();
        machine.arena().iter().count() * columns
    }

    pub fn build(machine: &Machine) -> Self {
        let events: HashMap<String, usize> = machine
            .caps
            .event_alphabet
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut keys: Vec<(TriggerKey, EventKind)> = machine
            .caps
            .event_alphabet
            .iter()
            .enumerate()
            .map(|(i, name)| (TriggerKey::Event(i), EventKind::Signal(name.clone())))
            .collect();
        for timer in machine.timers() {
            keys.push((
                TriggerKey::Timer(timer.id),
                EventKind::Timer {
                    timer: timer.id,
                    generation: 0,
                },
            ));
        }

        let mut chains = HashMap::new();
        for node in machine.arena().iter() {
            for (key, kind) in &keys {
                let mut chain: Vec<Vec<TransitionId>> = Vec::new();
                for level in machine.arena().ancestors_and_self(node.id) {
                    let candidates = match_level(machine, level, kind);
                    if !candidates.is_empty() {
                        chain.push(candidates);
                    }
                }
                if !chain.is_empty() {
                    chains.insert((node.id, *key), chain);
                }
            }
        }

        tracing::debug!(
            machine = %machine.name,
            rows = Self::row_count(machine),
            populated = chains.len(),
            "dispatch table built"
        );
        Self { events, chains }
    }

    fn key_for(&self, kind: &EventKind) -> Option<TriggerKey> {
        match kind {
            EventKind::Signal(name) => self.events.get(name).copied().map(TriggerKey::Event),
            EventKind::Timer { timer, .. } => Some(TriggerKey::Timer(*timer)),
        }
    }

    fn chain(&self, leaf: StateId, key: TriggerKey) -> &[Vec<TransitionId>] {
        self.chains
            .get(&(leaf, key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Table-driven strategy; behaviorally identical to the walk.
#[derive(Debug, Clone)]
pub struct TableSelector {
    table: DispatchTable,
}

impl TableSelector {
    pub fn build(machine: &Machine) -> Self {
        Self {
            table: DispatchTable::build(machine),
        }
    }

    /// Builds the table only if it fits the row limit.
    pub fn build_bounded(machine: &Machine, row_limit: usize) -> Result<Self, CodegenError> {
        let rows = DispatchTable::row_count(machine);
        if rows > row_limit {
            return Err(CodegenError::TableTooLarge {
                rows,
                limit: row_limit,
            });
        }
        Ok(Self::build(machine))
    }
}

impl Selector for TableSelector {
    fn select(
        &self,
        machine: &Machine,
        config: &[StateId],
        event: &Event,
        ctx: &Value,
        eval: &dyn Evaluator,
    ) -> Result<Vec<TransitionId>, EngineError> {
        let mut picked: Vec<TransitionId> = Vec::new();

        if let Some(key) = self.table.key_for(&event.kind) {
            for &leaf in config {
                for candidates in self.table.chain(leaf, key) {
                    if let Some(t) = pick_enabled(machine, candidates, &event.payload, ctx, eval)? {
                        if !picked.contains(&t) {
                            picked.push(t);
                        }
                        break;
                    }
                    // A disabled inner level falls through to the next.
                }
            }
        }

        Ok(resolve_conflicts(machine, config, picked))
    }
}
