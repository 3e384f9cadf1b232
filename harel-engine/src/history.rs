//! History records per pseudostate.
//!
//! Recording happens exactly when a composite owning a history pseudostate
//! is exited; restoration happens when a transition targets the pseudostate.

use harel_model::{Machine, StateId, StateKind};
use std::collections::BTreeMap;

/// Recorded descendant configuration at last exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryRecord {
    /// Active direct child of the owning composite.
    Shallow(StateId),
    /// Active leaf per region under the owning composite.
    Deep(Vec<StateId>),
}

/// Per-instance store of history records, keyed by pseudostate id.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    records: BTreeMap<StateId, HistoryRecord>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the configuration under `composite` for its history
    /// pseudostate. `leaves` is the active configuration being exited.
    pub fn record(&mut self, machine: &Machine, composite: StateId, leaves: &[StateId]) {
        let Some(history) = machine.node(composite).history else {
            return;
        };
        let arena = machine.arena();

        let record = match machine.node(history).kind {
            StateKind::ShallowHistory => {
                let child = machine
                    .node(composite)
                    .children
                    .iter()
                    .copied()
                    .find(|&c| leaves.iter().any(|&l| arena.is_ancestor_or_self(c, l)));
                match child {
                    Some(child) => HistoryRecord::Shallow(child),
                    None => return,
                }
            }
            StateKind::DeepHistory => {
                let inner: Vec<StateId> = leaves
                    .iter()
                    .copied()
                    .filter(|&l| l != composite && arena.is_ancestor_or_self(composite, l))
                    .collect();
                if inner.is_empty() {
                    return;
                }
                HistoryRecord::Deep(inner)
            }
            _ => return,
        };

        self.records.insert(history, record);
    }

    pub fn get(&self, history: StateId) -> Option<&HistoryRecord> {
        self.records.get(&history)
    }

    /// Read-only view of all records, for introspection.
    pub fn iter(&self) -> impl Iterator<Item = (StateId, &HistoryRecord)> {
        self.records.iter().map(|(&id, record)| (id, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine() -> Machine {
        Machine::from_json(&json!({
            "name": "m",
            "initial": "c",
            "states": [
                {"name": "c", "initial": "inner",
                 "states": [
                    {"name": "inner", "initial": "i1",
                     "states": [{"name": "i1"}, {"name": "i2"}]},
                    {"name": "h", "kind": "shallow_history", "default": "inner"}
                 ]}
            ],
            "transitions": [
                {"from": "i1", "event": "GO", "to": "i2"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_shallow_records_direct_child() {
        let m = machine();
        let c = m.state_named("c").unwrap();
        let i2 = m.state_named("i2").unwrap();
        let h = m.state_named("h").unwrap();

        let mut store = HistoryStore::new();
        store.record(&m, c, &[i2]);
        assert_eq!(
            store.get(h),
            Some(&HistoryRecord::Shallow(m.state_named("inner").unwrap()))
        );
    }

    #[test]
    fn test_no_record_without_history_child() {
        let m = machine();
        let inner = m.state_named("inner").unwrap();
        let i1 = m.state_named("i1").unwrap();

        let mut store = HistoryStore::new();
        store.record(&m, inner, &[i1]);
        assert_eq!(store.iter().count(), 0);
    }
}
