//! Raw machine definition as parsed from JSON.
//!
//! Definitions use a JSON DSL with nested states:
//!
//! ```json
//! {
//!   "name": "player",
//!   "initial": "idle",
//!   "states": [
//!     {"name": "idle"},
//!     {"name": "busy",
//!      "initial": "loading",
//!      "defer": ["CONFIG"],
//!      "timers": [{"name": "t_poll", "after_ms": 100, "periodic": true}],
//!      "states": [
//!        {"name": "loading"},
//!        {"name": "h", "kind": "deep_history", "default": "loading"},
//!        {"name": "done", "kind": "final"}
//!      ]}
//!   ],
//!   "transitions": [
//!     {"from": "idle", "event": "PLAY", "to": "busy", "guard": "ctx.ready"},
//!     {"from": "busy", "completion": true, "to": "idle"}
//!   ]
//! }
//! ```
//!
//! State names are globally unique. A transition trigger is exactly one of
//! `event`, `timer`, or `completion: true`.

use serde::{Deserialize, Serialize};

/// Queue overflow behavior, fixed at machine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Reject the offending event with a fault; the queue is unchanged.
    #[default]
    Reject,
    /// Poison the instance; every later operation fails.
    Fatal,
}

/// Transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// Exits the source even when the target is the source or nested in it.
    #[default]
    External,
    /// Stays inside the source composite; only descendants are exited.
    Local,
    /// Actions only, no exit or entry at all.
    Internal,
}

/// Explicit state kinds in the DSL. Composite/parallel are inferred from
/// the presence of `states`/`regions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStateKind {
    Final,
    ShallowHistory,
    DeepHistory,
}

/// A state declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawState {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RawStateKind>,

    /// Default target for history pseudostates. Mandatory for them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Children (makes this state a composite).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<RawState>,

    /// Orthogonal regions (makes this state parallel).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<RawRegion>,

    /// Default-initial child name for composites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit: Vec<String>,

    /// Event names deferred while this state is active.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defer: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timers: Vec<RawTimer>,
}

/// One region of a parallel state. A region is a composite in its own right.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRegion {
    pub name: String,
    pub initial: String,
    pub states: Vec<RawState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defer: Vec<String>,
}

/// A timer owned by its declaring state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTimer {
    pub name: String,
    pub after_ms: u64,

    #[serde(default)]
    pub periodic: bool,
}

/// A transition declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransition {
    pub from: String,
    pub to: String,

    /// External event name trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    /// Timer name trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<String>,

    /// Completion trigger: fires when the source state is done.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub completion: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    /// Lower value means higher precedence.
    #[serde(default)]
    pub priority: u32,

    #[serde(default)]
    pub kind: TransitionKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

/// Raw machine definition as stored/transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMachine {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: u32,

    pub initial: String,
    pub states: Vec<RawState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<RawTransition>,

    /// Event queue capacity per instance.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Completion cascade bound per instance.
    #[serde(default = "default_cascade_limit")]
    pub cascade_limit: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

fn default_version() -> u32 {
    1
}

fn default_queue_capacity() -> usize {
    16
}

fn default_cascade_limit() -> u32 {
    8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal() {
        let raw: RawMachine = serde_json::from_value(json!({
            "name": "toggle",
            "initial": "off",
            "states": [{"name": "off"}, {"name": "on"}],
            "transitions": [
                {"from": "off", "event": "FLIP", "to": "on"},
                {"from": "on", "event": "FLIP", "to": "off"}
            ]
        }))
        .unwrap();

        assert_eq!(raw.name, "toggle");
        assert_eq!(raw.version, 1);
        assert_eq!(raw.queue_capacity, 16);
        assert_eq!(raw.overflow, OverflowPolicy::Reject);
        assert_eq!(raw.transitions.len(), 2);
        assert_eq!(raw.transitions[0].kind, TransitionKind::External);
    }

    #[test]
    fn test_parse_nested_and_parallel() {
        let raw: RawMachine = serde_json::from_value(json!({
            "name": "m",
            "initial": "p",
            "overflow": "fatal",
            "states": [
                {"name": "p", "regions": [
                    {"name": "r1", "initial": "x", "states": [{"name": "x"}]},
                    {"name": "r2", "initial": "y", "states": [{"name": "y"}]}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(raw.overflow, OverflowPolicy::Fatal);
        assert_eq!(raw.states[0].regions.len(), 2);
    }

    #[test]
    fn test_parse_history_and_timer() {
        let raw: RawMachine = serde_json::from_value(json!({
            "name": "m",
            "initial": "c",
            "states": [
                {"name": "c", "initial": "c1",
                 "timers": [{"name": "t", "after_ms": 0}],
                 "states": [
                    {"name": "c1"},
                    {"name": "h", "kind": "shallow_history", "default": "c1"}
                 ]}
            ],
            "transitions": [
                {"from": "c", "timer": "t", "to": "c", "kind": "internal"}
            ]
        }))
        .unwrap();

        let c = &raw.states[0];
        assert_eq!(c.timers[0].after_ms, 0);
        assert!(!c.timers[0].periodic);
        assert_eq!(c.states[1].kind, Some(RawStateKind::ShallowHistory));
        assert!(raw.transitions[0].timer.is_some());
    }

    #[test]
    fn test_roundtrip_stable() {
        let doc = json!({
            "name": "toggle",
            "initial": "off",
            "states": [{"name": "off"}, {"name": "on"}],
            "transitions": [{"from": "off", "event": "FLIP", "to": "on"}]
        });
        let raw: RawMachine = serde_json::from_value(doc).unwrap();
        let back = serde_json::to_value(&raw).unwrap();
        let again: RawMachine = serde_json::from_value(back).unwrap();
        assert_eq!(again.name, raw.name);
        assert_eq!(again.transitions.len(), raw.transitions.len());
    }
}
