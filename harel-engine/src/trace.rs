//! Ordered side-effect trace of an RTC run.
//!
//! Traces are the observable output the cross-strategy equivalence contract
//! is stated over: identical models and event sequences must produce
//! identical traces regardless of dispatch strategy.

use serde::Serialize;

/// One observable step effect. State and event names are resolved to strings
/// so traces are stable across model rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    /// An event was taken from the queue for processing.
    Dispatched { event: String },
    Exited { state: String },
    Entered { state: String },
    Action { name: String },
    /// A transition fired.
    Fired {
        source: String,
        target: String,
        trigger: String,
    },
    /// The event was parked; `state` is the deferring owner.
    Deferred { event: String, state: String },
    /// No transition matched and nothing deferred the event.
    Dropped { event: String },
    /// A composite reached completion.
    Completed { state: String },
    TimerFired { timer: String },
    StaleTimerDiscarded { timer: String },
}

/// Trace and resulting configuration of one `init`/`dispatch`/`advance_clock`
/// call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    /// Active leaf state names, in document order.
    pub configuration: Vec<String>,
    pub trace: Vec<TraceEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_serializes_tagged() {
        let json = serde_json::to_value(TraceEvent::Fired {
            source: "a".into(),
            target: "b".into(),
            trigger: "GO".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "fired");
        assert_eq!(json["source"], "a");
    }
}
