//! Events dispatched into a machine instance.

use harel_model::TimerId;
use serde_json::Value;

/// What kind of occurrence an event is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// External named event.
    Signal(String),
    /// Synthetic firing of a declared timer. The generation token is checked
    /// at dequeue; a stale firing is discarded without effect.
    Timer { timer: TimerId, generation: u64 },
}

/// One queued event with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
}

impl Event {
    /// An external event with a JSON payload.
    pub fn signal(name: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EventKind::Signal(name.into()),
            payload,
        }
    }

    /// An external event without payload.
    pub fn named(name: impl Into<String>) -> Self {
        Self::signal(name, Value::Null)
    }

    pub(crate) fn timer(timer: TimerId, generation: u64) -> Self {
        Self {
            kind: EventKind::Timer { timer, generation },
            payload: Value::Null,
        }
    }

    /// The external event name, if this is a signal.
    pub fn signal_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Signal(name) => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_constructors() {
        let e = Event::signal("PAY", json!({"amount": 10}));
        assert_eq!(e.signal_name(), Some("PAY"));
        assert_eq!(e.payload["amount"], 10);

        let e = Event::named("GO");
        assert_eq!(e.payload, Value::Null);
    }

    #[test]
    fn test_timer_event_is_not_a_signal() {
        let e = Event::timer(TimerId(0), 3);
        assert_eq!(e.signal_name(), None);
        assert_eq!(
            e.kind,
            EventKind::Timer {
                timer: TimerId(0),
                generation: 3
            }
        );
    }
}
