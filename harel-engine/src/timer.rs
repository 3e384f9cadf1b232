//! Per-instance timer scheduling.
//!
//! Timers run on a logical millisecond clock advanced by the caller. A timer
//! is armed when its owning state is entered and cancelled when the owner is
//! exited; cancellation bumps a per-timer generation token so that an already
//! enqueued firing is recognized as stale at dequeue and discarded.

use crate::event::Event;
use harel_model::{Machine, StateId, TimerId};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct ArmedTimer {
    deadline: u64,
    interval: u64,
    periodic: bool,
    generation: u64,
}

/// Armed timers and the logical clock for one instance.
#[derive(Debug, Clone, Default)]
pub struct TimerScheduler {
    armed: BTreeMap<TimerId, ArmedTimer>,
    generations: BTreeMap<TimerId, u64>,
    now_ms: u64,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Arms every timer declared on `state`. A zero delay is due at the very
    /// next evaluation.
    pub fn arm_for(&mut self, machine: &Machine, state: StateId) {
        for &id in machine.timers_of(state) {
            let def = machine.timer(id);
            let generation = *self.generations.entry(id).or_insert(0);
            self.armed.insert(
                id,
                ArmedTimer {
                    deadline: self.now_ms + def.after_ms,
                    interval: def.after_ms,
                    periodic: def.periodic,
                    generation,
                },
            );
        }
    }

    /// Cancels every timer declared on `state` and invalidates any firing
    /// already queued for it.
    pub fn cancel_for(&mut self, machine: &Machine, state: StateId) {
        for &id in machine.timers_of(state) {
            self.armed.remove(&id);
            *self.generations.entry(id).or_insert(0) += 1;
        }
    }

    /// Advances the logical clock.
    pub fn advance(&mut self, delta_ms: u64) {
        self.now_ms += delta_ms;
    }

    /// Counts the firings `take_due` would produce, without taking them.
    pub fn due_count(&self) -> usize {
        let now = self.now_ms;
        let mut count = 0;
        for armed in self.armed.values() {
            if armed.periodic {
                if armed.deadline <= now {
                    count += ((now - armed.deadline) / armed.interval + 1) as usize;
                }
            } else if armed.deadline <= now {
                count += 1;
            }
        }
        count
    }

    /// Collects firings for every due timer, re-arming periodic ones. A
    /// periodic timer fires once per elapsed interval. Firing order is by
    /// deadline, then timer id, so it is deterministic.
    pub fn take_due(&mut self) -> Vec<Event> {
        let now = self.now_ms;
        let mut due: Vec<(u64, TimerId, u64)> = Vec::new();
        let mut disarm: Vec<TimerId> = Vec::new();

        for (&id, armed) in self.armed.iter_mut() {
            if armed.periodic {
                // Interval is validated non-zero for periodic timers.
                while armed.deadline <= now {
                    due.push((armed.deadline, id, armed.generation));
                    armed.deadline += armed.interval;
                }
            } else if armed.deadline <= now {
                due.push((armed.deadline, id, armed.generation));
                disarm.push(id);
            }
        }
        for id in disarm {
            self.armed.remove(&id);
        }

        due.sort_by_key(|&(deadline, id, _)| (deadline, id));
        due.into_iter()
            .map(|(_, id, generation)| Event::timer(id, generation))
            .collect()
    }

    /// True if a queued firing no longer matches the timer's generation.
    pub fn is_stale(&self, timer: TimerId, generation: u64) -> bool {
        self.generations.get(&timer).copied().unwrap_or(0) != generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    fn machine() -> Machine {
        Machine::from_json(&json!({
            "name": "m",
            "initial": "a",
            "states": [
                {"name": "a", "timers": [
                    {"name": "once", "after_ms": 10},
                    {"name": "tick", "after_ms": 5, "periodic": true},
                    {"name": "zero", "after_ms": 0}
                ]}
            ]
        }))
        .unwrap()
    }

    fn timer_id(m: &Machine, name: &str) -> TimerId {
        m.timers().iter().find(|t| t.name == name).unwrap().id
    }

    #[test]
    fn test_zero_delay_due_immediately() {
        let m = machine();
        let mut s = TimerScheduler::new();
        s.arm_for(&m, m.state_named("a").unwrap());

        let due = s.take_due();
        let zero = timer_id(&m, "zero");
        assert!(due
            .iter()
            .any(|e| matches!(e.kind, EventKind::Timer { timer, .. } if timer == zero)));
    }

    #[test]
    fn test_one_shot_fires_once() {
        let m = machine();
        let mut s = TimerScheduler::new();
        s.arm_for(&m, m.state_named("a").unwrap());

        s.advance(10);
        let once = timer_id(&m, "once");
        let first: Vec<_> = s
            .take_due()
            .into_iter()
            .filter(|e| matches!(e.kind, EventKind::Timer { timer, .. } if timer == once))
            .collect();
        assert_eq!(first.len(), 1);

        s.advance(100);
        let second: Vec<_> = s
            .take_due()
            .into_iter()
            .filter(|e| matches!(e.kind, EventKind::Timer { timer, .. } if timer == once))
            .collect();
        assert!(second.is_empty());
    }

    #[test]
    fn test_periodic_fires_per_elapsed_interval() {
        let m = machine();
        let mut s = TimerScheduler::new();
        s.arm_for(&m, m.state_named("a").unwrap());

        s.advance(15);
        let tick = timer_id(&m, "tick");
        let fired: Vec<_> = s
            .take_due()
            .into_iter()
            .filter(|e| matches!(e.kind, EventKind::Timer { timer, .. } if timer == tick))
            .collect();
        // Due at 5, 10, 15.
        assert_eq!(fired.len(), 3);
    }

    #[test]
    fn test_due_count_matches_take_due() {
        let m = machine();
        let mut s = TimerScheduler::new();
        s.arm_for(&m, m.state_named("a").unwrap());

        s.advance(15);
        let counted = s.due_count();
        assert_eq!(counted, s.take_due().len());
        assert_eq!(s.due_count(), 0);
    }

    #[test]
    fn test_cancel_invalidates_queued_firing() {
        let m = machine();
        let a = m.state_named("a").unwrap();
        let mut s = TimerScheduler::new();
        s.arm_for(&m, a);
        s.advance(10);

        let due = s.take_due();
        let once = timer_id(&m, "once");
        let (timer, generation) = due
            .iter()
            .find_map(|e| match e.kind {
                EventKind::Timer { timer, generation } if timer == once => {
                    Some((timer, generation))
                }
                _ => None,
            })
            .unwrap();
        assert!(!s.is_stale(timer, generation));

        // Exiting the owner makes the queued firing stale.
        s.cancel_for(&m, a);
        assert!(s.is_stale(timer, generation));

        // Re-entry arms a fresh generation.
        s.arm_for(&m, a);
        assert!(s.is_stale(timer, generation));
    }
}
