//! Fixed-capacity event queue.
//!
//! FIFO for external dispatch; push-to-front exists only for engine-internal
//! deferred re-injection. Overflow behavior is fixed at construction and is
//! never a silent drop.

use crate::error::EngineError;
use crate::event::Event;
use harel_model::OverflowPolicy;
use std::collections::VecDeque;

/// Bounded ring buffer of pending events for one instance.
#[derive(Debug)]
pub struct EventQueue {
    buf: VecDeque<Event>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl EventQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Remaining slots before the queue is full.
    pub fn headroom(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Enqueues at the back. A full queue raises `QueueOverflow`; under the
    /// `Fatal` policy the caller additionally poisons the instance.
    pub fn push_back(&mut self, event: Event) -> Result<(), EngineError> {
        if self.buf.len() >= self.capacity {
            return Err(EngineError::QueueOverflow {
                capacity: self.capacity,
            });
        }
        self.buf.push_back(event);
        Ok(())
    }

    /// Enqueues at the front. Reserved for deferred re-injection; the same
    /// overflow rules apply.
    pub fn push_front(&mut self, event: Event) -> Result<(), EngineError> {
        if self.buf.len() >= self.capacity {
            return Err(EngineError::QueueOverflow {
                capacity: self.capacity,
            });
        }
        self.buf.push_front(event);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Event> {
        self.buf.pop_front()
    }

    /// Read-only view of pending events, front first.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.buf.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn test_fifo_order() {
        let mut q = EventQueue::new(4, OverflowPolicy::Reject);
        q.push_back(Event::named("A")).unwrap();
        q.push_back(Event::named("B")).unwrap();
        assert_eq!(q.pop_front().unwrap().signal_name(), Some("A"));
        assert_eq!(q.pop_front().unwrap().signal_name(), Some("B"));
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_push_front_precedes_queued() {
        let mut q = EventQueue::new(4, OverflowPolicy::Reject);
        q.push_back(Event::named("B")).unwrap();
        q.push_front(Event::named("A")).unwrap();
        assert_eq!(q.pop_front().unwrap().signal_name(), Some("A"));
        assert_eq!(q.pop_front().unwrap().signal_name(), Some("B"));
    }

    #[test]
    fn test_overflow_reports_capacity() {
        let mut q = EventQueue::new(2, OverflowPolicy::Reject);
        q.push_back(Event::named("A")).unwrap();
        q.push_back(Event::named("B")).unwrap();
        let err = q.push_back(Event::named("C")).unwrap_err();
        assert!(matches!(err, EngineError::QueueOverflow { capacity: 2 }));
        // Nothing was dropped.
        assert_eq!(q.len(), 2);
    }
}
