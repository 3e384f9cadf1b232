//! Machine instance: the run-to-completion engine.
//!
//! One instance owns all mutable execution state for one machine: active
//! configuration, history records, deferred events, armed timers, the event
//! queue, the completion cascade counter, and the context value. Nothing here
//! is shared across instances.
//!
//! A step is a phase machine:
//! `Idle -> Dequeue -> Select -> Exit -> HistoryStore -> ActionsOnTransition
//! -> Entry -> CompletionCheck -> (Idle | Dequeue)`.

use crate::deferral::DeferredPool;
use crate::error::EngineError;
use crate::eval::{ContextEvaluator, Evaluator};
use crate::event::{Event, EventKind};
use crate::history::{HistoryRecord, HistoryStore};
use crate::queue::EventQueue;
use crate::selector::{self, Selector, WalkSelector};
use crate::timer::TimerScheduler;
use crate::trace::{StepOutcome, TraceEvent};
use harel_model::{Machine, OverflowPolicy, StateId, StateKind, TransitionId};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// RTC engine phase, exposed for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Dequeue,
    Select,
    Exit,
    HistoryStore,
    ActionsOnTransition,
    Entry,
    CompletionCheck,
}

/// One executable instance of a machine.
pub struct MachineInstance {
    id: String,
    machine: Arc<Machine>,
    selector: Box<dyn Selector>,
    evaluator: Box<dyn Evaluator>,
    /// Active leaf states, kept in document order.
    config: Vec<StateId>,
    /// Completed composites/regions; parallel completion AND-reduces its
    /// regions' membership here.
    done: BTreeSet<StateId>,
    history: HistoryStore,
    deferred: DeferredPool,
    timers: TimerScheduler,
    queue: EventQueue,
    ctx: Value,
    phase: Phase,
    cascade: u32,
    poisoned: Option<String>,
    initialized: bool,
    trace: Vec<TraceEvent>,
}

impl MachineInstance {
    pub fn new(id: impl Into<String>, machine: Arc<Machine>, initial_ctx: Value) -> Self {
        let queue = EventQueue::new(machine.caps.queue_capacity, machine.caps.overflow);
        Self {
            id: id.into(),
            machine,
            selector: Box::new(WalkSelector),
            evaluator: Box::new(ContextEvaluator),
            config: Vec::new(),
            done: BTreeSet::new(),
            history: HistoryStore::new(),
            deferred: DeferredPool::new(),
            timers: TimerScheduler::new(),
            queue,
            ctx: initial_ctx,
            phase: Phase::Idle,
            cascade: 0,
            poisoned: None,
            initialized: false,
            trace: Vec::new(),
        }
    }

    /// Replaces the dispatch strategy. Both strategies are behaviorally
    /// equivalent; this exists for footprint choice and differential testing.
    pub fn with_selector(mut self, selector: Box<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ctx(&self) -> &Value {
        &self.ctx
    }

    /// Active leaf names, in document order.
    pub fn configuration(&self) -> Vec<String> {
        self.config
            .iter()
            .map(|&id| self.machine.arena().name(id).to_string())
            .collect()
    }

    /// Pending events, front first.
    pub fn queued_events(&self) -> Vec<String> {
        self.queue.iter().map(|e| self.event_label(e)).collect()
    }

    /// Recorded history per pseudostate name.
    pub fn history_records(&self) -> Vec<(String, Vec<String>)> {
        let arena = self.machine.arena();
        self.history
            .iter()
            .map(|(id, record)| {
                let leaves = match record {
                    HistoryRecord::Shallow(child) => vec![arena.name(*child).to_string()],
                    HistoryRecord::Deep(leaves) => {
                        leaves.iter().map(|&l| arena.name(l).to_string()).collect()
                    }
                };
                (arena.name(id).to_string(), leaves)
            })
            .collect()
    }

    /// Enters the default-initial configuration from the root.
    pub fn init(&mut self) -> Result<StepOutcome, EngineError> {
        self.ensure_live()?;
        if self.initialized {
            return Err(EngineError::AlreadyInitialized);
        }
        self.initialized = true;
        self.trace.clear();

        self.phase = Phase::Entry;
        let targets = BTreeSet::new();
        self.enter_children(self.machine.root(), &targets, &Value::Null)?;
        self.config.sort();

        self.phase = Phase::CompletionCheck;
        self.cascade = 0;
        self.completion_cascade()?;

        self.phase = Phase::Idle;
        Ok(self.outcome())
    }

    /// Enqueues one external event and runs to quiescence.
    pub fn dispatch(&mut self, event: Event) -> Result<StepOutcome, EngineError> {
        self.ensure_live()?;
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        self.trace.clear();
        self.enqueue(event)?;
        self.drain()?;
        Ok(self.outcome())
    }

    /// Advances the logical clock, expiring due timers and running to
    /// quiescence.
    pub fn advance_clock(&mut self, delta_ms: u64) -> Result<StepOutcome, EngineError> {
        self.ensure_live()?;
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        self.trace.clear();
        self.timers.advance(delta_ms);
        self.deliver_due()?;
        self.drain()?;
        Ok(self.outcome())
    }

    // =========================================================================
    // Step machinery
    // =========================================================================

    fn ensure_live(&self) -> Result<(), EngineError> {
        match &self.poisoned {
            Some(reason) => Err(EngineError::InstancePoisoned {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn poison(&mut self, reason: &str) {
        tracing::warn!(instance = %self.id, %reason, "instance poisoned");
        self.poisoned = Some(reason.to_string());
    }

    fn enqueue(&mut self, event: Event) -> Result<(), EngineError> {
        match self.queue.push_back(event) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.queue.policy() == OverflowPolicy::Fatal {
                    self.poison("queue overflow under fatal policy");
                }
                Err(e)
            }
        }
    }

    /// Moves due timer firings into the queue. Headroom is checked up front
    /// so an overflow leaves the whole batch armed instead of dropping its
    /// tail; under `reject` the firings are redelivered once the queue has
    /// room.
    fn deliver_due(&mut self) -> Result<bool, EngineError> {
        let pending = self.timers.due_count();
        if pending == 0 {
            return Ok(false);
        }
        if pending > self.queue.headroom() {
            if self.queue.policy() == OverflowPolicy::Fatal {
                self.poison("queue overflow under fatal policy");
            }
            return Err(EngineError::QueueOverflow {
                capacity: self.queue.capacity(),
            });
        }
        for event in self.timers.take_due() {
            self.queue.push_back(event)?;
        }
        Ok(true)
    }

    /// Runs RTC steps until the queue is empty. Zero-delay timers armed
    /// during a step become due before quiescence is declared.
    fn drain(&mut self) -> Result<(), EngineError> {
        loop {
            self.phase = Phase::Dequeue;
            let event = match self.queue.pop_front() {
                Some(event) => event,
                None => {
                    if !self.deliver_due()? {
                        break;
                    }
                    continue;
                }
            };
            self.cascade = 0;
            self.step(event)?;
        }
        self.phase = Phase::Idle;
        Ok(())
    }

    /// One run-to-completion step for one dequeued event.
    fn step(&mut self, event: Event) -> Result<(), EngineError> {
        match &event.kind {
            EventKind::Timer { timer, generation } => {
                let name = self.machine.timer(*timer).name.clone();
                if self.timers.is_stale(*timer, *generation) {
                    self.trace.push(TraceEvent::StaleTimerDiscarded { timer: name });
                    return Ok(());
                }
                self.trace.push(TraceEvent::TimerFired { timer: name });
            }
            EventKind::Signal(name) => {
                self.trace.push(TraceEvent::Dispatched {
                    event: name.clone(),
                });
            }
        }

        self.phase = Phase::Select;
        let picked =
            self.selector
                .select(&self.machine, &self.config, &event, &self.ctx, self.evaluator.as_ref())?;

        if picked.is_empty() {
            if let Some(name) = event.signal_name() {
                if let Some(owner) = self.deferring_state(name) {
                    self.trace.push(TraceEvent::Deferred {
                        event: name.to_string(),
                        state: self.machine.arena().name(owner).to_string(),
                    });
                    self.deferred.defer(owner, event);
                    return Ok(());
                }
            }
            self.trace.push(TraceEvent::Dropped {
                event: self.event_label(&event),
            });
            return Ok(());
        }

        self.fire_transitions(&picked, &event.payload)?;

        self.phase = Phase::CompletionCheck;
        self.completion_cascade()?;
        Ok(())
    }

    /// Executes a conflict-free transition set: exit, history store,
    /// transition actions, entry.
    fn fire_transitions(
        &mut self,
        picked: &[TransitionId],
        payload: &Value,
    ) -> Result<(), EngineError> {
        let machine = Arc::clone(&self.machine);
        let arena = machine.arena();

        // Exit set: every active state strictly below any transition domain,
        // innermost first.
        self.phase = Phase::Exit;
        let mut exit_set: Vec<StateId> = Vec::new();
        for &tid in picked {
            let t = machine.transition(tid);
            let Some(domain) = machine.transition_domain(t) else {
                continue;
            };
            for &leaf in &self.config {
                if leaf == domain || !arena.is_ancestor_or_self(domain, leaf) {
                    continue;
                }
                for a in arena.ancestors_and_self(leaf) {
                    if a == domain {
                        break;
                    }
                    if !exit_set.contains(&a) {
                        exit_set.push(a);
                    }
                }
            }
        }
        exit_set.sort_by_key(|&s| (std::cmp::Reverse(arena.depth(s)), std::cmp::Reverse(s)));

        for &s in &exit_set {
            self.trace.push(TraceEvent::Exited {
                state: arena.name(s).to_string(),
            });
            for action in machine.node(s).exit_actions.clone() {
                self.run_action(&action, payload)?;
            }
        }

        // Record history while the exiting configuration is still intact.
        self.phase = Phase::HistoryStore;
        for &s in &exit_set {
            if machine.node(s).history.is_some() {
                self.history.record(&machine, s, &self.config);
            }
        }

        // Timer cancellation and completion-marker cleanup belong to the
        // same step's exit.
        for &s in &exit_set {
            self.timers.cancel_for(&machine, s);
            self.done.remove(&s);
            if machine.node(s).kind == StateKind::Final {
                for a in arena.ancestors_and_self(s).skip(1) {
                    self.done.remove(&a);
                }
            }
        }
        self.config.retain(|l| !exit_set.contains(l));

        // Deferred events owned by exited states go to the queue front in
        // their original relative order.
        let released = self.deferred.release(&exit_set);
        for event in released.into_iter().rev() {
            if let Err(e) = self.queue.push_front(event) {
                // The exit already mutated the configuration; fail stop.
                self.poison("queue overflow during deferred re-injection");
                return Err(e);
            }
        }

        self.phase = Phase::ActionsOnTransition;
        for &tid in picked {
            let t = machine.transition(tid);
            self.trace.push(TraceEvent::Fired {
                source: arena.name(t.source).to_string(),
                target: arena.name(t.target).to_string(),
                trigger: machine.trigger_label(&t.trigger),
            });
            for action in t.actions.clone() {
                self.run_action(&action, payload)?;
            }
        }

        self.phase = Phase::Entry;
        for &tid in picked {
            let t = machine.transition(tid);
            let Some(domain) = machine.transition_domain(t) else {
                continue;
            };
            let targets = self.resolve_targets(t.target);
            self.enter_children(domain, &targets, payload)?;
        }
        self.config.sort();
        self.config.dedup();

        Ok(())
    }

    /// Resolves a transition target to the set of states entry should steer
    /// toward, expanding history pseudostates.
    fn resolve_targets(&self, target: StateId) -> BTreeSet<StateId> {
        let node = self.machine.node(target);
        let mut targets = BTreeSet::new();
        match node.kind {
            StateKind::ShallowHistory | StateKind::DeepHistory => {
                match self.history.get(target) {
                    Some(HistoryRecord::Shallow(child)) => {
                        targets.insert(*child);
                    }
                    Some(HistoryRecord::Deep(leaves)) => {
                        targets.extend(leaves.iter().copied());
                    }
                    None => {
                        // Mandatory default, validated at construction.
                        if let Some(default) = node.history_default {
                            targets.insert(default);
                        }
                    }
                }
            }
            _ => {
                targets.insert(target);
            }
        }
        targets
    }

    /// Enters the relevant children of `parent`, steering toward `targets`
    /// and applying default-initial entry wherever no target constrains the
    /// path. Entry order is outermost first.
    fn enter_children(
        &mut self,
        parent: StateId,
        targets: &BTreeSet<StateId>,
        payload: &Value,
    ) -> Result<(), EngineError> {
        let machine = Arc::clone(&self.machine);
        let node = machine.node(parent);
        match node.kind {
            StateKind::Composite => {
                let arena = machine.arena();
                let child = node
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| machine.node(c).kind.is_activatable())
                    .find(|&c| targets.iter().any(|&t| arena.is_ancestor_or_self(c, t)))
                    .or(node.initial);
                if let Some(child) = child {
                    self.enter_node(child, targets, payload)?;
                }
            }
            StateKind::Parallel => {
                for child in node.children.clone() {
                    self.enter_node(child, targets, payload)?;
                }
            }
            StateKind::Simple | StateKind::Final => {}
            StateKind::ShallowHistory | StateKind::DeepHistory => {}
        }
        Ok(())
    }

    fn enter_node(
        &mut self,
        state: StateId,
        targets: &BTreeSet<StateId>,
        payload: &Value,
    ) -> Result<(), EngineError> {
        let machine = Arc::clone(&self.machine);
        let node = machine.node(state);

        self.trace.push(TraceEvent::Entered {
            state: node.name.clone(),
        });
        for action in node.entry_actions.clone() {
            self.run_action(&action, payload)?;
        }
        self.timers.arm_for(&machine, state);

        match node.kind {
            StateKind::Simple => {
                self.config.push(state);
            }
            StateKind::Final => {
                self.config.push(state);
                self.mark_final_entered(state);
            }
            StateKind::Composite | StateKind::Parallel => {
                self.enter_children(state, targets, payload)?;
            }
            StateKind::ShallowHistory | StateKind::DeepHistory => {}
        }
        Ok(())
    }

    /// Marks the parent of an entered final state complete, AND-reducing
    /// region completion up through enclosing parallel states.
    fn mark_final_entered(&mut self, final_state: StateId) {
        let machine = Arc::clone(&self.machine);
        let arena = machine.arena();
        let Some(parent) = arena.parent(final_state) else {
            return;
        };

        let mut completed = parent;
        loop {
            if self.done.insert(completed) {
                self.trace.push(TraceEvent::Completed {
                    state: arena.name(completed).to_string(),
                });
            }
            let Some(above) = arena.parent(completed) else {
                break;
            };
            if machine.node(above).kind == StateKind::Parallel
                && machine
                    .node(above)
                    .children
                    .iter()
                    .all(|region| self.done.contains(region))
            {
                completed = above;
                continue;
            }
            break;
        }
    }

    /// Fires eligible completion transitions until none remain, bounded by
    /// the per-instance cascade counter.
    fn completion_cascade(&mut self) -> Result<(), EngineError> {
        let machine = Arc::clone(&self.machine);
        let arena = machine.arena();

        loop {
            let mut candidates: Vec<StateId> = self
                .done
                .iter()
                .copied()
                .filter(|&s| self.is_active(s))
                .collect();
            candidates.sort_by_key(|&s| (std::cmp::Reverse(arena.depth(s)), s));

            let mut fired = false;
            for s in candidates {
                let picked = selector::select_completion(
                    &machine,
                    s,
                    &self.ctx,
                    self.evaluator.as_ref(),
                )?;
                if let Some(tid) = picked {
                    self.cascade += 1;
                    if self.cascade > machine.caps.cascade_limit {
                        self.poison("completion cascade limit exceeded");
                        return Err(EngineError::CascadeLimitExceeded {
                            limit: machine.caps.cascade_limit,
                        });
                    }
                    self.fire_transitions(&[tid], &Value::Null)?;
                    fired = true;
                    break;
                }
            }
            if !fired {
                return Ok(());
            }
        }
    }

    fn run_action(&mut self, action: &str, payload: &Value) -> Result<(), EngineError> {
        match self.evaluator.apply_action(action, &self.ctx, payload) {
            Ok(new_ctx) => {
                self.ctx = new_ctx;
                self.trace.push(TraceEvent::Action {
                    name: action.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                // The step already mutated configuration; fail stop.
                self.poison("action evaluation failed");
                Err(EngineError::ActionEvaluation {
                    action: action.to_string(),
                    reason: e.reason,
                })
            }
        }
    }

    /// The innermost active state deferring `event_name`, if any.
    fn deferring_state(&self, event_name: &str) -> Option<StateId> {
        let arena = self.machine.arena();
        let mut best: Option<StateId> = None;
        for &leaf in &self.config {
            for s in arena.ancestors_and_self(leaf) {
                if !self.machine.node(s).deferred.iter().any(|d| d == event_name) {
                    continue;
                }
                best = match best {
                    None => Some(s),
                    Some(b) => {
                        if (arena.depth(s), std::cmp::Reverse(s))
                            > (arena.depth(b), std::cmp::Reverse(b))
                        {
                            Some(s)
                        } else {
                            Some(b)
                        }
                    }
                };
            }
        }
        best
    }

    fn is_active(&self, state: StateId) -> bool {
        let arena = self.machine.arena();
        self.config
            .iter()
            .any(|&leaf| arena.is_ancestor_or_self(state, leaf))
    }

    fn event_label(&self, event: &Event) -> String {
        match &event.kind {
            EventKind::Signal(name) => name.clone(),
            EventKind::Timer { timer, .. } => {
                format!("timer:{}", self.machine.timer(*timer).name)
            }
        }
    }

    fn outcome(&mut self) -> StepOutcome {
        StepOutcome {
            configuration: self.configuration(),
            trace: std::mem::take(&mut self.trace),
        }
    }
}
