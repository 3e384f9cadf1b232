//! Validated and indexed machine definition.
//!
//! `Machine` is built once from a raw definition, validated completely, and
//! then shared read-only by every instance. All construction-time faults from
//! the model contract are raised here or in [`crate::analysis`].

use crate::analysis::{self, Capacities};
use crate::arena::{StateArena, StateId, StateKind, StateNode};
use crate::error::ModelError;
use crate::raw::{RawMachine, RawRegion, RawState, RawStateKind, TransitionKind};
use std::collections::HashMap;

/// Index of a transition in the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionId(pub u32);

impl TransitionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a timer declaration in the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u32);

impl TimerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What causes a transition to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A named external event.
    Event(String),
    /// Expiry of a declared timer.
    Timer(TimerId),
    /// The source state reached completion.
    Completion,
}

/// A validated transition.
#[derive(Debug, Clone)]
pub struct TransitionDef {
    pub id: TransitionId,
    pub source: StateId,
    pub target: StateId,
    pub trigger: Trigger,
    pub guard: Option<String>,
    pub priority: u32,
    pub kind: TransitionKind,
    pub actions: Vec<String>,
}

/// A validated timer declaration.
#[derive(Debug, Clone)]
pub struct TimerDef {
    pub id: TimerId,
    pub name: String,
    pub owner: StateId,
    pub after_ms: u64,
    pub periodic: bool,
}

/// Validated machine definition: state tree, transitions, timers, capacities.
#[derive(Debug, Clone)]
pub struct Machine {
    pub name: String,
    pub version: u32,
    arena: StateArena,
    by_name: HashMap<String, StateId>,
    transitions: Vec<TransitionDef>,
    /// Outgoing transitions per state, sorted by (priority, declaration order).
    outgoing: Vec<Vec<TransitionId>>,
    timers: Vec<TimerDef>,
    timers_by_owner: Vec<Vec<TimerId>>,
    pub caps: Capacities,
    /// crc32c of the canonical raw definition, for idempotent registration.
    pub checksum: String,
    raw: RawMachine,
}

impl Machine {
    /// Parses and validates a machine definition from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, ModelError> {
        let raw: RawMachine = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Validates a raw definition into a machine.
    pub fn from_raw(raw: RawMachine) -> Result<Self, ModelError> {
        let mut builder = Builder::default();

        // Synthetic root composite holding the top-level states.
        let root = builder.arena.push(StateNode {
            id: StateId::ROOT,
            name: "<root>".to_string(),
            parent: None,
            children: Vec::new(),
            kind: StateKind::Composite,
            depth: 0,
            initial: None,
            history: None,
            history_default: None,
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
            deferred: Vec::new(),
        });

        for s in &raw.states {
            let child = builder.flatten_state(s, root, 1)?;
            builder.arena.get_mut(root).children.push(child);
        }
        builder
            .pending_initial
            .push((root, raw.initial.clone(), "machine".to_string()));

        builder.resolve_links()?;
        builder.validate_structure()?;

        let transitions = builder.build_transitions(&raw)?;

        let mut outgoing = vec![Vec::new(); builder.arena.len()];
        for t in &transitions {
            outgoing[t.source.index()].push(t.id);
        }
        for list in &mut outgoing {
            list.sort_by_key(|id| (transitions[id.index()].priority, *id));
        }

        check_ambiguity(&builder.arena, &transitions)?;

        let mut timers_by_owner = vec![Vec::new(); builder.arena.len()];
        for t in &builder.timers {
            timers_by_owner[t.owner.index()].push(t.id);
        }

        analysis::check_reachability(&builder.arena, &transitions)?;
        let caps = analysis::derive_capacities(&raw, &builder.arena);

        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        tracing::debug!(
            machine = %raw.name,
            states = builder.arena.len(),
            transitions = transitions.len(),
            %checksum,
            "machine validated"
        );

        Ok(Self {
            name: raw.name.clone(),
            version: raw.version,
            arena: builder.arena,
            by_name: builder.by_name,
            transitions,
            outgoing,
            timers: builder.timers,
            timers_by_owner,
            caps,
            checksum,
            raw,
        })
    }

    pub fn root(&self) -> StateId {
        StateId::ROOT
    }

    pub fn arena(&self) -> &StateArena {
        &self.arena
    }

    pub fn node(&self, id: StateId) -> &StateNode {
        self.arena.get(id)
    }

    pub fn state_named(&self, name: &str) -> Option<StateId> {
        self.by_name.get(name).copied()
    }

    pub fn transitions(&self) -> &[TransitionDef] {
        &self.transitions
    }

    pub fn transition(&self, id: TransitionId) -> &TransitionDef {
        &self.transitions[id.index()]
    }

    /// Outgoing transitions of a state, sorted by priority then declaration.
    pub fn outgoing(&self, state: StateId) -> &[TransitionId] {
        &self.outgoing[state.index()]
    }

    pub fn timers(&self) -> &[TimerDef] {
        &self.timers
    }

    pub fn timer(&self, id: TimerId) -> &TimerDef {
        &self.timers[id.index()]
    }

    pub fn timers_of(&self, owner: StateId) -> &[TimerId] {
        &self.timers_by_owner[owner.index()]
    }

    /// Returns the raw definition as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.raw).unwrap_or(serde_json::Value::Null)
    }

    /// The composite whose proper descendants are exited/entered by a
    /// transition. `None` means the transition moves no state at all.
    ///
    /// For an external self-transition the domain is the source's parent, so
    /// exit and re-entry of the source both occur.
    pub fn transition_domain(&self, t: &TransitionDef) -> Option<StateId> {
        // History targets belong to their owning composite for domain math.
        let target = if self.node(t.target).kind.is_history() {
            self.arena.parent(t.target).unwrap_or(StateId::ROOT)
        } else {
            t.target
        };
        match t.kind {
            TransitionKind::Internal => None,
            TransitionKind::Local => {
                if target == t.source {
                    None
                } else {
                    Some(t.source)
                }
            }
            TransitionKind::External => {
                let lca = self.arena.lca(t.source, target);
                if lca == t.source || lca == target {
                    Some(self.arena.parent(lca).unwrap_or(StateId::ROOT))
                } else {
                    Some(lca)
                }
            }
        }
    }

    /// Human-readable trigger label, used in faults and traces.
    pub fn trigger_label(&self, trigger: &Trigger) -> String {
        match trigger {
            Trigger::Event(name) => name.clone(),
            Trigger::Timer(id) => format!("timer:{}", self.timer(*id).name),
            Trigger::Completion => "<completion>".to_string(),
        }
    }
}

#[derive(Default)]
struct Builder {
    arena: StateArena,
    by_name: HashMap<String, StateId>,
    timers: Vec<TimerDef>,
    timer_by_name: HashMap<String, TimerId>,
    /// (composite, initial child name, referrer label)
    pending_initial: Vec<(StateId, String, String)>,
    /// (history node, default target name)
    pending_default: Vec<(StateId, String)>,
}

impl Builder {
    fn register(&mut self, name: &str, id: StateId) -> Result<(), ModelError> {
        if self.by_name.insert(name.to_string(), id).is_some() {
            return Err(ModelError::DuplicateState {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn flatten_state(
        &mut self,
        raw: &RawState,
        parent: StateId,
        depth: u16,
    ) -> Result<StateId, ModelError> {
        let kind = match raw.kind {
            Some(RawStateKind::Final) => StateKind::Final,
            Some(RawStateKind::ShallowHistory) => StateKind::ShallowHistory,
            Some(RawStateKind::DeepHistory) => StateKind::DeepHistory,
            None if !raw.regions.is_empty() => StateKind::Parallel,
            None if !raw.states.is_empty() => StateKind::Composite,
            None => StateKind::Simple,
        };

        if kind != StateKind::Parallel && kind != StateKind::Composite {
            if !raw.states.is_empty() || !raw.regions.is_empty() {
                return Err(ModelError::InvalidDefinition {
                    reason: format!("state '{}' of kind {:?} cannot have children", raw.name, kind),
                });
            }
        }

        let id = self.arena.push(StateNode {
            id: StateId::ROOT,
            name: raw.name.clone(),
            parent: Some(parent),
            children: Vec::new(),
            kind,
            depth,
            initial: None,
            history: None,
            history_default: None,
            entry_actions: raw.entry.clone(),
            exit_actions: raw.exit.clone(),
            deferred: raw.defer.clone(),
        });
        self.register(&raw.name, id)?;

        for t in &raw.timers {
            let timer_id = TimerId(self.timers.len() as u32);
            if self
                .timer_by_name
                .insert(t.name.clone(), timer_id)
                .is_some()
            {
                return Err(ModelError::DuplicateTimer {
                    name: t.name.clone(),
                });
            }
            if t.periodic && t.after_ms == 0 {
                return Err(ModelError::ZeroIntervalTimer {
                    name: t.name.clone(),
                });
            }
            self.timers.push(TimerDef {
                id: timer_id,
                name: t.name.clone(),
                owner: id,
                after_ms: t.after_ms,
                periodic: t.periodic,
            });
        }

        match kind {
            StateKind::Composite => {
                for child_raw in &raw.states {
                    let child = self.flatten_state(child_raw, id, depth + 1)?;
                    self.arena.get_mut(id).children.push(child);
                    self.link_history_child(id, child)?;
                }
                match &raw.initial {
                    Some(initial) => self.pending_initial.push((
                        id,
                        initial.clone(),
                        format!("state '{}'", raw.name),
                    )),
                    None => {
                        return Err(ModelError::MissingInitial {
                            state: raw.name.clone(),
                        })
                    }
                }
            }
            StateKind::Parallel => {
                for region in &raw.regions {
                    let child = self.flatten_region(region, id, depth + 1)?;
                    self.arena.get_mut(id).children.push(child);
                }
            }
            StateKind::ShallowHistory | StateKind::DeepHistory => match &raw.default {
                Some(default) => self.pending_default.push((id, default.clone())),
                None => {
                    return Err(ModelError::MissingHistoryDefault {
                        state: raw.name.clone(),
                    })
                }
            },
            StateKind::Simple | StateKind::Final => {}
        }

        Ok(id)
    }

    fn flatten_region(
        &mut self,
        raw: &RawRegion,
        parent: StateId,
        depth: u16,
    ) -> Result<StateId, ModelError> {
        if raw.states.is_empty() {
            return Err(ModelError::InvalidDefinition {
                reason: format!("region '{}' has no states", raw.name),
            });
        }

        let id = self.arena.push(StateNode {
            id: StateId::ROOT,
            name: raw.name.clone(),
            parent: Some(parent),
            children: Vec::new(),
            kind: StateKind::Composite,
            depth,
            initial: None,
            history: None,
            history_default: None,
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
            deferred: raw.defer.clone(),
        });
        self.register(&raw.name, id)?;

        for child_raw in &raw.states {
            let child = self.flatten_state(child_raw, id, depth + 1)?;
            self.arena.get_mut(id).children.push(child);
            self.link_history_child(id, child)?;
        }
        self.pending_initial
            .push((id, raw.initial.clone(), format!("region '{}'", raw.name)));

        Ok(id)
    }

    fn link_history_child(&mut self, parent: StateId, child: StateId) -> Result<(), ModelError> {
        if !self.arena.get(child).kind.is_history() {
            return Ok(());
        }
        if self.arena.get(parent).history.is_some() {
            return Err(ModelError::InvalidDefinition {
                reason: format!(
                    "state '{}' declares more than one history pseudostate",
                    self.arena.name(parent)
                ),
            });
        }
        self.arena.get_mut(parent).history = Some(child);
        Ok(())
    }

    fn lookup(&self, name: &str, referrer: &str) -> Result<StateId, ModelError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownState {
                name: name.to_string(),
                referrer: referrer.to_string(),
            })
    }

    fn resolve_links(&mut self) -> Result<(), ModelError> {
        for (owner, name, referrer) in std::mem::take(&mut self.pending_initial) {
            let target = self.lookup(&name, &referrer)?;
            if self.arena.parent(target) != Some(owner) {
                return Err(ModelError::InvalidDefinition {
                    reason: format!(
                        "initial '{}' of {} is not a direct child",
                        name, referrer
                    ),
                });
            }
            if !self.arena.get(target).kind.is_activatable() {
                return Err(ModelError::InvalidDefinition {
                    reason: format!("initial '{}' of {} is a history pseudostate", name, referrer),
                });
            }
            self.arena.get_mut(owner).initial = Some(target);
        }

        for (history, name) in std::mem::take(&mut self.pending_default) {
            let referrer = format!("history '{}'", self.arena.name(history));
            let target = self.lookup(&name, &referrer)?;
            let owner = self.arena.parent(history).unwrap_or(StateId::ROOT);
            if target == owner || !self.arena.is_ancestor_or_self(owner, target) {
                return Err(ModelError::InvalidDefinition {
                    reason: format!(
                        "history default '{}' is not a descendant of '{}'",
                        name,
                        self.arena.name(owner)
                    ),
                });
            }
            if !self.arena.get(target).kind.is_activatable() {
                return Err(ModelError::InvalidDefinition {
                    reason: format!("history default '{}' is a pseudostate", name),
                });
            }
            self.arena.get_mut(history).history_default = Some(target);
        }

        Ok(())
    }

    fn validate_structure(&self) -> Result<(), ModelError> {
        for node in self.arena.iter() {
            match node.kind {
                StateKind::Composite => {
                    if node.initial.is_none() {
                        return Err(ModelError::MissingInitial {
                            state: node.name.clone(),
                        });
                    }
                }
                StateKind::Parallel => {
                    if node.children.is_empty() {
                        return Err(ModelError::InvalidDefinition {
                            reason: format!("parallel state '{}' has no regions", node.name),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn build_transitions(&self, raw: &RawMachine) -> Result<Vec<TransitionDef>, ModelError> {
        let mut out = Vec::with_capacity(raw.transitions.len());

        for (i, rt) in raw.transitions.iter().enumerate() {
            let referrer = format!("transition #{}", i);
            let source = self.lookup(&rt.from, &referrer)?;
            let target = self.lookup(&rt.to, &referrer)?;

            let source_node = self.arena.get(source);
            if source_node.kind.is_history() || source_node.kind == StateKind::Final {
                return Err(ModelError::InvalidDefinition {
                    reason: format!(
                        "transition source '{}' is a {:?} state",
                        rt.from, source_node.kind
                    ),
                });
            }

            let trigger = match (&rt.event, &rt.timer, rt.completion) {
                (Some(event), None, false) => Trigger::Event(event.clone()),
                (None, Some(timer), false) => {
                    let id = self.timer_by_name.get(timer).copied().ok_or_else(|| {
                        ModelError::UnknownTimer {
                            name: timer.clone(),
                            from: rt.from.clone(),
                        }
                    })?;
                    Trigger::Timer(id)
                }
                (None, None, true) => {
                    if !matches!(source_node.kind, StateKind::Composite | StateKind::Parallel) {
                        return Err(ModelError::CompletionOnLeaf {
                            state: rt.from.clone(),
                        });
                    }
                    Trigger::Completion
                }
                _ => {
                    return Err(ModelError::InvalidDefinition {
                        reason: format!(
                            "{} must declare exactly one of event, timer, completion",
                            referrer
                        ),
                    })
                }
            };

            // A transition crossing between two regions of the same parallel
            // state would break region independence.
            let effective_target = if self.arena.get(target).kind.is_history() {
                self.arena.parent(target).unwrap_or(StateId::ROOT)
            } else {
                target
            };
            let lca = self.arena.lca(source, effective_target);
            if self.arena.get(lca).kind == StateKind::Parallel
                && lca != source
                && lca != effective_target
            {
                return Err(ModelError::CrossRegionTransition {
                    from: rt.from.clone(),
                    target: rt.to.clone(),
                });
            }

            if rt.kind == TransitionKind::Local
                && effective_target != source
                && !self.arena.is_ancestor_or_self(source, effective_target)
            {
                return Err(ModelError::LocalTargetOutsideSource {
                    from: rt.from.clone(),
                    target: rt.to.clone(),
                });
            }

            if let Some(guard) = &rt.guard {
                if guard.trim().is_empty() {
                    return Err(ModelError::InvalidDefinition {
                        reason: format!("{} has an empty guard", referrer),
                    });
                }
            }

            out.push(TransitionDef {
                id: TransitionId(i as u32),
                source,
                target,
                trigger,
                guard: rt.guard.clone(),
                priority: rt.priority,
                kind: rt.kind,
                actions: rt.actions.clone(),
            });
        }

        Ok(out)
    }
}

/// Two transitions with the same (source, trigger, priority) and guards that
/// cannot be told apart statically are a construction-time ambiguity.
fn check_ambiguity(arena: &StateArena, transitions: &[TransitionDef]) -> Result<(), ModelError> {
    for (i, a) in transitions.iter().enumerate() {
        for b in &transitions[i + 1..] {
            if a.source == b.source
                && a.trigger == b.trigger
                && a.priority == b.priority
                && statically_overlapping(a.guard.as_deref(), b.guard.as_deref())
            {
                return Err(ModelError::AmbiguousTransitions {
                    state: arena.name(a.source).to_string(),
                    trigger: match &a.trigger {
                        Trigger::Event(e) => e.clone(),
                        Trigger::Timer(_) => "timer".to_string(),
                        Trigger::Completion => "<completion>".to_string(),
                    },
                    priority: a.priority,
                });
            }
        }
    }
    Ok(())
}

/// Guards are opaque here; the static approximation flags pairs that are
/// certainly satisfiable together. Distinct guard texts are left to the
/// runtime determinism fault.
fn statically_overlapping(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, _) | (_, None) => true,
        (Some(a), Some(b)) => a.trim() == b.trim(),
    }
}
