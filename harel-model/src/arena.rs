//! State tree arena.
//!
//! The state hierarchy is stored as a flat arena of nodes addressed by
//! integer index. Parent/child relations are indices into the arena, so the
//! tree carries no back-pointers and the whole model can be shared read-only
//! across machine instances.

use serde::{Deserialize, Serialize};

/// Index of a state node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub u32);

impl StateId {
    /// The synthetic root of every machine.
    pub const ROOT: StateId = StateId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a state node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// Leaf state with no children.
    Simple,
    /// State with children, exactly one active at a time.
    Composite,
    /// State whose children are independent, concurrently active regions.
    Parallel,
    /// Final marker; entering it completes the parent.
    Final,
    /// Records the last active direct child of the parent composite.
    ShallowHistory,
    /// Records the last active leaf per region under the parent composite.
    DeepHistory,
}

impl StateKind {
    /// True for shallow and deep history pseudostates.
    pub fn is_history(self) -> bool {
        matches!(self, StateKind::ShallowHistory | StateKind::DeepHistory)
    }

    /// True if nodes of this kind can appear in an active configuration.
    pub fn is_activatable(self) -> bool {
        !self.is_history()
    }
}

/// One node of the state tree.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: StateId,
    pub name: String,
    pub parent: Option<StateId>,
    pub children: Vec<StateId>,
    pub kind: StateKind,
    pub depth: u16,
    /// Default-initial child for composites.
    pub initial: Option<StateId>,
    /// The history pseudostate owned by this composite, if any.
    pub history: Option<StateId>,
    /// Mandatory default target when this node is a history pseudostate.
    pub history_default: Option<StateId>,
    pub entry_actions: Vec<String>,
    pub exit_actions: Vec<String>,
    /// Event names deferred while this state is active.
    pub deferred: Vec<String>,
}

/// Flat storage for the state tree. Index 0 is always the root.
#[derive(Debug, Clone, Default)]
pub struct StateArena {
    nodes: Vec<StateNode>,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and returns its id. Children/initial links are patched
    /// by the machine builder after all nodes exist.
    pub fn push(&mut self, mut node: StateNode) -> StateId {
        let id = StateId(self.nodes.len() as u32);
        node.id = id;
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: StateId) -> &StateNode {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: StateId) -> &mut StateNode {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateNode> {
        self.nodes.iter()
    }

    pub fn name(&self, id: StateId) -> &str {
        &self.get(id).name
    }

    pub fn depth(&self, id: StateId) -> u16 {
        self.get(id).depth
    }

    pub fn parent(&self, id: StateId) -> Option<StateId> {
        self.get(id).parent
    }

    /// Walks from `id` toward the root, including `id` itself.
    pub fn ancestors_and_self(&self, id: StateId) -> AncestorIter<'_> {
        AncestorIter {
            arena: self,
            next: Some(id),
        }
    }

    /// True if `ancestor` is `id` or lies on `id`'s path to the root.
    pub fn is_ancestor_or_self(&self, ancestor: StateId, id: StateId) -> bool {
        self.ancestors_and_self(id).any(|a| a == ancestor)
    }

    /// Least common ancestor of two nodes.
    pub fn lca(&self, a: StateId, b: StateId) -> StateId {
        let mut a = a;
        let mut b = b;
        while self.depth(a) > self.depth(b) {
            a = self.parent(a).unwrap_or(StateId::ROOT);
        }
        while self.depth(b) > self.depth(a) {
            b = self.parent(b).unwrap_or(StateId::ROOT);
        }
        while a != b {
            a = self.parent(a).unwrap_or(StateId::ROOT);
            b = self.parent(b).unwrap_or(StateId::ROOT);
        }
        a
    }
}

/// Iterator from a node up to the root.
pub struct AncestorIter<'a> {
    arena: &'a StateArena,
    next: Option<StateId>,
}

impl<'a> Iterator for AncestorIter<'a> {
    type Item = StateId;

    fn next(&mut self) -> Option<StateId> {
        let id = self.next?;
        self.next = self.arena.parent(id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, parent: Option<StateId>, depth: u16) -> StateNode {
        StateNode {
            id: StateId::ROOT,
            name: name.to_string(),
            parent,
            children: Vec::new(),
            kind: StateKind::Simple,
            depth,
            initial: None,
            history: None,
            history_default: None,
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// root -> a -> (a1, a2), root -> b
    fn sample() -> StateArena {
        let mut arena = StateArena::new();
        let root = arena.push(node("root", None, 0));
        let a = arena.push(node("a", Some(root), 1));
        let a1 = arena.push(node("a1", Some(a), 2));
        let a2 = arena.push(node("a2", Some(a), 2));
        let b = arena.push(node("b", Some(root), 1));
        arena.get_mut(root).children = vec![a, b];
        arena.get_mut(a).children = vec![a1, a2];
        arena
    }

    #[test]
    fn test_ancestor_walk() {
        let arena = sample();
        let chain: Vec<&str> = arena
            .ancestors_and_self(StateId(2))
            .map(|id| arena.name(id))
            .collect();
        assert_eq!(chain, vec!["a1", "a", "root"]);
    }

    #[test]
    fn test_lca() {
        let arena = sample();
        // a1 vs a2 -> a
        assert_eq!(arena.lca(StateId(2), StateId(3)), StateId(1));
        // a1 vs b -> root
        assert_eq!(arena.lca(StateId(2), StateId(4)), StateId::ROOT);
        // a1 vs a -> a
        assert_eq!(arena.lca(StateId(2), StateId(1)), StateId(1));
        // self
        assert_eq!(arena.lca(StateId(2), StateId(2)), StateId(2));
    }

    #[test]
    fn test_is_ancestor_or_self() {
        let arena = sample();
        assert!(arena.is_ancestor_or_self(StateId::ROOT, StateId(2)));
        assert!(arena.is_ancestor_or_self(StateId(1), StateId(2)));
        assert!(arena.is_ancestor_or_self(StateId(2), StateId(2)));
        assert!(!arena.is_ancestor_or_self(StateId(2), StateId(1)));
        assert!(!arena.is_ancestor_or_self(StateId(4), StateId(2)));
    }
}
