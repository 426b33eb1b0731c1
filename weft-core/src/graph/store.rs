//! Node Store
//!
//! The store is the arena that owns every node slot of one graph. All edge
//! bookkeeping goes through it so the bidirectional invariant holds after
//! every mutation: if A is in B's dependency set, B is in A's observer set.
//!
//! # Locking discipline
//!
//! Slots live in a sharded map. Every method touches at most one slot guard
//! at a time and no guard is ever held across user code, so re-entrant calls
//! from compute and effect functions cannot deadlock.

use std::mem;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexSet;
use smallvec::{smallvec, SmallVec};

use super::node::{NodeId, NodeKind, NodeSlot};
use crate::reactive::runtime::Reactive;

/// Result of a dirtiness propagation sweep.
///
/// `dirtied` lists every derived node that transitioned from clean to dirty,
/// in mark order; `effects` lists the effect nodes encountered, in discovery
/// order, de-duplicated.
pub(crate) struct Propagation {
    pub(crate) dirtied: SmallVec<[NodeId; 8]>,
    pub(crate) effects: IndexSet<NodeId>,
}

/// The arena of node slots owned by one graph.
pub(crate) struct NodeStore {
    nodes: DashMap<NodeId, NodeSlot>,
}

impl NodeStore {
    pub(crate) fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Add a slot to the graph.
    pub(crate) fn insert(&self, slot: NodeSlot) -> NodeId {
        let id = slot.id;
        self.nodes.insert(id, slot);
        id
    }

    /// Remove a slot from the graph, detaching both edge directions.
    pub(crate) fn remove(&self, id: NodeId) {
        let Some((_, slot)) = self.nodes.remove(&id) else {
            return;
        };
        for dep in &slot.dependencies {
            if let Some(mut node) = self.nodes.get_mut(dep) {
                node.observers.shift_remove(&id);
            }
        }
        for obs in &slot.observers {
            if let Some(mut node) = self.nodes.get_mut(obs) {
                node.dependencies.shift_remove(&id);
            }
        }
    }

    /// Get the total number of nodes in the graph.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Register a dependency edge: `observer` reads from `dependency`.
    ///
    /// Both directions are recorded; inserting an existing edge is a no-op.
    pub(crate) fn add_edge(&self, dependency: NodeId, observer: NodeId) {
        if let Some(mut slot) = self.nodes.get_mut(&observer) {
            slot.dependencies.insert(dependency);
        }
        if let Some(mut slot) = self.nodes.get_mut(&dependency) {
            slot.observers.insert(observer);
        }
    }

    /// Remove `observer` from `dependency`'s observer set.
    ///
    /// A derived node whose observer set becomes empty is suspended: its own
    /// upstream edges are dropped (recursively, which may suspend further
    /// nodes) and it is marked dirty so a later read recomputes from scratch.
    pub(crate) fn remove_observer(&self, dependency: NodeId, observer: NodeId) {
        let mut work: SmallVec<[(NodeId, NodeId); 8]> = smallvec![(dependency, observer)];
        while let Some((dep, obs)) = work.pop() {
            let Some(mut slot) = self.nodes.get_mut(&dep) else {
                continue;
            };
            slot.observers.shift_remove(&obs);
            if slot.kind == NodeKind::Derived && slot.observers.is_empty() {
                let upstream = mem::take(&mut slot.dependencies);
                slot.dirty = true;
                drop(slot);
                for next in upstream {
                    work.push((next, dep));
                }
            }
        }
    }

    /// Snapshot a node's observers in insertion order.
    pub(crate) fn observers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .map(|slot| slot.observers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn observer_count(&self, id: NodeId) -> usize {
        self.nodes.get(&id).map(|slot| slot.observers.len()).unwrap_or(0)
    }

    /// Snapshot a node's dependency set.
    pub(crate) fn dependencies(&self, id: NodeId) -> IndexSet<NodeId> {
        self.nodes
            .get(&id)
            .map(|slot| slot.dependencies.clone())
            .unwrap_or_default()
    }

    pub(crate) fn dependency_count(&self, id: NodeId) -> usize {
        self.nodes
            .get(&id)
            .map(|slot| slot.dependencies.len())
            .unwrap_or(0)
    }

    /// Swap out a node's dependency set, leaving it empty.
    ///
    /// Only the dependency side moves; the old dependencies keep their
    /// observer edges until the caller diffs and unregisters them.
    pub(crate) fn take_dependencies(&self, id: NodeId) -> IndexSet<NodeId> {
        self.nodes
            .get_mut(&id)
            .map(|mut slot| mem::take(&mut slot.dependencies))
            .unwrap_or_default()
    }

    /// Restore a previously taken dependency set.
    pub(crate) fn put_dependencies(&self, id: NodeId, dependencies: IndexSet<NodeId>) {
        if let Some(mut slot) = self.nodes.get_mut(&id) {
            slot.dependencies = dependencies;
        }
    }

    /// Swap out a node's observer set, leaving it empty.
    pub(crate) fn take_observers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get_mut(&id)
            .map(|mut slot| mem::take(&mut slot.observers).into_iter().collect())
            .unwrap_or_default()
    }

    /// Propagate dirtiness depth-first starting from the given nodes.
    ///
    /// Derived nodes transition clean -> dirty exactly once (an already-dirty
    /// node stops the walk, which keeps diamond graphs linear); effect nodes
    /// are collected for scheduling. No user code runs in here.
    pub(crate) fn collect_propagation(&self, roots: Vec<NodeId>) -> Propagation {
        let mut dirtied: SmallVec<[NodeId; 8]> = SmallVec::new();
        let mut effects: IndexSet<NodeId> = IndexSet::new();
        let mut stack: SmallVec<[NodeId; 16]> = SmallVec::new();
        stack.extend(roots.into_iter().rev());

        while let Some(id) = stack.pop() {
            let Some(mut slot) = self.nodes.get_mut(&id) else {
                continue;
            };
            match slot.kind {
                NodeKind::Source => {}
                NodeKind::Derived => {
                    if !slot.dirty {
                        slot.dirty = true;
                        let observers: SmallVec<[NodeId; 8]> =
                            slot.observers.iter().copied().collect();
                        drop(slot);
                        dirtied.push(id);
                        stack.extend(observers.into_iter().rev());
                    }
                }
                NodeKind::Effect => {
                    drop(slot);
                    effects.insert(id);
                }
            }
        }

        Propagation { dirtied, effects }
    }

    /// Recompute a derived node's depth from its current dependencies:
    /// one above the deepest derived dependency, 0 when there are none.
    pub(crate) fn update_depth(&self, id: NodeId) {
        let dependencies: SmallVec<[NodeId; 8]> = self
            .nodes
            .get(&id)
            .map(|slot| slot.dependencies.iter().copied().collect())
            .unwrap_or_default();

        let mut deepest: Option<u32> = None;
        for dep in dependencies {
            if let Some(slot) = self.nodes.get(&dep) {
                if slot.kind == NodeKind::Derived {
                    deepest = Some(deepest.map_or(slot.depth, |d| d.max(slot.depth)));
                }
            }
        }

        let depth = deepest.map_or(0, |d| d + 1);
        if let Some(mut slot) = self.nodes.get_mut(&id) {
            slot.depth = depth;
        }
    }

    pub(crate) fn depth(&self, id: NodeId) -> u32 {
        self.nodes.get(&id).map(|slot| slot.depth).unwrap_or(0)
    }

    pub(crate) fn is_dirty(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|slot| slot.dirty).unwrap_or(false)
    }

    pub(crate) fn set_dirty(&self, id: NodeId, dirty: bool) {
        if let Some(mut slot) = self.nodes.get_mut(&id) {
            slot.dirty = dirty;
        }
    }

    pub(crate) fn is_computing(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|slot| slot.computing).unwrap_or(false)
    }

    pub(crate) fn set_computing(&self, id: NodeId, computing: bool) {
        if let Some(mut slot) = self.nodes.get_mut(&id) {
            slot.computing = computing;
        }
    }

    /// Begin an effect run unless the node is disposed or already running.
    pub(crate) fn try_begin_run(&self, id: NodeId) -> bool {
        match self.nodes.get_mut(&id) {
            Some(mut slot) => {
                if slot.disposed || slot.running {
                    false
                } else {
                    slot.running = true;
                    true
                }
            }
            None => false,
        }
    }

    pub(crate) fn end_run(&self, id: NodeId) {
        if let Some(mut slot) = self.nodes.get_mut(&id) {
            slot.running = false;
        }
    }

    pub(crate) fn is_effect_running(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|slot| slot.running).unwrap_or(false)
    }

    /// Mark an effect disposed. Returns false if it already was.
    pub(crate) fn mark_disposed(&self, id: NodeId) -> bool {
        match self.nodes.get_mut(&id) {
            Some(mut slot) => {
                if slot.disposed {
                    false
                } else {
                    slot.disposed = true;
                    true
                }
            }
            None => false,
        }
    }

    pub(crate) fn is_disposed(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|slot| slot.disposed).unwrap_or(true)
    }

    pub(crate) fn revision(&self, id: NodeId) -> u64 {
        self.nodes.get(&id).map(|slot| slot.revision).unwrap_or(0)
    }

    pub(crate) fn bump_revision(&self, id: NodeId) {
        if let Some(mut slot) = self.nodes.get_mut(&id) {
            slot.revision += 1;
        }
    }

    pub(crate) fn task(&self, id: NodeId) -> Option<Arc<dyn Reactive>> {
        self.nodes.get(&id).and_then(|slot| slot.task.clone())
    }

    pub(crate) fn has_task(&self, id: NodeId) -> bool {
        self.nodes.get(&id).map(|slot| slot.task.is_some()).unwrap_or(false)
    }

    pub(crate) fn set_task(&self, id: NodeId, task: Arc<dyn Reactive>) {
        if let Some(mut slot) = self.nodes.get_mut(&id) {
            slot.task = Some(task);
        }
    }

    /// Drop a node's task handle.
    ///
    /// The handle is moved out of the slot guard before it is dropped: the
    /// task may own the last reference to a cell core whose destructor
    /// re-enters the store.
    pub(crate) fn clear_task(&self, id: NodeId) {
        let task = self.nodes.get_mut(&id).and_then(|mut slot| slot.task.take());
        drop(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_nodes() {
        let store = NodeStore::new();

        let id1 = store.insert(NodeSlot::source(NodeId::new()));
        let id2 = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));

        assert_eq!(store.len(), 2);

        store.remove(id1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.observer_count(id2), 0);
    }

    #[test]
    fn edges_are_bidirectional() {
        let store = NodeStore::new();

        let source = store.insert(NodeSlot::source(NodeId::new()));
        let derived = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));

        store.add_edge(source, derived);

        assert_eq!(store.observers(source), vec![derived]);
        assert!(store.dependencies(derived).contains(&source));

        store.remove_observer(source, derived);

        assert_eq!(store.observer_count(source), 0);
        // The dependency side is the caller's to clean; here it remains.
        assert!(store.dependencies(derived).contains(&source));
    }

    #[test]
    fn remove_detaches_both_sides() {
        let store = NodeStore::new();

        let source = store.insert(NodeSlot::source(NodeId::new()));
        let derived = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));

        store.add_edge(source, derived);
        store.remove(source);

        assert_eq!(store.dependency_count(derived), 0);
    }

    #[test]
    fn propagation_marks_transitively_and_collects_effects() {
        let store = NodeStore::new();

        // source -> derived1 -> derived2 -> effect
        let source = store.insert(NodeSlot::source(NodeId::new()));
        let derived1 = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));
        let derived2 = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));
        let effect = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Effect, None));

        store.add_edge(source, derived1);
        store.add_edge(derived1, derived2);
        store.add_edge(derived2, effect);

        store.set_dirty(derived1, false);
        store.set_dirty(derived2, false);

        let propagation = store.collect_propagation(store.observers(source));

        let dirtied: Vec<NodeId> = propagation.dirtied.iter().copied().collect();
        assert_eq!(dirtied, vec![derived1, derived2]);
        assert!(store.is_dirty(derived1));
        assert!(store.is_dirty(derived2));
        assert!(propagation.effects.contains(&effect));
    }

    #[test]
    fn propagation_stops_at_dirty_nodes() {
        let store = NodeStore::new();

        let source = store.insert(NodeSlot::source(NodeId::new()));
        let derived1 = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));
        let derived2 = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));

        store.add_edge(source, derived1);
        store.add_edge(derived1, derived2);

        // derived1 is already dirty; derived2 is clean but must not be
        // reached through it.
        store.set_dirty(derived1, true);
        store.set_dirty(derived2, false);

        let propagation = store.collect_propagation(store.observers(source));

        assert!(propagation.dirtied.is_empty());
        assert!(!store.is_dirty(derived2));
    }

    #[test]
    fn losing_the_last_observer_suspends_a_derived_chain() {
        let store = NodeStore::new();

        // source -> inner -> outer -> effect
        let source = store.insert(NodeSlot::source(NodeId::new()));
        let inner = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));
        let outer = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Derived, None));
        let effect = store.insert(NodeSlot::new(NodeId::new(), NodeKind::Effect, None));

        store.add_edge(source, inner);
        store.add_edge(inner, outer);
        store.add_edge(outer, effect);

        store.set_dirty(inner, false);
        store.set_dirty(outer, false);

        store.remove_observer(outer, effect);

        // outer suspended: upstream edges dropped, marked dirty; that in turn
        // suspended inner and detached it from the source.
        assert!(store.is_dirty(outer));
        assert_eq!(store.dependency_count(outer), 0);
        assert!(store.is_dirty(inner));
        assert_eq!(store.observer_count(source), 0);
    }
}
