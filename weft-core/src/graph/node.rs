//! Graph Nodes
//!
//! This module defines the arena entries that make up the dependency graph.
//! Every reactive cell (signal, memo, or effect) owns exactly one slot in its
//! graph's node store; edges between cells are sets of node ids rather than
//! direct references, so disposal is an index-invalidation operation and the
//! graph never holds reference cycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;

use crate::reactive::runtime::Reactive;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A source node (signal). These are the roots of the graph.
    /// They have no dependencies, only observers.
    Source,

    /// A derived node (memo). These have dependencies and may have observers.
    /// They cache their computed value.
    Derived,

    /// An effect node. These are leaves of the graph.
    /// They have dependencies but no observers (they produce side effects, not values).
    Effect,
}

/// A node slot in the dependency graph arena.
///
/// Holds the bookkeeping shared by every cell kind: dirtiness, re-entrancy
/// guards, topological depth, the revision counter, and both directions of
/// the edge sets. The `task` handle lets the scheduler recompute a memo or
/// run an effect without knowing its value type.
pub(crate) struct NodeSlot {
    /// Unique identifier for this node.
    pub(crate) id: NodeId,

    /// What kind of node this is.
    pub(crate) kind: NodeKind,

    /// Whether the cached value is known-stale. Derived nodes start dirty so
    /// their first read computes.
    pub(crate) dirty: bool,

    /// Re-entrancy guard for derived nodes: set while the compute function runs.
    pub(crate) computing: bool,

    /// Re-entrancy guard for effect nodes: set while the effect function runs.
    pub(crate) running: bool,

    /// Effects only: once set, the node can never be scheduled again.
    pub(crate) disposed: bool,

    /// Topological rank. A derived node sits one level above its deepest
    /// derived dependency, at 0 when it has none.
    pub(crate) depth: u32,

    /// Incremented once per accepted value change, never decremented.
    pub(crate) revision: u64,

    /// Nodes that this node reads from (parents in the DAG).
    pub(crate) dependencies: IndexSet<NodeId>,

    /// Nodes that read from this node (children in the DAG).
    /// Insertion order is notification order.
    pub(crate) observers: IndexSet<NodeId>,

    /// Type-erased recompute/run handle, present for memos and effects.
    pub(crate) task: Option<Arc<dyn Reactive>>,
}

impl NodeSlot {
    /// Create a new slot of the given kind.
    pub(crate) fn new(id: NodeId, kind: NodeKind, task: Option<Arc<dyn Reactive>>) -> Self {
        Self {
            id,
            kind,
            // Source nodes are always fresh; everything else must run once.
            dirty: !matches!(kind, NodeKind::Source),
            computing: false,
            running: false,
            disposed: false,
            depth: 0,
            revision: 0,
            dependencies: IndexSet::new(),
            observers: IndexSet::new(),
            task,
        }
    }

    /// Create a new source (signal) slot.
    pub(crate) fn source(id: NodeId) -> Self {
        Self::new(id, NodeKind::Source, None)
    }

    /// Create a new derived (memo) slot.
    pub(crate) fn derived(id: NodeId, task: Arc<dyn Reactive>) -> Self {
        Self::new(id, NodeKind::Derived, Some(task))
    }

    /// Create a new effect slot.
    pub(crate) fn effect(id: NodeId, task: Arc<dyn Reactive>) -> Self {
        Self::new(id, NodeKind::Effect, Some(task))
    }
}
