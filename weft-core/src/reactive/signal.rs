//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive: a leaf cell holding a
//! mutable value and the set of computations that depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read while a memo or effect of the same graph is
//!    computing, the read registers that computation as an observer.
//!
//! 2. When the value changes, every observing memo is marked dirty and every
//!    observing effect is queued, inside an implicit one-shot batch.
//!
//! 3. Writing a value equal to the current one (under the signal's equality
//!    predicate) does nothing at all: no revision bump, no propagation. This
//!    short-circuit is what stops no-op writes from cascading through the
//!    graph.
//!
//! # Equality
//!
//! The default predicate is `PartialEq`. A custom predicate can be supplied
//! through [`Graph::signal_with_equals`](super::Graph::signal_with_equals)
//! for types without `PartialEq` or with looser change semantics.

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::error::Result;
use super::runtime::{Graph, GraphShared};
use crate::graph::node::{NodeId, NodeSlot};

pub(crate) type EqualsFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

pub(crate) struct SignalCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    id: NodeId,
    value: RwLock<T>,
    equals: EqualsFn<T>,
    graph: Weak<GraphShared>,
}

impl<T> Drop for SignalCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Last handle gone: nothing can read or write this cell again, so
        // its arena slot is retired.
        if let Some(shared) = self.graph.upgrade() {
            shared.store.remove(self.id);
        }
    }
}

/// A reactive mutable cell holding a value of type `T`.
///
/// Handles are cheap clones sharing one cell.
///
/// # Example
///
/// ```rust,ignore
/// let count = graph.signal(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (notifies observers)
/// count.set(5)?;
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    graph: Graph,
    core: Arc<SignalCore<T>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(graph: Graph, value: T, equals: EqualsFn<T>) -> Self {
        let id = NodeId::new();
        graph.store().insert(NodeSlot::source(id));
        let core = Arc::new(SignalCore {
            id,
            value: RwLock::new(value),
            equals,
            graph: Arc::downgrade(graph.shared()),
        });
        Self { graph, core }
    }

    /// Get this cell's node ID.
    pub fn id(&self) -> NodeId {
        self.core.id
    }

    /// Get the current value.
    ///
    /// If a memo or effect of the same graph is currently computing, this
    /// also registers it as an observer of the signal.
    pub fn get(&self) -> T {
        self.graph.register_read(self.core.id);
        self.core.value.read().clone()
    }

    /// Get the current value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        self.core.value.read().clone()
    }

    /// Set a new value and notify observers.
    ///
    /// A value equal to the current one under the equality predicate is a
    /// no-op. Otherwise the revision counter is bumped and, when observers
    /// exist, the change propagates inside an implicit batch; the returned
    /// error is whatever the triggered recomputation or effects raised.
    pub fn set(&self, value: T) -> Result<()> {
        {
            let current = self.core.value.read();
            if (self.core.equals)(&current, &value) {
                return Ok(());
            }
        }
        *self.core.value.write() = value;

        let store = self.graph.store();
        store.bump_revision(self.core.id);
        if store.observer_count(self.core.id) == 0 {
            // Pure write: no transaction, no propagation cost.
            return Ok(());
        }

        self.graph.begin_batch();
        let notified = self.graph.notify_from(self.core.id);
        notified.and(self.graph.end_batch())
    }

    /// Update the value using a function of the current one.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.core.value.read().clone();
        self.set(f(&current))
    }

    /// How many times the value has changed.
    pub fn revision(&self) -> u64 {
        self.graph.store().revision(self.core.id)
    }

    /// How many memos and effects currently observe this signal.
    pub fn observer_count(&self) -> usize {
        self.graph.store().observer_count(self.core.id)
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.core.id)
            .field("value", &self.get_untracked())
            .field("revision", &self.revision())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}
