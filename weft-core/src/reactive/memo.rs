//! Memo Implementation
//!
//! A Memo is a cached derived value: the result of a pure function of other
//! cells, recomputed lazily when stale.
//!
//! # How Memos Work
//!
//! 1. A memo starts dirty and does no work until its first read.
//!
//! 2. A write upstream only marks it dirty; the recomputation happens on the
//!    next read, or during a flush when an effect observes it.
//!
//! 3. Recomputing re-tracks dependencies from scratch: edges to cells that
//!    were not read this time are dropped, so a branch of conditional logic
//!    that goes cold stops triggering the memo.
//!
//! 4. The revision counter bumps, and downstream observers are notified,
//!    only when the new value differs from the cached one. A recomputation
//!    that lands on an equal value stops the cascade right there.
//!
//! # Failure
//!
//! A compute function that fails leaves the memo dirty, its cached value
//! untouched, and its dependency set rolled back to the last successful run;
//! edges acquired during the failed attempt are unregistered. The failure
//! itself surfaces from whichever read or flush forced the recomputation.
//!
//! # Static memos
//!
//! A memo built with [`MemoOptions::static_deps`] keeps the dependency set of
//! its first run forever, trading re-tracking cost for flexibility: the
//! pruning diff and the failure rollback are both skipped.

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::RwLock;
use tracing::trace;

use super::error::{ReactiveError, Result};
use super::runtime::{Graph, GraphShared, Reactive};
use crate::graph::node::{NodeId, NodeSlot};
use crate::graph::store::NodeStore;

/// Construction options for a memo.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoOptions {
    /// Fix the dependency set after the first computation. Later runs skip
    /// the re-tracking diff, so edges are never pruned.
    pub static_deps: bool,
}

pub(crate) type ComputeFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

pub(crate) struct MemoCore<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    id: NodeId,
    compute: ComputeFn<T>,
    value: RwLock<Option<T>>,
    static_deps: bool,
    graph: Weak<GraphShared>,
}

/// Clears the computing flag on every exit path, including panics.
struct ComputeReset<'a> {
    store: &'a NodeStore,
    id: NodeId,
}

impl Drop for ComputeReset<'_> {
    fn drop(&mut self) {
        self.store.set_computing(self.id, false);
    }
}

impl<T> MemoCore<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Recompute the cached value if the memo is dirty.
    fn recompute(&self, graph: &Graph) -> Result<()> {
        let store = graph.store();
        if !store.is_dirty(self.id) {
            return Ok(());
        }
        if store.is_computing(self.id) {
            return Err(ReactiveError::CircularDependency);
        }

        trace!(node = self.id.raw(), "recomputing memo");
        store.set_computing(self.id, true);

        // Swap in a fresh dependency set; the old one stays available for
        // the pruning diff or the failure rollback. Old dependencies keep
        // their observer edges until the diff removes them.
        let old_deps = if self.static_deps {
            IndexSet::new()
        } else {
            store.take_dependencies(self.id)
        };

        let result = {
            let _computing = ComputeReset { store, id: self.id };
            let _scope = graph.tracker().enter(self.id);
            (self.compute)()
        };

        match result {
            Err(err) => {
                if !self.static_deps {
                    // Unregister edges acquired during the failed attempt so
                    // the graph does not reference a half-built dependency
                    // list, then restore the pre-attempt set.
                    let attempted = store.take_dependencies(self.id);
                    for dep in &attempted {
                        if !old_deps.contains(dep) {
                            store.remove_observer(*dep, self.id);
                        }
                    }
                    store.put_dependencies(self.id, old_deps);
                }
                // The dirty flag stays set; the cached value is untouched.
                Err(err)
            }
            Ok(new_value) => {
                store.set_dirty(self.id, false);

                if !self.static_deps {
                    let current = store.dependencies(self.id);
                    for dep in &old_deps {
                        if !current.contains(dep) {
                            store.remove_observer(*dep, self.id);
                        }
                    }
                }

                store.update_depth(self.id);

                let changed = {
                    let mut cache = self.value.write();
                    let changed = match cache.as_ref() {
                        Some(previous) => previous != &new_value,
                        None => true,
                    };
                    *cache = Some(new_value);
                    changed
                };

                if changed {
                    store.bump_revision(self.id);
                    graph.notify_from(self.id)?;
                }
                Ok(())
            }
        }
    }
}

impl<T> Reactive for MemoCore<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn execute(&self, graph: &Graph) -> Result<()> {
        self.recompute(graph)
    }
}

impl<T> Drop for MemoCore<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn drop(&mut self) {
        if let Some(shared) = self.graph.upgrade() {
            shared.store.remove(self.id);
        }
    }
}

/// A cached derived value that recomputes only when a dependency changed.
///
/// # Example
///
/// ```rust,ignore
/// let price = graph.signal(12);
/// let doubled = {
///     let price = price.clone();
///     graph.memo(move || price.get() * 2)
/// };
///
/// assert_eq!(doubled.get()?, 24);
/// ```
pub struct Memo<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    graph: Graph,
    core: Arc<MemoCore<T>>,
}

impl<T> Memo<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    pub(crate) fn new(graph: Graph, options: MemoOptions, compute: ComputeFn<T>) -> Self {
        let id = NodeId::new();
        let core = Arc::new(MemoCore {
            id,
            compute,
            value: RwLock::new(None),
            static_deps: options.static_deps,
            graph: Arc::downgrade(graph.shared()),
        });
        graph.store().insert(NodeSlot::derived(id, core.clone()));
        Self { graph, core }
    }

    /// Get this cell's node ID.
    pub fn id(&self) -> NodeId {
        self.core.id
    }

    /// Get the current value, recomputing first if the memo is dirty.
    ///
    /// Registers a dependency edge when read inside another computation.
    /// Fails with [`ReactiveError::CircularDependency`] when the memo is
    /// read while its own computation is in progress, and passes through
    /// whatever its compute function raises.
    pub fn get(&self) -> Result<T> {
        let store = self.graph.store();
        if store.is_computing(self.core.id) {
            return Err(ReactiveError::CircularDependency);
        }
        self.graph.register_read(self.core.id);

        // A disposed memo revives on read; give the slot its task back so
        // flushes can reach it again.
        if !store.has_task(self.core.id) {
            store.set_task(self.core.id, self.core.clone());
        }

        if store.is_dirty(self.core.id) {
            self.core.recompute(&self.graph)?;
        }

        let value = self
            .core
            .value
            .read()
            .clone()
            .expect("clean memo should have a value");
        Ok(value)
    }

    /// Force the memo stale, as if a dependency had changed.
    ///
    /// Idempotent. Marks every downstream memo dirty, queues downstream
    /// effects, and enqueues this memo for the next flush; the actual
    /// recomputation stays lazy.
    pub fn mark_dirty(&self) -> Result<()> {
        self.graph.mark_node_dirty(self.core.id)
    }

    /// Detach the memo from the graph.
    ///
    /// Upstream cells forget it, downstream observers are invalidated the
    /// same way a change would, and the cache is forced stale. A later read
    /// revives the memo from scratch.
    pub fn dispose(&self) -> Result<()> {
        let store = self.graph.store();
        let deps = store.take_dependencies(self.core.id);
        for dep in deps {
            store.remove_observer(dep, self.core.id);
        }
        store.set_dirty(self.core.id, true);
        store.clear_task(self.core.id);

        let observers = store.take_observers(self.core.id);
        self.graph.notify_targets(observers)
    }

    /// How many times recomputation produced a different value.
    pub fn revision(&self) -> u64 {
        self.graph.store().revision(self.core.id)
    }

    /// Whether the cached value is known-stale.
    pub fn is_dirty(&self) -> bool {
        self.graph.store().is_dirty(self.core.id)
    }

    /// Whether the memo has ever computed.
    pub fn has_value(&self) -> bool {
        self.core.value.read().is_some()
    }

    /// How many cells the last successful computation read.
    pub fn dependency_count(&self) -> usize {
        self.graph.store().dependency_count(self.core.id)
    }

    /// How many memos and effects currently observe this memo.
    pub fn observer_count(&self) -> usize {
        self.graph.store().observer_count(self.core.id)
    }
}

impl<T> Clone for Memo<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> Debug for Memo<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memo")
            .field("id", &self.core.id)
            .field("dirty", &self.is_dirty())
            .field("has_value", &self.has_value())
            .field("revision", &self.revision())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}
