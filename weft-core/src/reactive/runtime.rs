//! Reactive Graph Runtime
//!
//! The graph is the central coordinator that connects signals, memos, and
//! effects. It owns the node arena, the dependency-tracking stack, and the
//! batching state, and it schedules recomputation when signals change.
//!
//! # How It Works
//!
//! 1. When a cell is created, it registers a slot with the graph's store.
//!
//! 2. When a memo or effect runs, it sits on the tracking stack; any cell it
//!    reads records a dependency edge to it.
//!
//! 3. When a signal's value changes, the graph:
//!    a. Marks every transitively dependent memo dirty (without recomputing)
//!    b. Queues every affected effect
//!    c. At the end of the enclosing batch, recomputes dirty memos in depth
//!       order, then runs the queued effects
//!
//! Memos are lazy: dirtiness is pushed eagerly, but the actual work happens
//! on read or during a flush, and only for memos somebody still observes.
//!
//! # Flushing
//!
//! A flush is triggered when the outermost batch ends. By default it runs
//! inline; with [`GraphOptions::async_flush`] it is handed to a scheduler
//! callback instead, and consecutive writes coalesce into a single deferred
//! flush.

use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::context::TrackingStack;
use super::effect::Effect;
use super::error::{ReactiveError, Result};
use super::memo::{Memo, MemoOptions};
use super::signal::Signal;
use crate::graph::node::NodeId;
use crate::graph::store::{NodeStore, Propagation};

/// Ceiling on recomputation passes within a single flush. A graph that keeps
/// re-dirtying itself past this many passes contains a cycle that the
/// per-cell re-entrancy guard cannot see.
pub(crate) const MAX_FLUSH_ITERATIONS: usize = 1000;

/// A deferred flush, handed to the scheduler under async mode.
///
/// The scheduler must eventually invoke it at most once; the returned
/// `Result` carries any failure raised by user compute or effect functions
/// during the flush.
pub type FlushTask = Box<dyn FnOnce() -> Result<()> + Send>;

/// The deferral primitive used by async flushing.
pub type Scheduler = Arc<dyn Fn(FlushTask) + Send + Sync>;

/// Construction options for a [`Graph`].
#[derive(Clone, Default)]
pub struct GraphOptions {
    /// Defer flushes to a scheduler callback instead of running them inline
    /// at the end of the outermost batch.
    pub async_flush: bool,

    /// The deferral primitive. When omitted under `async_flush`, flushes are
    /// spawned onto the current tokio runtime, or run inline when no runtime
    /// is available.
    pub scheduler: Option<Scheduler>,
}

/// A value the scheduler can drive without knowing its concrete type.
///
/// Memos and effects implement this; the flush loop uses it to recompute a
/// dirty memo or run a queued effect through the type-erased task handle
/// stored in the node arena.
pub(crate) trait Reactive: Send + Sync {
    /// The arena slot this value owns.
    fn node_id(&self) -> NodeId;

    /// Recompute (memos) or run (effects).
    fn execute(&self, graph: &Graph) -> Result<()>;
}

/// Scheduling state protected by one mutex. Locked only for short
/// bookkeeping sections, never across user code.
#[derive(Default)]
struct SchedState {
    batch_depth: usize,
    dirty_memos: IndexSet<NodeId>,
    pending_effects: IndexSet<NodeId>,
    flush_scheduled: bool,
}

pub(crate) struct GraphShared {
    pub(crate) store: NodeStore,
    sched: Mutex<SchedState>,
    tracker: TrackingStack,
    scheduler: Option<Scheduler>,
}

/// A reactive scheduling context.
///
/// Owns a set of cells, their dependency graph, and the batching and flush
/// machinery. Handles are cheap clones sharing the same context.
///
/// # Example
///
/// ```rust,ignore
/// use weft_core::reactive::Graph;
///
/// let graph = Graph::new();
/// let count = graph.signal(0);
///
/// let doubled = {
///     let count = count.clone();
///     graph.memo(move || count.get() * 2)
/// };
///
/// let _printer = {
///     let doubled = doubled.clone();
///     graph.effect(move || println!("doubled = {:?}", doubled.get()))
/// };
///
/// count.set(5)?; // prints: doubled = Ok(10)
/// ```
#[derive(Clone)]
pub struct Graph {
    shared: Arc<GraphShared>,
}

impl Graph {
    /// Create a graph with synchronous, inline flushing.
    pub fn new() -> Self {
        Self::with_options(GraphOptions::default())
    }

    /// Create a graph with explicit scheduling options.
    pub fn with_options(options: GraphOptions) -> Self {
        let scheduler = if options.async_flush {
            Some(options.scheduler.unwrap_or_else(microtask_scheduler))
        } else {
            None
        };
        Self {
            shared: Arc::new(GraphShared {
                store: NodeStore::new(),
                sched: Mutex::new(SchedState::default()),
                tracker: TrackingStack::new(),
                scheduler,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<GraphShared> {
        &self.shared
    }

    pub(crate) fn store(&self) -> &NodeStore {
        &self.shared.store
    }

    pub(crate) fn tracker(&self) -> &TrackingStack {
        &self.shared.tracker
    }

    /// The number of live cells in this graph.
    pub fn node_count(&self) -> usize {
        self.shared.store.len()
    }

    // ------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------

    /// Create a mutable cell holding `value`.
    ///
    /// Change detection uses `PartialEq`; writing an equal value is a no-op.
    pub fn signal<T>(&self, value: T) -> Signal<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
    {
        self.signal_with_equals(value, |a: &T, b: &T| a == b)
    }

    /// Create a mutable cell with a custom equality predicate.
    pub fn signal_with_equals<T, F>(&self, value: T, equals: F) -> Signal<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Signal::new(self.clone(), value, Box::new(equals))
    }

    /// Create a derived cell from an infallible compute function.
    ///
    /// The computation does not run until the first read.
    pub fn memo<T, F>(&self, compute: F) -> Memo<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.memo_with(MemoOptions::default(), compute)
    }

    /// Create a derived cell from a fallible compute function.
    pub fn try_memo<T, F>(&self, compute: F) -> Memo<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        self.try_memo_with(MemoOptions::default(), compute)
    }

    /// Create a derived cell with explicit options.
    pub fn memo_with<T, F>(&self, options: MemoOptions, compute: F) -> Memo<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.try_memo_with(options, move || Ok(compute()))
    }

    /// Create a derived cell from a fallible compute function, with options.
    pub fn try_memo_with<T, F>(&self, options: MemoOptions, compute: F) -> Memo<T>
    where
        T: Clone + Send + Sync + PartialEq + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Memo::new(self.clone(), options, Box::new(compute))
    }

    /// Create an effect and run it once to establish its dependencies.
    pub fn effect<F>(&self, func: F) -> Effect
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.try_effect(move || {
            func();
            Ok(())
        })
        .expect("an infallible effect cannot fail its initial run")
    }

    /// Create an effect from a fallible function, running it once.
    ///
    /// If the initial run fails, the effect is unsubscribed and the error is
    /// returned; no handle survives a failed construction.
    pub fn try_effect<F>(&self, func: F) -> Result<Effect>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let effect = Effect::new(self.clone(), Box::new(func));
        if let Err(err) = effect.run_now() {
            effect.dispose();
            return Err(err);
        }
        Ok(effect)
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Open a transaction. Writes inside a batch propagate dirtiness but
    /// defer all recomputation and effects until the outermost
    /// [`end_batch`](Self::end_batch).
    pub fn begin_batch(&self) {
        self.shared.sched.lock().batch_depth += 1;
    }

    /// Close a transaction. When the outermost batch ends, the graph flushes:
    /// inline by default, or via the scheduler under async mode.
    pub fn end_batch(&self) -> Result<()> {
        let finished = {
            let mut sched = self.shared.sched.lock();
            if sched.batch_depth == 0 {
                warn!("end_batch called with no batch in progress");
                return Ok(());
            }
            sched.batch_depth -= 1;
            sched.batch_depth == 0
        };
        if !finished {
            return Ok(());
        }

        if let Some(scheduler) = self.shared.scheduler.clone() {
            let schedule = {
                let mut sched = self.shared.sched.lock();
                if sched.flush_scheduled {
                    false
                } else {
                    sched.flush_scheduled = true;
                    true
                }
            };
            if schedule {
                trace!("scheduling deferred flush");
                let graph = self.clone();
                scheduler(Box::new(move || graph.run_deferred_flush()));
            }
            Ok(())
        } else {
            self.flush_effects()
        }
    }

    /// Run `f` inside a batch. The batch is closed on every exit path; if
    /// `f` panics, the closing flush still runs while unwinding.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.begin_batch();
        let mut guard = BatchGuard {
            graph: self,
            armed: true,
        };
        let value = f();
        guard.armed = false;
        drop(guard);
        self.end_batch()?;
        Ok(value)
    }

    /// Run a fallible `f` inside a batch. The batch is closed on every exit
    /// path; an error from `f` takes precedence over a flush error.
    pub fn try_batch<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.begin_batch();
        let mut guard = BatchGuard {
            graph: self,
            armed: true,
        };
        let result = f();
        guard.armed = false;
        drop(guard);
        let flushed = self.end_batch();
        let value = result?;
        flushed?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Scheduling internals
    // ------------------------------------------------------------------

    /// Invoked by the scheduler. Defers again if a new batch started between
    /// scheduling and invocation; that batch's end will reschedule.
    fn run_deferred_flush(&self) -> Result<()> {
        {
            let mut sched = self.shared.sched.lock();
            sched.flush_scheduled = false;
            if sched.batch_depth > 0 {
                return Ok(());
            }
        }
        self.flush_effects()
    }

    /// Recompute dirty memos until the queue drains, deepest last.
    ///
    /// Each pass snapshots the queue, sorts it by depth so every memo sees
    /// already-fresh inputs, and recomputes the entries that are still dirty
    /// and still observed. Recomputation may dirty further memos, so the
    /// loop repeats until it settles or hits the iteration ceiling.
    fn flush_dirty_memos(&self) -> Result<()> {
        let mut iterations = 0usize;
        loop {
            let mut batch: Vec<NodeId> = {
                let mut sched = self.shared.sched.lock();
                if sched.dirty_memos.is_empty() {
                    return Ok(());
                }
                sched.dirty_memos.drain(..).collect()
            };
            iterations += 1;
            if iterations > MAX_FLUSH_ITERATIONS {
                self.shared.sched.lock().dirty_memos.clear();
                return Err(ReactiveError::MaxFlushIterationsExceeded {
                    limit: MAX_FLUSH_ITERATIONS,
                });
            }

            batch.sort_by_key(|id| self.shared.store.depth(*id));
            trace!(pass = iterations, pending = batch.len(), "recomputing dirty memos");

            for id in batch {
                // Entries that went clean through a direct read, or lost
                // every observer since being queued, are skipped; the latter
                // recompute lazily if ever read again.
                if self.shared.store.is_dirty(id) && self.shared.store.observer_count(id) > 0 {
                    if let Some(task) = self.shared.store.task(id) {
                        debug_assert_eq!(task.node_id(), id, "arena task mapped to the wrong node");
                        task.execute(self)?;
                    }
                }
            }
        }
    }

    /// Settle dirty memos, then drain the pending effects once.
    ///
    /// Effects run in the order they were queued. An effect that dirties the
    /// graph again re-enters scheduling through the write that caused it,
    /// not through this drain.
    fn flush_effects(&self) -> Result<()> {
        self.flush_dirty_memos()?;
        let batch: Vec<NodeId> = {
            let mut sched = self.shared.sched.lock();
            sched.pending_effects.drain(..).collect()
        };
        for id in batch {
            if !self.shared.store.is_disposed(id) {
                if let Some(task) = self.shared.store.task(id) {
                    task.execute(self)?;
                }
            }
        }
        Ok(())
    }

    /// Queue an effect. Outside a batch, the first effect queued triggers an
    /// immediate flush; inside one, the queue drains at batch end.
    pub(crate) fn schedule_effect(&self, id: NodeId) -> Result<()> {
        // An effect that writes a cell it reads must not re-trigger itself.
        if self.shared.store.is_effect_running(id) {
            return Ok(());
        }
        let run_now = {
            let mut sched = self.shared.sched.lock();
            let was_empty = sched.pending_effects.is_empty();
            sched.pending_effects.insert(id);
            sched.batch_depth == 0 && was_empty
        };
        if run_now {
            self.flush_effects()
        } else {
            Ok(())
        }
    }

    /// Propagate a change at `id` to its observers.
    pub(crate) fn notify_from(&self, id: NodeId) -> Result<()> {
        self.notify_targets(self.shared.store.observers(id))
    }

    /// Propagate dirtiness starting from the given observer nodes.
    pub(crate) fn notify_targets(&self, roots: Vec<NodeId>) -> Result<()> {
        if roots.is_empty() {
            return Ok(());
        }
        let propagation = self.shared.store.collect_propagation(roots);
        self.apply_propagation(propagation)
    }

    /// Force a derived node dirty, as if a dependency had changed.
    pub(crate) fn mark_node_dirty(&self, id: NodeId) -> Result<()> {
        if self.shared.store.is_dirty(id) {
            return Ok(());
        }
        let propagation = self.shared.store.collect_propagation(vec![id]);
        self.apply_propagation(propagation)
    }

    fn apply_propagation(&self, propagation: Propagation) -> Result<()> {
        {
            let mut sched = self.shared.sched.lock();
            for id in &propagation.dirtied {
                sched.dirty_memos.insert(*id);
            }
        }
        for id in propagation.effects {
            self.schedule_effect(id)?;
        }
        Ok(())
    }

    /// Attribute a read of `id` to the innermost tracked node, if any.
    pub(crate) fn register_read(&self, id: NodeId) {
        if let Some(current) = self.shared.tracker.current() {
            self.shared.store.add_edge(id, current);
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Closes the batch while unwinding if the batched closure panicked.
struct BatchGuard<'a> {
    graph: &'a Graph,
    armed: bool,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.graph.end_batch() {
                tracing::error!(error = %err, "flush failed while unwinding a batch");
            }
        }
    }
}

/// Default deferral under async mode: spawn the flush onto the current tokio
/// runtime, the closest equivalent of a microtask. Without a runtime the
/// flush runs inline.
fn microtask_scheduler() -> Scheduler {
    Arc::new(|task: FlushTask| match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let _ = handle.spawn(async move {
                if let Err(err) = task() {
                    tracing::error!(error = %err, "deferred flush failed");
                }
            });
        }
        Err(_) => {
            if let Err(err) = task() {
                tracing::error!(error = %err, "deferred flush failed");
            }
        }
    })
}
