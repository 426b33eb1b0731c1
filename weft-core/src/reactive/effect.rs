//! Effect Implementation
//!
//! An Effect is a side-effecting computation that re-runs whenever any of
//! its dependencies change. Effects are the only place where output leaves
//! the graph: logging, rendering, writing to the outside world.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs once to establish its dependencies.
//!
//! 2. When any dependency changes, the effect is queued and runs after the
//!    dirty memos of that flush have settled, so it only ever observes a
//!    consistent graph.
//!
//! 3. Every run re-tracks from scratch: the effect unsubscribes from all
//!    previous dependencies and whatever it reads this time becomes the new
//!    set. There is no static mode for effects.
//!
//! A running flag guards re-entry: an effect that writes a cell it also
//! reads does not re-trigger itself. A failing effect function propagates to
//! whoever triggered the run, with the guard released and the dependency set
//! rebuilt up to the failure point, so the next run behaves normally.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

use super::error::Result;
use super::runtime::{Graph, GraphShared, Reactive};
use crate::graph::node::{NodeId, NodeSlot};
use crate::graph::store::NodeStore;

pub(crate) type EffectFn = Box<dyn Fn() -> Result<()> + Send + Sync>;

pub(crate) struct EffectCore {
    id: NodeId,
    func: EffectFn,
    run_count: AtomicUsize,
    graph: Weak<GraphShared>,
}

/// Clears the running flag on every exit path, including panics.
struct RunReset<'a> {
    store: &'a NodeStore,
    id: NodeId,
}

impl Drop for RunReset<'_> {
    fn drop(&mut self) {
        self.store.end_run(self.id);
    }
}

impl EffectCore {
    fn run(&self, graph: &Graph) -> Result<()> {
        let store = graph.store();
        if !store.try_begin_run(self.id) {
            return Ok(());
        }

        trace!(node = self.id.raw(), "running effect");

        // Unsubscribe from everything; the run re-establishes what it reads.
        let previous = store.take_dependencies(self.id);
        for dep in previous {
            store.remove_observer(dep, self.id);
        }

        let result = {
            let _running = RunReset { store, id: self.id };
            let _scope = graph.tracker().enter(self.id);
            (self.func)()
        };

        if result.is_ok() {
            self.run_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl Reactive for EffectCore {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn execute(&self, graph: &Graph) -> Result<()> {
        self.run(graph)
    }
}

impl Drop for EffectCore {
    fn drop(&mut self) {
        if let Some(shared) = self.graph.upgrade() {
            shared.store.remove(self.id);
        }
    }
}

/// A side-effecting subscriber that runs when its dependencies change.
///
/// Created through [`Graph::effect`](super::Graph::effect) or
/// [`Graph::try_effect`](super::Graph::try_effect); runs once at creation.
///
/// # Example
///
/// ```rust,ignore
/// let count = graph.signal(0);
///
/// let logger = {
///     let count = count.clone();
///     graph.effect(move || println!("count is {}", count.get()))
/// };
///
/// count.set(5)?; // prints: count is 5
/// logger.dispose();
/// ```
pub struct Effect {
    graph: Graph,
    core: Arc<EffectCore>,
}

impl Effect {
    pub(crate) fn new(graph: Graph, func: EffectFn) -> Self {
        let id = NodeId::new();
        let core = Arc::new(EffectCore {
            id,
            func,
            run_count: AtomicUsize::new(0),
            graph: Arc::downgrade(graph.shared()),
        });
        graph.store().insert(NodeSlot::effect(id, core.clone()));
        Self { graph, core }
    }

    /// Run the effect immediately. Used for the initial run at creation.
    pub(crate) fn run_now(&self) -> Result<()> {
        self.core.run(&self.graph)
    }

    /// Get this effect's node ID.
    pub fn id(&self) -> NodeId {
        self.core.id
    }

    /// Permanently stop the effect and unsubscribe it from all dependencies.
    ///
    /// Idempotent; a disposed effect can never be scheduled again.
    pub fn dispose(&self) {
        let store = self.graph.store();
        if !store.mark_disposed(self.core.id) {
            return;
        }
        let deps = store.take_dependencies(self.core.id);
        for dep in deps {
            store.remove_observer(dep, self.core.id);
        }
        store.clear_task(self.core.id);
    }

    /// Whether the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.graph.store().is_disposed(self.core.id)
    }

    /// How many times the effect function has completed successfully.
    pub fn run_count(&self) -> usize {
        self.core.run_count.load(Ordering::Relaxed)
    }

    /// How many cells the last run read.
    pub fn dependency_count(&self) -> usize {
        self.graph.store().dependency_count(self.core.id)
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            core: Arc::clone(&self.core),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.core.id)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Graph, ReactiveError};
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn effect_runs_once_on_creation() {
        let graph = Graph::new();
        let signal = graph.signal(1);
        let runs = Arc::new(AtomicI32::new(0));

        let signal_clone = signal.clone();
        let runs_clone = runs.clone();
        let effect = graph.effect(move || {
            signal_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(effect.run_count(), 1);
        assert_eq!(effect.dependency_count(), 1);
    }

    #[test]
    fn effect_reruns_when_a_dependency_changes() {
        let graph = Graph::new();
        let signal = graph.signal(1);
        let runs = Arc::new(AtomicI32::new(0));

        let signal_clone = signal.clone();
        let runs_clone = runs.clone();
        let _effect = graph.effect(move || {
            signal_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(2).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // An equal write changes nothing.
        signal.set(2).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn effect_tracks_multiple_signals() {
        let graph = Graph::new();
        let a = graph.signal(1);
        let b = graph.signal(2);
        let runs = Arc::new(AtomicI32::new(0));

        let a_clone = a.clone();
        let b_clone = b.clone();
        let runs_clone = runs.clone();
        let _effect = graph.effect(move || {
            a_clone.get();
            b_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        a.set(10).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        b.set(20).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn disposed_effect_never_runs_again() {
        let graph = Graph::new();
        let signal = graph.signal(1);
        let runs = Arc::new(AtomicI32::new(0));

        let signal_clone = signal.clone();
        let runs_clone = runs.clone();
        let effect = graph.effect(move || {
            signal_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(2).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        effect.dispose();
        assert!(effect.is_disposed());
        assert_eq!(signal.observer_count(), 0);

        signal.set(3).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn effect_writing_its_own_dependency_does_not_recurse() {
        let graph = Graph::new();
        let signal = graph.signal(0);
        let runs = Arc::new(AtomicI32::new(0));

        let signal_clone = signal.clone();
        let runs_clone = runs.clone();
        let _effect = graph.effect(move || {
            let value = signal_clone.get();
            runs_clone.fetch_add(1, Ordering::SeqCst);
            if value < 1 {
                signal_clone.set(value + 1).unwrap();
            }
        });

        // The write from inside the run is absorbed by the running guard.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(signal.get_untracked(), 1);
    }

    #[test]
    fn failing_effect_propagates_to_the_write() {
        let graph = Graph::new();
        let signal = graph.signal(1);
        let should_fail = Arc::new(AtomicBool::new(false));

        let signal_clone = signal.clone();
        let should_fail_clone = should_fail.clone();
        let effect = graph
            .try_effect(move || {
                signal_clone.get();
                if should_fail_clone.load(Ordering::SeqCst) {
                    return Err(ReactiveError::message("effect failed"));
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(effect.run_count(), 1);

        should_fail.store(true, Ordering::SeqCst);
        let err = signal.set(2).expect_err("the effect failure surfaces here");
        assert!(matches!(err, ReactiveError::Message(_)));

        // The dependency set was rebuilt before the failure, so a corrected
        // run works.
        should_fail.store(false, Ordering::SeqCst);
        signal.set(3).unwrap();
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn failed_initial_run_returns_the_error_and_unsubscribes() {
        let graph = Graph::new();
        let signal = graph.signal(1);

        let signal_clone = signal.clone();
        let result = graph.try_effect(move || {
            signal_clone.get();
            Err(ReactiveError::message("refused to start"))
        });

        assert!(matches!(result, Err(ReactiveError::Message(_))));
        assert_eq!(signal.observer_count(), 0);
    }

    #[test]
    fn effect_observing_a_memo_reruns_on_change() {
        let graph = Graph::new();
        let signal = graph.signal(2);

        let signal_clone = signal.clone();
        let doubled = graph.memo(move || signal_clone.get() * 2);

        let observed = Arc::new(AtomicI32::new(0));
        let doubled_clone = doubled.clone();
        let observed_clone = observed.clone();
        let _effect = graph.effect(move || {
            observed_clone.store(doubled_clone.get().unwrap_or(0), Ordering::SeqCst);
        });

        assert_eq!(observed.load(Ordering::SeqCst), 4);
        signal.set(5).unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 10);
    }
}
