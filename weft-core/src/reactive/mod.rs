//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, memos, and
//! effects, coordinated by a per-graph scheduling context.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a memo or effect), the signal
//! automatically registers that context as an observer. When the value
//! changes, all observers are notified; a write that leaves the value equal
//! under the signal's equality predicate notifies nobody.
//!
//! ## Memos
//!
//! A Memo is a derived value that caches its result. Dirtiness is pushed to
//! it eagerly, but it recomputes lazily, on read, and only notifies
//! downstream when the recomputed value actually differs. Dependency edges
//! are re-tracked on every run, so conditional reads keep the graph minimal.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects are the graph's only output point; they run
//! after the memos of a flush have settled, so they never observe a
//! partially updated graph.
//!
//! ## Graph
//!
//! The [`Graph`] owns the dependency arena, the tracking stack, and the
//! batching state. Writes inside a [`Graph::batch`] coalesce into a single
//! flush; with [`GraphOptions::async_flush`] the flush is deferred through a
//! scheduler callback instead of running inline.
//!
//! # Implementation Notes
//!
//! Dependency detection is automatic: each graph keeps a stack of currently
//! computing nodes, and reading any cell attributes an edge to the innermost
//! one. This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is used by SolidJS, Vue 3, and Leptos.

pub(crate) mod context;
pub(crate) mod effect;
pub(crate) mod error;
pub(crate) mod memo;
pub(crate) mod runtime;
pub(crate) mod signal;

pub use effect::Effect;
pub use error::{ReactiveError, Result};
pub use memo::{Memo, MemoOptions};
pub use runtime::{FlushTask, Graph, GraphOptions, Scheduler};
pub use signal::Signal;
