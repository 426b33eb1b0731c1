//! Weft Core
//!
//! This crate provides the core engine for the Weft fine-grained reactive
//! dataflow library. It implements:
//!
//! - Reactive primitives (signals, memos, effects)
//! - Automatic dependency tracking with lazy, memoized recomputation
//! - Glitch-free propagation in depth order
//! - Transactional batching with optional asynchronous flush
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `reactive`: the four primitives and the scheduling context
//! - `graph`: the dependency-graph arena backing each context
//!
//! Every cell belongs to exactly one [`reactive::Graph`]; handles are cheap
//! clones. Cells with compute or effect closures live until disposed, so
//! dispose what you no longer need; the graph does not garbage-collect.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_core::reactive::Graph;
//!
//! let graph = Graph::new();
//! let count = graph.signal(0);
//!
//! let doubled = {
//!     let count = count.clone();
//!     graph.memo(move || count.get() * 2)
//! };
//!
//! let _printer = {
//!     let doubled = doubled.clone();
//!     graph.effect(move || println!("doubled: {:?}", doubled.get()))
//! };
//!
//! // Batch several writes into one recomputation and one effect run.
//! graph.batch(|| {
//!     count.set(1).unwrap();
//!     count.set(2).unwrap();
//! })?;
//! ```

pub mod graph;
pub mod reactive;
