//! Tracking Context
//!
//! The tracking stack records which computation is currently running so that
//! reads can be attributed to it. When a cell is read while a memo or effect
//! of the same graph is on top of the stack, the read registers a dependency
//! edge between the two.
//!
//! # Implementation
//!
//! Each graph owns its own stack. Entering a context pushes the node and
//! returns a guard; the guard pops on drop, so the stack stays balanced on
//! every exit path, including panics and error returns. Nested contexts work
//! naturally: an effect created while another effect runs tracks against its
//! own frame, and a bare read with an empty stack registers nothing. Because
//! the stack is per graph, a cell can never be attributed to a computation
//! that belongs to a different graph.

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::graph::node::NodeId;

/// The per-graph stack of currently computing nodes.
pub(crate) struct TrackingStack {
    stack: Mutex<SmallVec<[NodeId; 8]>>,
}

impl TrackingStack {
    pub(crate) fn new() -> Self {
        Self {
            stack: Mutex::new(SmallVec::new()),
        }
    }

    /// Push a node and return a guard that pops it when dropped.
    pub(crate) fn enter(&self, id: NodeId) -> TrackingGuard<'_> {
        self.stack.lock().push(id);
        TrackingGuard { stack: self, id }
    }

    /// The innermost node currently being tracked, if any.
    pub(crate) fn current(&self) -> Option<NodeId> {
        self.stack.lock().last().copied()
    }
}

/// Guard that pops the tracking stack when dropped.
pub(crate) struct TrackingGuard<'a> {
    stack: &'a TrackingStack,
    id: NodeId,
}

impl Drop for TrackingGuard<'_> {
    fn drop(&mut self) {
        let popped = self.stack.stack.lock().pop();
        debug_assert_eq!(
            popped,
            Some(self.id),
            "tracking stack popped out of order: expected {:?}, got {:?}",
            self.id,
            popped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_tracks_current_node() {
        let stack = TrackingStack::new();
        let id = NodeId::new();

        assert!(stack.current().is_none());

        {
            let _guard = stack.enter(id);
            assert_eq!(stack.current(), Some(id));
        }

        assert!(stack.current().is_none());
    }

    #[test]
    fn nested_contexts_restore_the_outer_node() {
        let stack = TrackingStack::new();
        let outer = NodeId::new();
        let inner = NodeId::new();

        {
            let _outer = stack.enter(outer);
            assert_eq!(stack.current(), Some(outer));

            {
                let _inner = stack.enter(inner);
                assert_eq!(stack.current(), Some(inner));
            }

            assert_eq!(stack.current(), Some(outer));
        }

        assert!(stack.current().is_none());
    }
}
