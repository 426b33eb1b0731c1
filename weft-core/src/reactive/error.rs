//! Error taxonomy for the reactive engine.
//!
//! The engine has exactly two failure conditions of its own: a derived cell
//! reading itself while it computes, and a flush that refuses to settle.
//! Everything else is a user compute or effect function failing, which the
//! engine carries through untouched.

use std::sync::Arc;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Errors surfaced by reactive reads, writes, and flushes.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A derived cell's compute function read the cell itself, directly or
    /// through another cell, while its computation was already in progress.
    #[error("circular dependency detected while computing a derived value")]
    CircularDependency,

    /// The flush loop failed to converge within its iteration ceiling. The
    /// pending recomputation queue has been discarded; affected cells remain
    /// dirty and will recompute if read again.
    #[error("flush did not settle within {limit} iterations, dependency cycle suspected")]
    MaxFlushIterationsExceeded { limit: usize },

    /// A compute or effect function failed with a plain message.
    #[error("{0}")]
    Message(String),

    /// A compute or effect function failed with a caller-supplied error.
    #[error(transparent)]
    User(#[from] Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl ReactiveError {
    /// Wrap a caller error for propagation through the graph.
    pub fn user(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::User(Arc::new(err))
    }

    /// Build a message-only failure.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_render() {
        let err = ReactiveError::message("boom");
        assert_eq!(err.to_string(), "boom");

        let err = ReactiveError::MaxFlushIterationsExceeded { limit: 1000 };
        assert!(err.to_string().contains("1000"));
    }

    #[test]
    fn user_errors_pass_through() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = ReactiveError::user(io);
        assert!(err.to_string().contains("disk on fire"));
    }
}
