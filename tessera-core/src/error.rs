//! Error types shared by the whole engine.

use std::sync::Arc;

use thiserror::Error;

/// Errors raised by the graph engine and by node evaluation bodies.
///
/// Evaluation and job failures are carried back to whichever call started the
/// work. Misuse errors are raised immediately and never deferred into a flush.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An evaluation body failed with a plain message.
    #[error("{0}")]
    Custom(String),

    /// An evaluation body failed with an underlying error.
    #[error("evaluation failed: {0}")]
    Failed(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A node (transitively) depends on itself.
    #[error("circular dependency detected at `{0}`")]
    Cycle(String),

    /// Two different templates produced the same node id.
    #[error("node id `{id}` is already registered by a different template")]
    IdCollision { id: String },

    /// An operation that only makes sense inside an evaluation ran outside one.
    #[error("`{operation}` called outside of an active evaluation")]
    NoActiveEvaluation { operation: &'static str },

    /// The handle refers to a node that no longer exists.
    #[error("node `{0}` does not exist or has been destroyed")]
    NodeNotFound(String),

    /// The node kind does not accept direct writes of this value.
    #[error("node `{0}` does not accept this write")]
    NotWritable(String),

    /// A read expected a different value type.
    #[error("node `{id}` does not hold a value of type `{expected}`")]
    TypeMismatch { id: String, expected: &'static str },

    /// A registered override has different params/output types than the template.
    #[error("override for `{key}` does not match the overridden template's types")]
    OverrideMismatch { key: String },

    /// Params hashing, dehydration or hydration failed to (de)serialize.
    #[error("failed to serialize `{id}`: {message}")]
    Serialization { id: String, message: String },

    /// A flush ran more jobs than `max_jobs_per_flush` allows.
    #[error("flush aborted after running {0} jobs")]
    FlushLimit(usize),
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Build an evaluation error from a message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Custom(message.to_string())
    }

    /// Wrap an arbitrary error raised by an evaluation body.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(error))
    }

    pub(crate) fn serialization(id: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Serialization {
            id: id.into(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_render() {
        assert_eq!(Error::msg("boom").to_string(), "boom");
        assert_eq!(
            Error::Cycle("a".into()).to_string(),
            "circular dependency detected at `a`"
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(Error::failed(io).to_string(), "evaluation failed: disk");
    }

    #[test]
    fn errors_are_cloneable() {
        let error = Error::failed(std::fmt::Error);
        let copy = error.clone();
        assert_eq!(error.to_string(), copy.to_string());
    }
}
