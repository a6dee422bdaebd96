use thiserror::Error;

use crate::policy::{Inheritance, ScopePolicy};

/// Rejected cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unsupported scope policy `{0}` (only `once_per_test` is available)")]
    UnsupportedScope(ScopePolicy),

    #[error("unsupported inheritance policy `{0}` (only `yes` is available)")]
    UnsupportedInheritance(Inheritance),

    #[error("unknown policy name `{0}`")]
    UnknownPolicy(String),
}

/// Failure of a single lookup.
///
/// `E` is the creator's own error type; it is passed through untouched.
#[derive(Debug, Error)]
pub enum CacheError<E> {
    #[error(transparent)]
    Creator(E),

    /// The creator called back into the cache that is running it.
    #[error("re-entrant lookup from inside the creator (context {context})")]
    Reentrant { context: String },

    /// The parent chain came back to a context it had already visited.
    #[error("context {context} is its own ancestor")]
    CyclicContext { context: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
