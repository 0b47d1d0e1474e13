//! Construction errors for ranks and rank groups.

use thiserror::Error;

/// Errors raised while building a rank or composing rank groups.
///
/// These are always reported at construction time, never deferred into a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("rank needs at least an executable")]
    EmptyArgs,
    #[error("argument contains a NUL byte: {0}")]
    NulByte(String),
    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvKey(String),
    #[error("cannot multiply a rank group by a negative factor ({0})")]
    NegativeFactor(i64),
    #[error("repeating a rank group {0} times does not fit in memory")]
    Overflow(i64),
}
