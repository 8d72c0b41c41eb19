//! Error taxonomy of the lowering pass.
//!
//! Every variant here is a compiler-internal invariant violation: either an
//! upstream pass handed us something it promised not to, or this pass broke
//! one of its own predictions. None of these are user-visible semantic
//! errors and none are recoverable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("function is not a closure iterator")]
    NotAClosureIterator,

    #[error("`for` loop reached the closure-iterator pass; loops must be desugared to `while` first")]
    ForLoopInInput,

    #[error("goto-state node found in the input AST; these are produced only by this pass")]
    GotoStateInInput,

    #[error("yield survived in expression position after normalisation")]
    YieldInExpression,

    #[error("yield is not followed by a state transition")]
    DanglingYield,

    #[error("state index prediction mismatch: expected {expected}, created {actual}")]
    StateIndexMismatch { expected: i32, actual: i32 },

    #[error("goto-state forwarding chain longer than the state count ({0})")]
    ForwardingCycle(usize),

    #[error("state count {0} exceeds the exception-table index range")]
    TooManyStates(usize),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type LowerResult<T> = Result<T, LowerError>;

impl From<anyhow::Error> for LowerError {
    fn from(err: anyhow::Error) -> Self {
        LowerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_offending_shape() {
        let err = LowerError::ForLoopInInput;
        assert!(err.to_string().contains("`for` loop"));

        let err = LowerError::StateIndexMismatch {
            expected: 3,
            actual: 5,
        };
        assert!(err.to_string().contains("expected 3"));
        assert!(err.to_string().contains("created 5"));
    }

    #[test]
    fn test_anyhow_interop() {
        let err: LowerError = anyhow::anyhow!("synthesis helper failed").into();
        assert!(matches!(err, LowerError::Internal(_)));
    }
}
