//! Error types.
//!
//! Structural problems (bad paths, name clashes, stale handles passed to
//! fallible operations, storage failures) are reported as [`FlowError`].
//! Failures inside function hooks are [`FunctionError`]s; the runner turns
//! those into `ErrorEvent` values instead of propagating them.

use std::ops::Range;

use thiserror::Error;

use crate::arena::BlockId;

pub type Result<T, E = FlowError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum FlowError {
    /// Malformed binding path.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        path: String,
        reason: String,
        /// Byte range of the offending segment.
        span: Range<usize>,
    },

    #[error("name '{0}' is already taken")]
    DuplicateName(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("'{0}' is not a folder")]
    NotAFolder(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("block {0:?} has been destroyed")]
    Destroyed(BlockId),

    #[error("no storage configured")]
    NoStorage,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl FlowError {
    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>, span: Range<usize>) -> Self {
        FlowError::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
            span,
        }
    }

    /// Byte span for path errors, used by diagnostics.
    pub fn span(&self) -> Option<Range<usize>> {
        match self {
            FlowError::InvalidPath { span, .. } => Some(span.clone()),
            _ => None,
        }
    }
}

/// Failure reported by a function hook.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct FunctionError {
    pub kind: String,
    pub message: String,
}

impl FunctionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Error kind used for panics caught around function hooks.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new("panic", message)
    }
}

impl From<FlowError> for FunctionError {
    fn from(error: FlowError) -> Self {
        FunctionError::new("flow", error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_error_keeps_span() {
        let error = FlowError::invalid_path("a..b", "empty segment", 2..2);
        assert_eq!(error.span(), Some(2..2));
        assert_eq!(error.to_string(), "invalid path 'a..b': empty segment");
    }

    #[test]
    fn flow_error_converts_into_function_error() {
        let error: FunctionError = FlowError::NotFound("x".into()).into();
        assert_eq!(error.kind, "flow");
        assert_eq!(error.message, "'x' not found");
    }
}
