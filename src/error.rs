use std::path::PathBuf;

use thiserror::Error;

use crate::sink::SinkId;

/// Errors surfaced by the filtering engine.
///
/// Only `SourceUnavailable` is terminal for a view; everything else is
/// recoverable by the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The regex or fuzzy pattern could not be compiled. The pass is aborted
    /// before any index mutation.
    #[error("Invalid expression '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A line lookup failed because the source went away.
    #[error("Line {line} unavailable from source '{source_name}'")]
    SourceUnavailable { source_name: String, line: usize },

    /// The backing store of a cascading sink refused a write.
    #[error("Cascading sink {0} could not be written")]
    SinkWriteFailure(SinkId),

    /// Cooperative cancellation. Callers normally see this as a
    /// `TaskOutcome::Cancelled` carrying the partial result instead.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unknown cascading sink {0}")]
    UnknownSink(SinkId),

    #[error("Unknown view {0}")]
    UnknownView(u64),

    /// The view's coordinator stopped before the request was handled.
    #[error("View is closed")]
    ViewClosed,

    #[error("Failed to load config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Failed to persist view state: {0}")]
    Persistence(String),
}

impl EngineError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl ToString) -> Self {
        EngineError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error leaves the view in a state that needs reattachment.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineError::SourceUnavailable { .. })
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
