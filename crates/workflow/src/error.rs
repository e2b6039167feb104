//! Error types for the workflow engine.
//!
//! Configuration and graph errors ([`Error::Configuration`], [`Error::Cycle`],
//! [`Error::MissingDependency`], [`Error::Render`]) abort a run before any
//! stage starts. Execution errors are recorded per stage and only halt the
//! failing adapter's dependents.

use crate::types::Phase;
use std::path::PathBuf;
use thiserror::Error;

/// Classification of a failed script attempt for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Likely to succeed on a later attempt (network fetch, timeout, EX_TEMPFAIL)
    Transient,
    /// Retrying will not help
    Permanent,
}

impl FailureClass {
    /// Whether this failure is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Get a user-friendly description of this class.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "Transient failure",
            Self::Permanent => "Permanent failure",
        }
    }
}

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing adapter field, or invalid engine input
    #[error("adapter '{adapter}': field '{field}': {message}")]
    Configuration {
        adapter: String,
        field: String,
        message: String,
    },

    /// The dependency graph contains a cycle
    #[error("dependency cycle between adapters: {}", format_cycle(.adapters))]
    Cycle { adapters: Vec<String> },

    /// An adapter depends on an id that is not part of the adapter set
    #[error("adapter '{adapter}' depends on '{dependency}', which is not loaded")]
    MissingDependency { adapter: String, dependency: String },

    /// Template expansion failed
    #[error("adapter '{adapter}': template '{template}' failed to render: {cause}")]
    Render {
        adapter: String,
        template: String,
        cause: String,
    },

    /// A script exited nonzero or timed out after retries were exhausted
    #[error("stage {stage} of adapter '{adapter}' ({phase}) failed after {attempts} attempt(s): {reason}")]
    ExecutionFailure {
        adapter: String,
        stage: String,
        phase: Phase,
        attempts: u32,
        exit_code: Option<i32>,
        reason: String,
        stderr: String,
    },

    /// A cached artifact entry does not hash back to its key
    #[error("artifact cache entry {key} is corrupt: {detail}")]
    CacheCorruption { key: String, detail: String },

    /// Any other artifact store failure
    #[error("artifact store: {0}")]
    Artifact(artifacts::Error),

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// A stage was asked to leave a terminal state
    #[error("stage {stage}: invalid status transition from {from} to {to}")]
    InvalidTransition {
        stage: String,
        from: String,
        to: String,
    },

    /// IO error
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(
        adapter: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            adapter: adapter.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// The adapter this error is attributed to, if any.
    pub fn adapter(&self) -> Option<&str> {
        match self {
            Self::Configuration { adapter, .. }
            | Self::MissingDependency { adapter, .. }
            | Self::Render { adapter, .. }
            | Self::ExecutionFailure { adapter, .. } => Some(adapter),
            _ => None,
        }
    }

    /// Whether this error is raised before any external side effect.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::Cycle { .. }
                | Self::MissingDependency { .. }
                | Self::Render { .. }
        )
    }
}

/// Render a cycle as `a -> b -> a`
fn format_cycle(adapters: &[String]) -> String {
    let mut rendered = adapters.join(" -> ");
    if let Some(first) = adapters.first() {
        rendered.push_str(" -> ");
        rendered.push_str(first);
    }
    rendered
}

impl From<artifacts::Error> for Error {
    fn from(err: artifacts::Error) -> Self {
        match err {
            artifacts::Error::CacheCorruption { key, detail } => Self::CacheCorruption { key, detail },
            other => Self::Artifact(other),
        }
    }
}

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, Error>;
