//! Error types for strata.
//!
//! Build-time errors (cycles, unresolved references, config problems) abort a
//! run before any provider call. Provider errors stay local to one node and
//! surface in the run report instead.

use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Failure reported by a resource provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub message: String,
    pub retryable: bool,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if self.retryable {
            write!(f, " (retryable)")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Main error type.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("dependency cycle detected involving: {}", members.join(", "))]
    CyclicDependency { members: Vec<String> },

    #[error("unresolved reference {token}: {reason}")]
    UnresolvedReference { token: String, reason: String },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("concurrent modification of state record {key}: {detail}")]
    ConcurrentModification { key: String, detail: String },

    #[error("output '{output}' of stack '{stack}' is unavailable to stack '{consumer}'")]
    OutputUnavailable {
        stack: String,
        output: String,
        consumer: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("parse error in {origin}: {reason}")]
    Parse { origin: String, reason: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("run finished with {failed} failed and {skipped} skipped node(s)")]
    RunFailed { failed: usize, skipped: usize },
}

impl StrataError {
    pub fn unresolved(token: impl ToString, reason: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            token: token.to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// True for errors detected while declaring or ordering stacks.
    pub fn is_build_time(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. }
                | Self::UnresolvedReference { .. }
                | Self::Config(_)
                | Self::Parse { .. }
        )
    }
}
