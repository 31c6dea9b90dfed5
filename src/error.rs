//! Run-level error taxonomy
//!
//! Components use `anyhow` internally; these variants are the errors
//! that change what the run as a whole does. Only `Config` is fatal
//! before a run starts. `Clone` and `Push` end the run with a FAILED
//! report, `Runner` ends the loop, and the rest are recovered locally
//! and recorded in the fix debug maps.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("clone failed: {0}")]
    Clone(String),

    #[error("push failed: {0}")]
    Push(String),

    #[error("test runner failed: {0}")]
    Runner(String),

    #[error("provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("{checker} rejected patch: {message}")]
    Validation { checker: String, message: String },

    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),
}

impl AgentError {
    /// Short label used in debug maps and timeline entries.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::Clone(_) => "clone",
            AgentError::Push(_) => "push",
            AgentError::Runner(_) => "runner",
            AgentError::Provider { .. } => "provider",
            AgentError::Validation { .. } => "validation",
            AgentError::Timeout(..) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_detail() {
        let err = AgentError::Validation {
            checker: "py_compile".to_string(),
            message: "invalid syntax at line 3".to_string(),
        };
        assert!(err.to_string().contains("py_compile"));
        assert!(err.to_string().contains("line 3"));
        assert_eq!(err.kind(), "validation");
    }
}
