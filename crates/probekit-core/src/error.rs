//! Error taxonomy for the harness.

use serde::{Deserialize, Serialize};

/// A failure raised by test code itself.
///
/// `kind` names the original failure type (`assertion`, `panic`, or whatever
/// the test reported) so the calling harness sees the failure as it was
/// raised, not as a transport or lookup wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TestFailure {
    pub kind: String,
    pub message: String,
}

impl TestFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Failure raised by an assertion inside a test.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new("assertion", message)
    }

    /// Failure produced by a panicking test function.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new("panic", message)
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced while configuring, running or driving test containers.
#[derive(Debug, thiserror::Error)]
pub enum ExamError {
    /// Malformed or missing options; always raised at build/prepare time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A runtime control call failed; the original cause is kept as source.
    #[error("container error: {message}")]
    Container {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{what} not reached within {timeout_ms} ms")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("unknown test target: {0}")]
    UnknownTarget(String),

    /// The test method itself failed.
    #[error(transparent)]
    Invocation(TestFailure),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExamError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ExamError::Configuration(message.into())
    }

    pub fn container(message: impl Into<String>) -> Self {
        ExamError::Container {
            message: message.into(),
            source: None,
        }
    }

    pub fn container_caused_by(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ExamError::Container {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn timeout(what: impl Into<String>, timeout: std::time::Duration) -> Self {
        ExamError::Timeout {
            what: what.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// The test failure carried by this error, if it is one.
    pub fn test_failure(&self) -> Option<&TestFailure> {
        match self {
            ExamError::Invocation(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type for harness operations.
pub type ExamResult<T> = std::result::Result<T, ExamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_error_displays_original_failure() {
        let err = ExamError::Invocation(TestFailure::assertion("expected 3, got 4"));
        assert_eq!(err.to_string(), "assertion: expected 3, got 4");
        assert_eq!(err.test_failure().unwrap().kind, "assertion");
    }

    #[test]
    fn test_container_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "bundle.jar");
        let err = ExamError::container_caused_by("install failed", io);
        assert!(err.to_string().contains("install failed"));
        let source = std::error::Error::source(&err).expect("source kept");
        assert!(source.to_string().contains("bundle.jar"));
    }

    #[test]
    fn test_timeout_reports_limit() {
        let err = ExamError::timeout("start level 15", std::time::Duration::from_millis(250));
        assert_eq!(err.to_string(), "start level 15 not reached within 250 ms");
    }
}
