use probekit_core::{ExamError, FrameworkError};

/// Transport-level failures talking to a runtime host.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("cannot connect to runtime host at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime host closed the connection during {call}")]
    Closed { call: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Exam(#[from] ExamError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

impl From<RemoteError> for FrameworkError {
    fn from(e: RemoteError) -> Self {
        FrameworkError::Transport {
            message: e.to_string(),
        }
    }
}
