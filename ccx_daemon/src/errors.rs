#![deny(clippy::unwrap_used)]

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to parse command line: {0}")]
    ParseError(String),

    #[error("invalid command: {0}")]
    LocalEnvironmentError(String),

    #[error("failed to read or hash input {path}: {source}")]
    InputUploadError {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("remote exec failed (http {http_status}): {message}")]
    RemoteExecError {
        http_status: u16,
        message: String,
        // 5xx and mid-response disconnects are retryable; 4xx is not.
        retryable: bool,
    },

    #[error("server reported {0} missing input(s)")]
    MissingInputs(usize),

    #[error("compiler spec mismatch: {0}")]
    CommandSpecMismatch(String),

    #[error("failed to download output {path}: {source}")]
    OutputDownloadError {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to commit output {path}: {source}")]
    OutputCommitError {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("client disconnected before reply")]
    ClientCanceled,

    #[error("task timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("verify_output mismatch at byte offset {offset}")]
    VerifyOutputMismatch { offset: u64 },
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::RemoteExecError { retryable, .. } => *retryable,
            EngineError::MissingInputs(_) => true,
            EngineError::InputUploadError { .. } => true,
            _ => false,
        }
    }
}
