//! Error types shared by every layer of the persistence core

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by grant management, document sessions and versioning
#[derive(Debug, Error)]
pub enum FolioError {
    /// No usable grant covers the path, or the OS refused access
    #[error("permission denied for {}: {reason}", .path.display())]
    PermissionDenied { path: PathBuf, reason: String },

    #[error("not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// Subprocess output was not valid UTF-8
    #[error("output of `{command}` is not valid UTF-8")]
    Decode { command: String },

    /// External tool exited unsuccessfully; `output` is its merged stdout/stderr verbatim
    #[error("`{command}` failed with code {code:?}: {output}")]
    ToolFailure {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("commit message must not be empty")]
    EmptyCommitMessage,

    #[error("no external change is waiting for a decision")]
    NoConflictPending,

    /// Writes are blocked until the pending conflict is resolved
    #[error("an external change is waiting for a decision")]
    ConflictPending,

    #[error("document session is closed")]
    SessionClosed,

    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A background task was cancelled before finishing
    #[error("background task did not finish: {0}")]
    TaskCancelled(String),

    #[error("invalid grant token: {0}")]
    InvalidToken(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FolioError>;

impl FolioError {
    /// Map an I/O failure on `path` into the taxonomy, keeping NotFound and
    /// PermissionDenied distinct from generic I/O errors
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => FolioError::NotFound { path },
            std::io::ErrorKind::PermissionDenied => FolioError::PermissionDenied {
                path,
                reason: err.to_string(),
            },
            _ => FolioError::Io(err),
        }
    }

    /// Whether the user has to act (re-grant access, fix repository state)
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            FolioError::PermissionDenied { .. } | FolioError::ToolFailure { .. }
        )
    }
}

/// Unwrap a finished background task.
///
/// A panic inside the task is re-raised on the awaiting task; cancellation
/// becomes [`FolioError::TaskCancelled`].
pub(crate) fn joined<T>(result: std::result::Result<T, tokio::task::JoinError>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(FolioError::TaskCancelled(e.to_string())),
    }
}
