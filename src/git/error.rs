//! Error types for git execution and operation tracking.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the git layer.
///
/// Ordinary git failures (non-zero exit, timeout) are not errors: they come
/// back as a [`CommandResult`](super::CommandResult) with `success == false`.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("failed to spawn '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("git executable '{0}' was not found in PATH")]
    ExecutableNotFound(String),

    #[error("git version {found} is below minimum required version {required}")]
    VersionTooOld { found: String, required: String },

    #[error("unrecognized git version output: {0}")]
    UnrecognizedVersion(String),

    #[error("{command} failed (exit code {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("worktree has uncommitted changes, use force removal to override: {}", .0.display())]
    UncommittedChanges(PathBuf),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("operation '{0}' ended without reporting a result")]
    OperationLost(String),
}

impl GitError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        GitError::Validation(message.into())
    }

    /// Check if this error was raised before any process was spawned
    pub fn is_validation(&self) -> bool {
        matches!(self, GitError::Validation(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GitError::Cancelled)
    }
}
