//! Git worktree management over the git CLI.
//!
//! - [`GitService`] runs git commands and parses their output
//! - [`OperationManager`] runs the same work as cancellable background tasks
//! - [`GitRunner`] is the process seam; [`MockGitRunner`] scripts it in tests

mod error;
mod mock;
mod operations;
mod porcelain;
mod runner;
mod service;
mod version;

pub use error::GitError;
pub use mock::{MockCall, MockGitRunner};
pub use operations::{
    GitOperation, OperationEvent, OperationKind, OperationManager, OperationOutcome,
    OperationOutput, OperationSnapshot, OperationStatus, OperationTicket, WorktreeStatus,
    OPERATION_ID_PREFIX,
};
pub use porcelain::{parse_worktree_list, WorktreeRecord, DETACHED_BRANCH};
pub use runner::{
    cancel_pair, CancelHandle, CancelSignal, CommandResult, GitRunner, SystemGitRunner,
    SIGNALLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
pub use service::{GitService, MIN_GIT_VERSION};
pub use version::GitVersion;
