//! wt-manager - Git worktree management library
//!
//! Lists, creates and removes git worktrees by driving the git CLI, either
//! awaited directly through [`git::GitService`] or as tracked, cancellable
//! background operations through [`git::OperationManager`].

pub mod config;
pub mod git;
pub mod logging;

pub use config::Config;
pub use git::{GitError, GitService, OperationManager};
