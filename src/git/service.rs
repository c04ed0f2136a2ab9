//! Git service: argument validation, command construction and output parsing.
//!
//! Each method awaits its git process and returns the parsed result directly.
//! Long-running calls that should not hold up the caller go through
//! [`OperationManager`](super::OperationManager) instead.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::error::GitError;
use super::porcelain::{parse_worktree_list, WorktreeRecord};
use super::runner::{format_command, CancelSignal, CommandResult, GitRunner, SystemGitRunner};
use super::version::GitVersion;
use crate::config::GitConfig;

/// `worktree list --porcelain` first shipped in git 2.7
pub const MIN_GIT_VERSION: (u32, u32) = (2, 7);

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().is_empty() || path.to_string_lossy().trim().is_empty()
}

/// Reject an empty path argument
pub(crate) fn require_path(path: &Path, what: &str) -> Result<(), GitError> {
    if is_blank(path) {
        return Err(GitError::validation(format!("{what} is required")));
    }
    Ok(())
}

/// Validate worktree creation arguments without touching git
pub(crate) fn validate_create(
    repo_path: &Path,
    worktree_path: &Path,
    branch: &str,
) -> Result<(), GitError> {
    if is_blank(repo_path) || is_blank(worktree_path) || branch.trim().is_empty() {
        return Err(GitError::validation(
            "repository path, worktree path, and branch are required",
        ));
    }
    if worktree_path.exists() {
        return Err(GitError::validation(format!(
            "worktree path already exists: {}",
            worktree_path.display()
        )));
    }
    Ok(())
}

/// Validate worktree removal arguments without touching git
pub(crate) fn validate_remove(worktree_path: &Path) -> Result<(), GitError> {
    require_path(worktree_path, "worktree path")
}

/// Walk up from `start` looking for a `.git` entry
fn find_git_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Git operations for worktree management.
///
/// Cheap to clone; clones share the runner and initialization state.
#[derive(Clone)]
pub struct GitService {
    runner: Arc<dyn GitRunner>,
    timeout: Duration,
    version: Arc<OnceLock<GitVersion>>,
    cancel: CancelSignal,
}

impl GitService {
    /// Create a service backed by the system git binary
    pub fn new(config: &GitConfig) -> Self {
        Self::with_runner(
            Arc::new(SystemGitRunner::new(config.executable.clone())),
            config.timeout(),
        )
    }

    pub fn with_runner(runner: Arc<dyn GitRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            version: Arc::new(OnceLock::new()),
            cancel: CancelSignal::never(),
        }
    }

    /// A handle on the same service whose commands stop when `cancel` fires
    pub fn with_cancel(&self, cancel: CancelSignal) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn executable(&self) -> &str {
        self.runner.executable()
    }

    /// Whether the git executable version check has succeeded
    pub fn is_initialized(&self) -> bool {
        self.version.get().is_some()
    }

    /// Git version found by [`initialize`](Self::initialize)
    pub fn version(&self) -> Option<&GitVersion> {
        self.version.get()
    }

    fn command_failed(&self, args: &[String], result: &CommandResult) -> GitError {
        GitError::CommandFailed {
            command: format_command(self.executable(), args),
            exit_code: result.exit_code,
            stderr: result.error.clone(),
        }
    }

    /// Whether this handle's cancel signal has fired
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Execute git with `args` in `cwd`; failures are returned as data
    pub async fn execute(&self, args: Vec<String>, cwd: &Path) -> Result<CommandResult, GitError> {
        self.runner.run(&args, cwd, self.timeout, &self.cancel).await
    }

    /// Probe the git executable and check its version. Idempotent.
    #[instrument(skip_all, fields(executable = %self.executable()))]
    pub async fn initialize(&self) -> Result<GitVersion, GitError> {
        if let Some(version) = self.version.get() {
            return Ok(version.clone());
        }

        let resolved = self.runner.resolve_executable()?;
        debug!(path = %resolved.display(), "Resolved git executable");

        let cwd = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
        let argv = args(&["--version"]);
        let result = self.execute(argv.clone(), &cwd).await?;
        if !result.success {
            return Err(self.command_failed(&argv, &result));
        }

        let version = GitVersion::parse(&result.output)
            .ok_or_else(|| GitError::UnrecognizedVersion(result.output.clone()))?;

        let (min_major, min_minor) = MIN_GIT_VERSION;
        if !version.meets_minimum(min_major, min_minor) {
            return Err(GitError::VersionTooOld {
                found: version.to_string(),
                required: format!("{min_major}.{min_minor}"),
            });
        }

        info!(version = %version, "Git service initialized");
        Ok(self.version.get_or_init(|| version).clone())
    }

    /// Check if `path` is inside a git repository. Never fails.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn is_git_repository(&self, path: &Path) -> bool {
        if is_blank(path) {
            return false;
        }

        match self.execute(args(&["rev-parse", "--git-dir"]), path).await {
            Ok(result) => result.success,
            Err(e) => {
                debug!("Repository check failed: {}", e);
                false
            }
        }
    }

    /// List all worktrees of a repository
    #[instrument(skip_all, fields(repo_path = %repo_path.display()))]
    pub async fn list_worktrees(&self, repo_path: &Path) -> Result<Vec<WorktreeRecord>, GitError> {
        require_path(repo_path, "repository path")?;

        let argv = args(&["worktree", "list", "--porcelain"]);
        let result = self.execute(argv.clone(), repo_path).await?;
        if !result.success {
            return Err(self.command_failed(&argv, &result));
        }

        let worktrees = parse_worktree_list(&result.output);
        debug!(count = worktrees.len(), "Listed worktrees");
        Ok(worktrees)
    }

    /// Add a worktree at `worktree_path` checking out `branch`
    #[instrument(skip_all, fields(repo_path = %repo_path.display(), worktree_path = %worktree_path.display(), branch = %branch))]
    pub async fn create_worktree(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<CommandResult, GitError> {
        validate_create(repo_path, worktree_path, branch)?;

        let mut argv = args(&["worktree", "add"]);
        argv.push(worktree_path.to_string_lossy().into_owned());
        argv.push(branch.to_string());

        let result = self.execute(argv, repo_path).await?;
        if result.success {
            info!("Created worktree");
        } else {
            warn!(error = %result.error, "Failed to create worktree");
        }
        Ok(result)
    }

    /// Remove a worktree, running git from its owning repository
    #[instrument(skip_all, fields(worktree_path = %worktree_path.display(), force = force))]
    pub async fn remove_worktree(
        &self,
        worktree_path: &Path,
        force: bool,
    ) -> Result<CommandResult, GitError> {
        validate_remove(worktree_path)?;

        let repo_root = self.repository_root(worktree_path).await?;

        let mut argv = args(&["worktree", "remove"]);
        if force {
            argv.push("--force".to_string());
        }
        argv.push(worktree_path.to_string_lossy().into_owned());

        let result = self.execute(argv, &repo_root).await?;
        if result.success {
            info!(repo_root = %repo_root.display(), "Removed worktree");
        } else {
            warn!(error = %result.error, "Failed to remove worktree");
        }
        Ok(result)
    }

    /// Find the main repository that owns `path`.
    ///
    /// Asks git for the common git dir first, then walks up for `.git`,
    /// then falls back to the parent directory. Only cancellation is an error.
    pub async fn repository_root(&self, path: &Path) -> Result<PathBuf, GitError> {
        if path.is_dir() {
            match self
                .execute(args(&["rev-parse", "--git-common-dir"]), path)
                .await
            {
                Ok(result) if result.success && !result.output.is_empty() => {
                    let common_dir = path.join(&result.output);
                    // Non-bare repositories keep their metadata in `<root>/.git`
                    let root = if common_dir.file_name().is_some_and(|name| name == ".git") {
                        common_dir.parent().map(Path::to_path_buf)
                    } else {
                        Some(common_dir)
                    };
                    if let Some(root) = root {
                        return Ok(root);
                    }
                }
                Ok(_) => {}
                Err(GitError::Cancelled) => return Err(GitError::Cancelled),
                Err(e) => debug!("git-common-dir lookup failed: {}", e),
            }
        }

        Ok(find_git_root(path)
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| path.to_path_buf()))
    }

    /// Fetch from all remotes
    #[instrument(skip_all, fields(repo_path = %repo_path.display()))]
    pub async fn fetch_remote(&self, repo_path: &Path) -> Result<CommandResult, GitError> {
        require_path(repo_path, "repository path")?;

        let result = self.execute(args(&["fetch", "--all"]), repo_path).await?;
        if result.success {
            info!("Fetched remote changes");
        }
        Ok(result)
    }

    /// Local branches followed by remote branches, without duplicates
    #[instrument(skip_all, fields(repo_path = %repo_path.display()))]
    pub async fn list_branches(&self, repo_path: &Path) -> Result<Vec<String>, GitError> {
        require_path(repo_path, "repository path")?;

        let local_args = args(&["branch", "--format=%(refname:short)"]);
        let local = self.execute(local_args.clone(), repo_path).await?;
        if !local.success {
            return Err(self.command_failed(&local_args, &local));
        }

        let remote = self
            .execute(args(&["branch", "-r", "--format=%(refname:short)"]), repo_path)
            .await?;

        let remote_branches: Vec<&str> = if remote.success {
            remote.output.lines().collect()
        } else {
            Vec::new()
        };

        let mut branches: Vec<String> = Vec::new();
        for branch in local
            .output
            .lines()
            .chain(remote_branches)
            .map(str::trim)
            .filter(|b| !b.is_empty() && !b.ends_with("/HEAD"))
        {
            if !branches.iter().any(|known| known == branch) {
                branches.push(branch.to_string());
            }
        }

        Ok(branches)
    }

    /// Current branch name, or `(<short hash>)` when detached
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn current_branch(&self, path: &Path) -> Result<String, GitError> {
        require_path(path, "path")?;

        let result = self.execute(args(&["branch", "--show-current"]), path).await?;
        if result.success && !result.output.is_empty() {
            return Ok(result.output);
        }

        let argv = args(&["rev-parse", "--short", "HEAD"]);
        let commit = self.execute(argv.clone(), path).await?;
        if commit.success {
            return Ok(format!("({})", commit.output));
        }

        Err(self.command_failed(&argv, &commit))
    }

    /// Check for staged, unstaged or untracked changes
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool, GitError> {
        require_path(path, "path")?;

        let staged = self.execute(args(&["diff", "--cached", "--quiet"]), path).await?;
        let unstaged = self.execute(args(&["diff", "--quiet"]), path).await?;
        let untracked = self
            .execute(args(&["ls-files", "--others", "--exclude-standard"]), path)
            .await?;

        Ok(!staged.success
            || !unstaged.success
            || (untracked.success && !untracked.output.is_empty()))
    }
}
