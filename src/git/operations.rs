//! Asynchronous git operation tracking.
//!
//! Every operation runs as its own tokio task with a cancellation signal
//! wired into the git process it spawns. The manager keeps a registry of
//! running operations:
//! - Ids come from an atomic counter plus a per-manager nonce
//! - Registry access is serialized through one mutex, never held across `.await`
//! - Handles leave the registry on completion, failure or cancellation
//! - Each outcome is delivered once through the [`OperationTicket`]

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::GitError;
use super::porcelain::WorktreeRecord;
use super::runner::{cancel_pair, CancelHandle, CommandResult};
use super::service::{require_path, validate_create, validate_remove, GitService};
use crate::config::GitConfig;

/// Prefix of every operation id
pub const OPERATION_ID_PREFIX: &str = "git_op_";

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Kinds of git operations that can run in the background
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ListWorktrees,
    CreateWorktree,
    RemoveWorktree,
    FetchRemote,
    ListBranches,
    CheckUncommitted,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ListWorktrees => "list_worktrees",
            OperationKind::CreateWorktree => "create_worktree",
            OperationKind::RemoveWorktree => "remove_worktree",
            OperationKind::FetchRemote => "fetch_remote",
            OperationKind::ListBranches => "list_branches",
            OperationKind::CheckUncommitted => "check_uncommitted",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a tracked operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// A git operation together with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOperation {
    ListWorktrees {
        repo_path: PathBuf,
    },
    CreateWorktree {
        repo_path: PathBuf,
        worktree_path: PathBuf,
        branch: String,
    },
    RemoveWorktree {
        worktree_path: PathBuf,
        force: bool,
    },
    FetchRemote {
        repo_path: PathBuf,
    },
    ListBranches {
        repo_path: PathBuf,
    },
    CheckUncommitted {
        path: PathBuf,
    },
}

impl GitOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            GitOperation::ListWorktrees { .. } => OperationKind::ListWorktrees,
            GitOperation::CreateWorktree { .. } => OperationKind::CreateWorktree,
            GitOperation::RemoveWorktree { .. } => OperationKind::RemoveWorktree,
            GitOperation::FetchRemote { .. } => OperationKind::FetchRemote,
            GitOperation::ListBranches { .. } => OperationKind::ListBranches,
            GitOperation::CheckUncommitted { .. } => OperationKind::CheckUncommitted,
        }
    }

    /// Check arguments the same way the service would, before anything runs
    pub fn validate(&self) -> Result<(), GitError> {
        match self {
            GitOperation::ListWorktrees { repo_path }
            | GitOperation::FetchRemote { repo_path }
            | GitOperation::ListBranches { repo_path } => {
                require_path(repo_path, "repository path")
            }
            GitOperation::CreateWorktree {
                repo_path,
                worktree_path,
                branch,
            } => validate_create(repo_path, worktree_path, branch),
            GitOperation::RemoveWorktree { worktree_path, .. } => validate_remove(worktree_path),
            GitOperation::CheckUncommitted { path } => require_path(path, "path"),
        }
    }
}

/// A listed worktree together with its working-tree state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeStatus {
    #[serde(flatten)]
    pub record: WorktreeRecord,
    /// False for bare entries and when the check itself failed
    pub has_uncommitted_changes: bool,
}

/// Data produced by a finished operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Worktrees(Vec<WorktreeStatus>),
    Command(CommandResult),
    Branches(Vec<String>),
    Uncommitted(bool),
}

impl OperationOutput {
    fn succeeded(&self) -> bool {
        match self {
            OperationOutput::Command(result) => result.success,
            _ => true,
        }
    }
}

/// Final report of an operation, delivered once through its ticket
#[derive(Debug)]
pub struct OperationOutcome {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// `Err(GitError::Cancelled)` whenever `status` is `Cancelled`
    pub result: Result<OperationOutput, GitError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Lifecycle notifications for subscribers (progress bars, status lines)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    Started {
        id: String,
        kind: OperationKind,
    },
    Progress {
        id: String,
        message: String,
        percent: u8,
    },
    Finished {
        id: String,
        kind: OperationKind,
        status: OperationStatus,
    },
}

/// Point-in-time view of a running operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationSnapshot {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
}

/// Registry entry for one in-flight operation.
///
/// Only running operations are registered; every terminal transition
/// removes the entry under the registry lock.
struct OperationHandle {
    kind: OperationKind,
    started_at: DateTime<Utc>,
    /// Start order, used to list operations in insertion order
    sequence: u64,
    cancel: CancelHandle,
}

type RegistryMap = HashMap<String, OperationHandle>;
type Registry = Arc<Mutex<RegistryMap>>;

fn lock(registry: &Mutex<RegistryMap>) -> MutexGuard<'_, RegistryMap> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returned by [`OperationManager::start_operation`]; resolves to the outcome
#[derive(Debug)]
pub struct OperationTicket {
    id: String,
    receiver: oneshot::Receiver<OperationOutcome>,
}

impl OperationTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the operation to finish
    pub async fn outcome(self) -> Result<OperationOutcome, GitError> {
        let Self { id, receiver } = self;
        receiver.await.map_err(|_| GitError::OperationLost(id))
    }
}

/// Runs git operations in the background and tracks them by id.
///
/// Must be used from within a tokio runtime.
pub struct OperationManager {
    service: GitService,
    registry: Registry,
    counter: AtomicU64,
    nonce: String,
    events: broadcast::Sender<OperationEvent>,
    fetch_on_create: bool,
}

impl OperationManager {
    pub fn new(service: GitService) -> Self {
        Self::with_options(service, true, DEFAULT_EVENT_CAPACITY)
    }

    /// Manager over the system git binary, configured from `config`
    pub fn from_config(config: &GitConfig) -> Self {
        Self::with_options(
            GitService::new(config),
            config.fetch_on_create,
            config.event_capacity,
        )
    }

    pub fn with_options(service: GitService, fetch_on_create: bool, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let mut nonce = Uuid::new_v4().simple().to_string();
        nonce.truncate(8);

        Self {
            service,
            registry: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            nonce,
            events,
            fetch_on_create,
        }
    }

    pub fn service(&self) -> &GitService {
        &self.service
    }

    /// Receive lifecycle events for operations started after this call
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    fn next_id(&self) -> (u64, String) {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        (
            sequence,
            format!("{OPERATION_ID_PREFIX}{sequence}_{}", self.nonce),
        )
    }

    /// Validate and launch `operation`, returning as soon as it is registered
    pub fn start_operation(&self, operation: GitOperation) -> Result<OperationTicket, GitError> {
        operation.validate()?;

        let kind = operation.kind();
        let (sequence, id) = self.next_id();
        let (cancel, signal) = cancel_pair();
        let (sender, receiver) = oneshot::channel();
        let started_at = Utc::now();

        lock(&self.registry).insert(
            id.clone(),
            OperationHandle {
                kind,
                started_at,
                sequence,
                cancel,
            },
        );

        info!(%id, %kind, "Started git operation");
        let _ = self.events.send(OperationEvent::Started {
            id: id.clone(),
            kind,
        });

        let task = OperationTask {
            id: id.clone(),
            kind,
            started_at,
            service: self.service.with_cancel(signal),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            fetch_on_create: self.fetch_on_create,
        };
        tokio::spawn(task.run(operation, sender));

        Ok(OperationTicket { id, receiver })
    }

    pub fn list_worktrees_async(&self, repo_path: impl Into<PathBuf>) -> Result<OperationTicket, GitError> {
        self.start_operation(GitOperation::ListWorktrees {
            repo_path: repo_path.into(),
        })
    }

    pub fn create_worktree_async(
        &self,
        repo_path: impl Into<PathBuf>,
        worktree_path: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Result<OperationTicket, GitError> {
        self.start_operation(GitOperation::CreateWorktree {
            repo_path: repo_path.into(),
            worktree_path: worktree_path.into(),
            branch: branch.into(),
        })
    }

    pub fn remove_worktree_async(
        &self,
        worktree_path: impl Into<PathBuf>,
        force: bool,
    ) -> Result<OperationTicket, GitError> {
        self.start_operation(GitOperation::RemoveWorktree {
            worktree_path: worktree_path.into(),
            force,
        })
    }

    pub fn fetch_remote_async(&self, repo_path: impl Into<PathBuf>) -> Result<OperationTicket, GitError> {
        self.start_operation(GitOperation::FetchRemote {
            repo_path: repo_path.into(),
        })
    }

    pub fn list_branches_async(&self, repo_path: impl Into<PathBuf>) -> Result<OperationTicket, GitError> {
        self.start_operation(GitOperation::ListBranches {
            repo_path: repo_path.into(),
        })
    }

    /// Ids of running operations, in start order
    pub fn get_active_operations(&self) -> Vec<String> {
        let registry = lock(&self.registry);
        let mut running: Vec<(&String, &OperationHandle)> = registry.iter().collect();
        running.sort_by_key(|(_, handle)| handle.sequence);
        running.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_operation_active(&self, id: &str) -> bool {
        lock(&self.registry).contains_key(id)
    }

    pub fn operation(&self, id: &str) -> Option<OperationSnapshot> {
        lock(&self.registry).get(id).map(|handle| OperationSnapshot {
            id: id.to_string(),
            kind: handle.kind,
            status: OperationStatus::Running,
            started_at: handle.started_at,
        })
    }

    /// Cancel a running operation and kill its git process.
    ///
    /// Returns false for unknown or already finished ids.
    pub fn cancel_operation(&self, id: &str) -> bool {
        // Removal is the transition to Cancelled; the task sees the missing
        // entry when it settles and reports Cancelled itself.
        let Some(handle) = lock(&self.registry).remove(id) else {
            debug!(%id, "No running operation to cancel");
            return false;
        };

        let delivered = handle.cancel.cancel();
        if delivered {
            info!(
                %id,
                kind = %handle.kind,
                running_ms = (Utc::now() - handle.started_at).num_milliseconds(),
                "Cancelled git operation"
            );
        } else {
            warn!(%id, "Operation finished before the cancel signal arrived");
        }
        delivered
    }

    /// Cancel everything still running; returns how many were cancelled
    pub fn cancel_all_operations(&self) -> usize {
        let cancelled = self
            .get_active_operations()
            .iter()
            .filter(|id| self.cancel_operation(id))
            .count();
        if cancelled > 0 {
            info!(cancelled, "Cancelled all active git operations");
        }
        cancelled
    }

    pub fn shutdown(&self) {
        self.cancel_all_operations();
        info!("Operation manager shut down");
    }
}

impl Drop for OperationManager {
    fn drop(&mut self) {
        // Leave no git processes behind the manager
        self.cancel_all_operations();
    }
}

/// State moved into the spawned task of one operation
struct OperationTask {
    id: String,
    kind: OperationKind,
    started_at: DateTime<Utc>,
    /// Service bound to this operation's cancel signal
    service: GitService,
    registry: Registry,
    events: broadcast::Sender<OperationEvent>,
    fetch_on_create: bool,
}

impl OperationTask {
    async fn run(self, operation: GitOperation, sender: oneshot::Sender<OperationOutcome>) {
        let result = self.execute(operation).await;

        // The service (and with it the cancel receiver) stays alive until the
        // registry has been updated, so a concurrent cancel is always delivered.
        let status = self.settle(&result);
        let result = match status {
            OperationStatus::Cancelled => Err(GitError::Cancelled),
            _ => result,
        };

        match (&status, &result) {
            (OperationStatus::Completed, _) => {
                info!(id = %self.id, kind = %self.kind, "Git operation completed");
            }
            (OperationStatus::Failed, Err(e)) => {
                warn!(id = %self.id, kind = %self.kind, "Git operation failed: {}", e);
            }
            _ => {
                info!(id = %self.id, kind = %self.kind, ?status, "Git operation finished");
            }
        }

        let _ = self.events.send(OperationEvent::Finished {
            id: self.id.clone(),
            kind: self.kind,
            status,
        });

        let outcome = OperationOutcome {
            id: self.id.clone(),
            kind: self.kind,
            status,
            result,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        if sender.send(outcome).is_err() {
            debug!(id = %self.id, "Outcome receiver dropped");
        }
    }

    /// Remove the handle and decide the terminal status
    fn settle(&self, result: &Result<OperationOutput, GitError>) -> OperationStatus {
        let mut registry = lock(&self.registry);
        match registry.remove(&self.id) {
            // Already removed by cancel_operation
            None => OperationStatus::Cancelled,
            Some(_) => match result {
                Ok(output) if output.succeeded() => OperationStatus::Completed,
                Err(GitError::Cancelled) => OperationStatus::Cancelled,
                _ => OperationStatus::Failed,
            },
        }
    }

    fn progress(&self, message: impl Into<String>, percent: u8) {
        let message = message.into();
        debug!(id = %self.id, percent, "{}", message);
        let _ = self.events.send(OperationEvent::Progress {
            id: self.id.clone(),
            message,
            percent,
        });
    }

    /// Dirty check for one listed worktree; only cancellation is an error
    async fn worktree_dirty(&self, record: &WorktreeRecord) -> Result<bool, GitError> {
        // Bare entries have no working tree to inspect
        if record.is_bare {
            return Ok(false);
        }

        match self
            .service
            .has_uncommitted_changes(Path::new(&record.path))
            .await
        {
            Ok(dirty) => Ok(dirty),
            Err(GitError::Cancelled) => Err(GitError::Cancelled),
            Err(e) => {
                warn!(
                    id = %self.id,
                    path = %record.path,
                    "Failed to check uncommitted changes: {}",
                    e
                );
                Ok(false)
            }
        }
    }

    async fn execute(&self, operation: GitOperation) -> Result<OperationOutput, GitError> {
        match operation {
            GitOperation::ListWorktrees { repo_path } => {
                self.progress("Listing worktrees...", 10);
                let records = self.service.list_worktrees(&repo_path).await?;

                self.progress("Processing worktree information...", 50);
                let total = records.len();
                let mut worktrees = Vec::with_capacity(total);
                for (index, record) in records.into_iter().enumerate() {
                    if self.service.is_cancelled() {
                        return Err(GitError::Cancelled);
                    }
                    let has_uncommitted_changes = self.worktree_dirty(&record).await?;
                    self.progress(
                        format!("Checked {}", record.path),
                        (50 + 45 * (index + 1) / total) as u8,
                    );
                    worktrees.push(WorktreeStatus {
                        record,
                        has_uncommitted_changes,
                    });
                }

                self.progress("Complete", 100);
                Ok(OperationOutput::Worktrees(worktrees))
            }
            GitOperation::CreateWorktree {
                repo_path,
                worktree_path,
                branch,
            } => {
                if self.fetch_on_create {
                    self.progress("Fetching latest changes...", 20);
                    // Creation proceeds on stale refs rather than failing
                    match self.service.fetch_remote(&repo_path).await {
                        Ok(result) if !result.success => {
                            warn!(id = %self.id, error = %result.error, "Fetch before create failed");
                        }
                        Ok(_) => {}
                        Err(GitError::Cancelled) => return Err(GitError::Cancelled),
                        Err(e) => warn!(id = %self.id, "Fetch before create failed: {}", e),
                    }
                }

                self.progress(
                    format!("Creating worktree at {}...", worktree_path.display()),
                    60,
                );
                let result = self
                    .service
                    .create_worktree(&repo_path, &worktree_path, &branch)
                    .await?;
                self.progress("Complete", 100);
                Ok(OperationOutput::Command(result))
            }
            GitOperation::RemoveWorktree {
                worktree_path,
                force,
            } => {
                if !force && worktree_path.is_dir() {
                    self.progress("Checking worktree status...", 20);
                    if self.service.has_uncommitted_changes(&worktree_path).await? {
                        return Err(GitError::UncommittedChanges(worktree_path));
                    }
                }

                self.progress(
                    format!("Removing worktree at {}...", worktree_path.display()),
                    70,
                );
                let result = self.service.remove_worktree(&worktree_path, force).await?;
                self.progress("Complete", 100);
                Ok(OperationOutput::Command(result))
            }
            GitOperation::FetchRemote { repo_path } => {
                self.progress("Fetching from remote repositories...", 50);
                let result = self.service.fetch_remote(&repo_path).await?;
                self.progress("Complete", 100);
                Ok(OperationOutput::Command(result))
            }
            GitOperation::ListBranches { repo_path } => {
                self.progress("Getting branch list...", 50);
                let branches = self.service.list_branches(&repo_path).await?;
                self.progress("Complete", 100);
                Ok(OperationOutput::Branches(branches))
            }
            GitOperation::CheckUncommitted { path } => {
                self.progress("Checking for uncommitted changes...", 50);
                let dirty = self.service.has_uncommitted_changes(&path).await?;
                self.progress("Complete", 100);
                Ok(OperationOutput::Uncommitted(dirty))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::mock::MockGitRunner;
    use crate::git::runner::{CancelSignal, GitRunner, SystemGitRunner};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    const MISSING_WORKTREE: &str = "/tmp/wt-manager-tests/does-not-exist/feature";

    fn manager() -> (OperationManager, Arc<MockGitRunner>) {
        let mock = Arc::new(MockGitRunner::new());
        let service = GitService::with_runner(mock.clone(), Duration::from_secs(10));
        (OperationManager::with_options(service, true, 16), mock)
    }

    fn counter_of(id: &str) -> u64 {
        id.strip_prefix(OPERATION_ID_PREFIX)
            .and_then(|rest| rest.split('_').next())
            .and_then(|n| n.parse().ok())
            .unwrap()
    }

    async fn finish(ticket: OperationTicket) -> OperationOutcome {
        tokio::time::timeout(Duration::from_secs(5), ticket.outcome())
            .await
            .expect("operation did not finish in time")
            .expect("outcome lost")
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (manager, mock) = manager();
        assert!(manager.get_active_operations().is_empty());
        assert!(!manager.is_operation_active("git_op_1_deadbeef"));
        assert!(!manager.cancel_operation("nonexistent_operation"));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_operation_id() {
        let (manager, _mock) = manager();
        let (_, id1) = manager.next_id();
        let (_, id2) = manager.next_id();

        assert_ne!(id1, id2);
        assert!(id1.starts_with("git_op_1_"));
        assert!(id2.starts_with("git_op_2_"));
        // Same nonce for the lifetime of the manager
        assert_eq!(id1.rsplit('_').next(), id2.rsplit('_').next());
    }

    #[tokio::test]
    async fn test_ids_unique_across_threads() {
        let (manager, _mock) = manager();
        let manager = &manager;
        let ids: Vec<String> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(move || (0..100).map(|_| manager.next_id().1).collect::<Vec<_>>())
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 800);
    }

    #[tokio::test]
    async fn test_back_to_back_starts_have_increasing_ids() {
        let (manager, mock) = manager();
        mock.hang(&["worktree", "list"]);

        let first = manager.list_worktrees_async("/repo").unwrap();
        let second = manager.list_worktrees_async("/repo").unwrap();
        assert!(counter_of(first.id()) < counter_of(second.id()));
        assert_eq!(
            manager.get_active_operations(),
            vec![first.id().to_string(), second.id().to_string()]
        );

        assert_eq!(manager.cancel_all_operations(), 2);
    }

    #[tokio::test]
    async fn test_list_worktrees_completes() {
        let (manager, mock) = manager();
        mock.respond_ok(
            &["worktree", "list", "--porcelain"],
            "worktree /repo\nHEAD abcd\nbranch refs/heads/main\n",
        );

        let ticket = manager.list_worktrees_async("/repo").unwrap();
        let id = ticket.id().to_string();
        let outcome = finish(ticket).await;

        assert_eq!(outcome.id, id);
        assert_eq!(outcome.kind, OperationKind::ListWorktrees);
        assert_eq!(outcome.status, OperationStatus::Completed);
        match outcome.result.unwrap() {
            OperationOutput::Worktrees(worktrees) => {
                assert_eq!(worktrees.len(), 1);
                assert_eq!(worktrees[0].record.branch, "main");
                assert!(!worktrees[0].has_uncommitted_changes);
            }
            other => panic!("unexpected output: {other:?}"),
        }

        assert!(!manager.is_operation_active(&id));
        assert!(manager.get_active_operations().is_empty());
        // Finished operations cannot be cancelled
        assert!(!manager.cancel_operation(&id));
    }

    #[tokio::test]
    async fn test_cancel_running_operation() {
        let (manager, mock) = manager();
        mock.hang(&["worktree", "list"]);

        let ticket = manager.list_worktrees_async("/repo").unwrap();
        let id = ticket.id().to_string();
        assert!(manager.is_operation_active(&id));
        assert_eq!(
            manager.operation(&id).map(|s| s.status),
            Some(OperationStatus::Running)
        );

        assert!(manager.cancel_operation(&id));
        assert!(!manager.is_operation_active(&id));
        assert!(manager.operation(&id).is_none());
        assert!(manager.get_active_operations().is_empty());
        assert!(!manager.cancel_operation(&id));

        let outcome = finish(ticket).await;
        assert_eq!(outcome.status, OperationStatus::Cancelled);
        assert!(matches!(outcome.result, Err(GitError::Cancelled)));
    }

    #[tokio::test]
    async fn test_validation_rejected_before_registration() {
        let (manager, mock) = manager();

        let err = manager
            .create_worktree_async("/repo", MISSING_WORKTREE, "")
            .unwrap_err();
        assert!(err.is_validation());

        let err = manager.remove_worktree_async("", true).unwrap_err();
        assert!(err.is_validation());

        assert!(manager.get_active_operations().is_empty());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_command_marks_operation_failed() {
        let (manager, mock) = manager();
        mock.respond_err(&["worktree", "add"], 128, "fatal: invalid reference: nope");

        let outcome = finish(
            manager
                .create_worktree_async("/repo", MISSING_WORKTREE, "nope")
                .unwrap(),
        )
        .await;

        assert_eq!(outcome.status, OperationStatus::Failed);
        match outcome.result.unwrap() {
            OperationOutput::Command(result) => assert_eq!(result.exit_code, 128),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_fetches_first_and_tolerates_fetch_failure() {
        let (manager, mock) = manager();
        mock.respond_err(&["fetch"], 1, "fatal: unable to access remote");

        let outcome = finish(
            manager
                .create_worktree_async("/repo", MISSING_WORKTREE, "feature")
                .unwrap(),
        )
        .await;
        assert_eq!(outcome.status, OperationStatus::Completed);

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, vec!["fetch", "--all"]);
        assert!(calls[1].starts_with(&["worktree", "add"]));
    }

    #[tokio::test]
    async fn test_create_without_fetch() {
        let mock = Arc::new(MockGitRunner::new());
        let service = GitService::with_runner(mock.clone(), Duration::from_secs(10));
        let manager = OperationManager::with_options(service, false, 16);

        finish(
            manager
                .create_worktree_async("/repo", MISSING_WORKTREE, "feature")
                .unwrap(),
        )
        .await;
        assert!(!mock.was_called_with(&["fetch"]));
    }

    #[tokio::test]
    async fn test_remove_dirty_worktree_is_refused() {
        let (manager, mock) = manager();
        let worktree = TempDir::new().unwrap();
        mock.respond_err(&["diff", "--quiet"], 1, "");

        let outcome = finish(manager.remove_worktree_async(worktree.path(), false).unwrap()).await;

        assert_eq!(outcome.status, OperationStatus::Failed);
        assert!(matches!(outcome.result, Err(GitError::UncommittedChanges(_))));
        assert!(!mock.was_called_with(&["worktree", "remove"]));
    }

    #[tokio::test]
    async fn test_forced_remove_skips_status_check() {
        let (manager, mock) = manager();
        let worktree = TempDir::new().unwrap();
        mock.respond_err(&["diff", "--quiet"], 1, "");

        let outcome = finish(manager.remove_worktree_async(worktree.path(), true).unwrap()).await;

        assert_eq!(outcome.status, OperationStatus::Completed);
        assert!(!mock.was_called_with(&["diff"]));
        assert!(mock.was_called_with(&["worktree", "remove", "--force"]));
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_other_operations() {
        let (manager, mock) = manager();
        mock.hang(&["fetch"]);
        mock.fail_spawn(&["branch"]);

        let fetch = manager.fetch_remote_async("/repo").unwrap();
        let branches = manager.list_branches_async("/repo").unwrap();

        let failed = finish(branches).await;
        assert_eq!(failed.status, OperationStatus::Failed);
        assert!(matches!(failed.result, Err(GitError::Spawn { .. })));

        assert!(manager.is_operation_active(fetch.id()));
        assert!(manager.cancel_operation(fetch.id()));
        assert_eq!(finish(fetch).await.status, OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let (manager, mock) = manager();
        mock.respond_ok(&["ls-files"], "scratch.txt");
        let mut events = manager.subscribe();

        let ticket = manager
            .start_operation(GitOperation::CheckUncommitted {
                path: PathBuf::from("/repo"),
            })
            .unwrap();
        let id = ticket.id().to_string();
        let outcome = finish(ticket).await;
        assert!(matches!(outcome.result, Ok(OperationOutput::Uncommitted(true))));

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        assert_eq!(
            received.first(),
            Some(&OperationEvent::Started {
                id: id.clone(),
                kind: OperationKind::CheckUncommitted,
            })
        );
        assert!(received
            .iter()
            .any(|e| matches!(e, OperationEvent::Progress { percent: 100, .. })));
        assert_eq!(
            received.last(),
            Some(&OperationEvent::Finished {
                id,
                kind: OperationKind::CheckUncommitted,
                status: OperationStatus::Completed,
            })
        );
    }

    #[tokio::test]
    async fn test_dropping_manager_cancels_operations() {
        let (manager, mock) = manager();
        mock.hang(&["fetch"]);

        let ticket = manager.fetch_remote_async(Path::new("/repo")).unwrap();
        drop(manager);

        assert_eq!(finish(ticket).await.status, OperationStatus::Cancelled);
    }

    #[test]
    fn test_operation_kind_names() {
        assert_eq!(OperationKind::ListWorktrees.to_string(), "list_worktrees");
        assert_eq!(
            GitOperation::RemoveWorktree {
                worktree_path: PathBuf::from("/wt"),
                force: false
            }
            .kind(),
            OperationKind::RemoveWorktree
        );
        assert!(OperationStatus::Cancelled.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
    }

    #[tokio::test]
    async fn test_list_worktrees_reports_uncommitted_changes() {
        let (manager, mock) = manager();
        mock.respond_ok(
            &["worktree", "list", "--porcelain"],
            "worktree /repo\nHEAD a1\nbranch refs/heads/main\n\n\
             worktree /wt/feature\nHEAD b2\nbranch refs/heads/feature\n\n\
             worktree /wt/gone\nHEAD c3\ndetached\n\n\
             worktree /bare\nbare\n",
        );
        mock.respond_in("/wt/feature", &["ls-files"], CommandResult::success("new.txt"));
        mock.fail_spawn_in("/wt/gone", &["diff"]);
        let mut events = manager.subscribe();

        let outcome = finish(manager.list_worktrees_async("/repo").unwrap()).await;
        assert_eq!(outcome.status, OperationStatus::Completed);
        let worktrees = match outcome.result {
            Ok(OperationOutput::Worktrees(worktrees)) => worktrees,
            other => panic!("unexpected result: {other:?}"),
        };

        let dirty: Vec<(&str, bool)> = worktrees
            .iter()
            .map(|wt| (wt.record.path.as_str(), wt.has_uncommitted_changes))
            .collect();
        assert_eq!(
            dirty,
            vec![
                ("/repo", false),
                ("/wt/feature", true),
                // A failed check reports clean
                ("/wt/gone", false),
                ("/bare", false),
            ]
        );
        assert!(!mock.calls().iter().any(|call| call.cwd == Path::new("/bare")));

        let mut checked = 0;
        while let Ok(event) = events.try_recv() {
            if let OperationEvent::Progress { message, .. } = event {
                if message.starts_with("Checked ") {
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 4);
    }

    #[tokio::test]
    async fn test_list_worktrees_cancel_skips_remaining_checks() {
        let (manager, mock) = manager();
        mock.respond_ok(
            &["worktree", "list"],
            "worktree /a\nbranch refs/heads/main\n\n\
             worktree /b\nbranch refs/heads/x\n\n\
             worktree /c\nbranch refs/heads/y\n",
        );
        mock.hang_in("/b", &["diff"]);

        let ticket = manager.list_worktrees_async("/a").unwrap();
        let id = ticket.id().to_string();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !mock.calls().iter().any(|call| call.cwd == Path::new("/b")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("check of /b never started");

        assert!(manager.cancel_operation(&id));
        let outcome = finish(ticket).await;
        assert_eq!(outcome.status, OperationStatus::Cancelled);
        assert!(!mock.calls().iter().any(|call| call.cwd == Path::new("/c")));
    }

    /// Holds `fetch` open until released; every other command goes to a real process
    struct PausingRunner {
        real: SystemGitRunner,
        fetched: Mutex<Option<oneshot::Sender<()>>>,
        resume: Mutex<Option<oneshot::Receiver<()>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl GitRunner for PausingRunner {
        fn executable(&self) -> &str {
            self.real.executable()
        }

        fn resolve_executable(&self) -> Result<PathBuf, GitError> {
            self.real.resolve_executable()
        }

        async fn run(
            &self,
            args: &[String],
            cwd: &Path,
            timeout: Duration,
            cancel: &CancelSignal,
        ) -> Result<CommandResult, GitError> {
            self.calls.lock().unwrap().push(args.to_vec());

            if args.first().is_some_and(|arg| arg == "fetch") {
                let fetched = self.fetched.lock().unwrap().take();
                if let Some(fetched) = fetched {
                    let _ = fetched.send(());
                }
                let resume = self.resume.lock().unwrap().take();
                if let Some(resume) = resume {
                    let _ = resume.await;
                }
                return Ok(CommandResult::success(""));
            }

            self.real.run(args, cwd, timeout, cancel).await
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_between_fetch_and_create_spawns_nothing() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("spawned");
        let fake_git = dir.path().join("fake-git");
        std::fs::write(
            &fake_git,
            format!("#!/bin/sh\ntouch '{}'\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&fake_git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (fetched_tx, fetched_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        let runner = Arc::new(PausingRunner {
            real: SystemGitRunner::new(fake_git.to_string_lossy()),
            fetched: Mutex::new(Some(fetched_tx)),
            resume: Mutex::new(Some(resume_rx)),
            calls: Mutex::new(Vec::new()),
        });
        let service = GitService::with_runner(runner.clone(), Duration::from_secs(10));
        let manager = OperationManager::with_options(service, true, 16);

        let ticket = manager
            .create_worktree_async(dir.path(), dir.path().join("wt"), "feature")
            .unwrap();
        let id = ticket.id().to_string();

        tokio::time::timeout(Duration::from_secs(5), fetched_rx)
            .await
            .expect("fetch never started")
            .unwrap();
        assert!(manager.cancel_operation(&id));
        resume_tx.send(()).unwrap();

        let outcome = finish(ticket).await;
        assert_eq!(outcome.status, OperationStatus::Cancelled);

        // The add reached the runner, but no process was started for it
        let calls = runner.calls.lock().unwrap().clone();
        assert!(calls
            .iter()
            .any(|args| args.len() > 1 && args[0] == "worktree" && args[1] == "add"));
        assert!(!marker.exists());
    }
}
