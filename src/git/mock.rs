//! Scripted [`GitRunner`] for tests.
//!
//! Records every invocation so tests can assert which git commands ran (or
//! that none did), and answers with canned results matched by argument prefix.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::error::GitError;
use super::runner::{format_command, CancelSignal, CommandResult, GitRunner};

/// A git invocation seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl MockCall {
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        self.args.len() >= prefix.len() && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }
}

#[derive(Debug, Clone)]
enum MockResponse {
    Reply(CommandResult),
    /// Block until cancelled or timed out, like a stuck network call
    Hang,
    SpawnFailure,
}

#[derive(Debug, Clone)]
struct MockRule {
    /// Only match invocations in this directory
    cwd: Option<PathBuf>,
    prefix: Vec<String>,
    response: MockResponse,
}

impl MockRule {
    fn matches(&self, args: &[String], cwd: &Path) -> bool {
        self.cwd.as_deref().map_or(true, |dir| dir == cwd)
            && args.len() >= self.prefix.len()
            && args.iter().zip(&self.prefix).all(|(a, p)| a == p)
    }
}

/// Mock implementation for testing
pub struct MockGitRunner {
    executable: String,
    /// Later registrations take precedence
    responses: Arc<Mutex<Vec<MockRule>>>,
    /// Record of commands executed
    pub command_log: Arc<Mutex<Vec<MockCall>>>,
}

impl MockGitRunner {
    pub fn new() -> Self {
        Self {
            executable: "git".to_string(),
            responses: Arc::new(Mutex::new(Vec::new())),
            command_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Mock that reports `executable` as its binary name
    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::new()
        }
    }

    fn register(&self, prefix: &[&str], response: MockResponse) {
        self.register_rule(None, prefix, response);
    }

    fn register_rule(&self, cwd: Option<&Path>, prefix: &[&str], response: MockResponse) {
        self.responses.lock().unwrap().push(MockRule {
            cwd: cwd.map(Path::to_path_buf),
            prefix: prefix.iter().map(|s| (*s).to_string()).collect(),
            response,
        });
    }

    /// Like [`respond`](Self::respond), but only for commands run in `cwd`
    pub fn respond_in(&self, cwd: impl AsRef<Path>, prefix: &[&str], result: CommandResult) {
        self.register_rule(Some(cwd.as_ref()), prefix, MockResponse::Reply(result));
    }

    /// Make commands starting with `prefix` in `cwd` run until cancelled or timed out
    pub fn hang_in(&self, cwd: impl AsRef<Path>, prefix: &[&str]) {
        self.register_rule(Some(cwd.as_ref()), prefix, MockResponse::Hang);
    }

    /// Make commands starting with `prefix` in `cwd` fail to spawn
    pub fn fail_spawn_in(&self, cwd: impl AsRef<Path>, prefix: &[&str]) {
        self.register_rule(Some(cwd.as_ref()), prefix, MockResponse::SpawnFailure);
    }

    /// Answer commands starting with `prefix` with `result`
    pub fn respond(&self, prefix: &[&str], result: CommandResult) {
        self.register(prefix, MockResponse::Reply(result));
    }

    /// Answer with a successful exit carrying `output`
    pub fn respond_ok(&self, prefix: &[&str], output: &str) {
        self.respond(prefix, CommandResult::success(output));
    }

    /// Answer with a non-zero exit carrying `error`
    pub fn respond_err(&self, prefix: &[&str], exit_code: i32, error: &str) {
        self.respond(prefix, CommandResult::failure(exit_code, error));
    }

    /// Make commands starting with `prefix` run until cancelled or timed out
    pub fn hang(&self, prefix: &[&str]) {
        self.register(prefix, MockResponse::Hang);
    }

    /// Make commands starting with `prefix` fail to spawn
    pub fn fail_spawn(&self, prefix: &[&str]) {
        self.register(prefix, MockResponse::SpawnFailure);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.command_log.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.command_log.lock().unwrap().len()
    }

    /// Check whether any recorded command starts with `prefix`
    pub fn was_called_with(&self, prefix: &[&str]) -> bool {
        self.command_log
            .lock()
            .unwrap()
            .iter()
            .any(|call| call.starts_with(prefix))
    }

    fn response_for(&self, args: &[String], cwd: &Path) -> MockResponse {
        self.responses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|rule| rule.matches(args, cwd))
            .map(|rule| rule.response.clone())
            .unwrap_or_else(|| MockResponse::Reply(CommandResult::success("")))
    }
}

impl Default for MockGitRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitRunner for MockGitRunner {
    fn executable(&self) -> &str {
        &self.executable
    }

    fn resolve_executable(&self) -> Result<PathBuf, GitError> {
        Ok(PathBuf::from("/usr/bin").join(&self.executable))
    }

    async fn run(
        &self,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<CommandResult, GitError> {
        self.command_log.lock().unwrap().push(MockCall {
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
        });

        if cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }

        match self.response_for(args, cwd) {
            MockResponse::Reply(result) => Ok(result),
            MockResponse::SpawnFailure => Err(GitError::Spawn {
                executable: self.executable.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock spawn failure"),
            }),
            MockResponse::Hang => {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => Ok(CommandResult::timed_out(
                        timeout,
                        &format_command(&self.executable, args),
                    )),
                    () = cancel.cancelled() => Err(GitError::Cancelled),
                }
            }
        }
    }
}
