//! Parser for `git worktree list --porcelain`.
//!
//! The format is a sequence of blank-line separated blocks:
//!
//! ```text
//! worktree /path/to/main
//! HEAD 1f0a3c...
//! branch refs/heads/main
//!
//! worktree /path/to/review
//! HEAD 9b2e7d...
//! detached
//! ```
//!
//! Parsing is purely syntactic and never fails; unknown attribute lines
//! (`locked`, `prunable`, ...) are skipped. Paths are taken verbatim after
//! the `worktree ` prefix, surrounding spaces included.

use serde::{Deserialize, Serialize};

/// Branch name reported for worktrees that are not on a branch
pub const DETACHED_BRANCH: &str = "HEAD";

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// One entry from `git worktree list --porcelain`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    pub path: String,
    /// Full commit hash at HEAD, empty if git did not report one
    pub commit_hash: String,
    /// Short branch name, or [`DETACHED_BRANCH`]
    pub branch: String,
    pub is_detached: bool,
    pub is_bare: bool,
}

/// What a block has said about its branch so far
#[derive(Debug, Default)]
enum BranchState {
    #[default]
    Unknown,
    Named(String),
    Detached,
}

#[derive(Debug)]
struct BlockBuilder {
    path: String,
    commit_hash: String,
    branch: BranchState,
    bare: bool,
}

impl BlockBuilder {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            commit_hash: String::new(),
            branch: BranchState::Unknown,
            bare: false,
        }
    }

    fn apply(&mut self, line: &str) {
        if let Some(hash) = line.strip_prefix("HEAD ") {
            self.commit_hash = hash.trim().to_string();
        } else if let Some(reference) = line.strip_prefix("branch ") {
            let reference = reference.trim();
            let name = reference
                .strip_prefix(BRANCH_REF_PREFIX)
                .unwrap_or(reference);
            self.branch = BranchState::Named(name.to_string());
        } else if line == "detached" {
            self.branch = BranchState::Detached;
        } else if line == "bare" {
            self.bare = true;
        }
    }

    fn finish(self) -> WorktreeRecord {
        // A non-bare block that never names a branch is reported as detached
        let (branch, is_detached) = match self.branch {
            BranchState::Named(name) => (name, false),
            BranchState::Detached => (DETACHED_BRANCH.to_string(), true),
            BranchState::Unknown if self.bare => (DETACHED_BRANCH.to_string(), false),
            BranchState::Unknown => (DETACHED_BRANCH.to_string(), true),
        };

        WorktreeRecord {
            path: self.path,
            commit_hash: self.commit_hash,
            branch,
            is_detached,
            is_bare: self.bare,
        }
    }
}

/// Parse porcelain worktree listing output into records, preserving order
pub fn parse_worktree_list(raw: &str) -> Vec<WorktreeRecord> {
    let mut records = Vec::new();
    let mut current: Option<BlockBuilder> = None;

    for line in raw.lines() {
        // Only the terminator goes; worktree paths keep their exact bytes
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.trim().is_empty() {
            if let Some(block) = current.take() {
                records.push(block.finish());
            }
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(block) = current.replace(BlockBuilder::new(path)) {
                records.push(block.finish());
            }
            continue;
        }

        // Attribute lines outside a block are ignored
        if let Some(block) = current.as_mut() {
            block.apply(line.trim());
        }
    }

    if let Some(block) = current {
        records.push(block.finish());
    }

    records
}
