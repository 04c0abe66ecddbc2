//! Version-control adapter: per-task worktrees over a shared repository
//!
//! Each task gets an isolated working copy (a git worktree) on a branch
//! `task/{id}-{slug}` forked from the project's base branch. Stage
//! boundaries commit with a canonical message so restart can roll the tree
//! back to any completed stage.

mod adapter;
mod git;

pub use adapter::{BranchDetail, BranchStatus, FileStatus, GitAdapter, MergeOutcome, StageAllOutcome};
pub use git::{GitOutput, GIT_OUTPUT_CAP, GIT_TIMEOUT};

/// Error types for VCS operations
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git {args:?} failed: {stderr}")]
    CommandFailed { args: Vec<String>, stderr: String },

    #[error("git {args:?} timed out")]
    Timeout { args: Vec<String> },

    #[error("No remote configured for push")]
    NoRemote,

    #[error("Push rejected (non-fast-forward); pull or rebase first")]
    NonFastForward,

    #[error("No worktree for task {0}")]
    WorktreeMissing(i64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lowercased, ASCII-only slug truncated to 40 characters
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Canonical branch name for a task
pub fn branch_name(task_id: i64, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("task/{task_id}")
    } else {
        format!("task/{task_id}-{slug}")
    }
}

/// Canonical stage-commit message, searched verbatim on restart
pub fn stage_commit_message(task_id: i64, stage: &str) -> String {
    format!("task/{task_id}: complete {stage} stage")
}
