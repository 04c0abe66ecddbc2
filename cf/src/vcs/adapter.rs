//! GitAdapter - per-task worktrees, stage commits, rollback, and merge

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clawstore::TaskStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::events::{EventBus, PipelineEvent};

use super::git::GitRunner;
use super::{branch_name, stage_commit_message, VcsError};

/// Derived lifecycle status of a task branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Completed,
    Stale,
    Merged,
}

/// Rich per-branch status for the renderer's branches drawer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchDetail {
    pub task_id: i64,
    pub branch: String,
    pub ahead: i64,
    pub behind: i64,
    pub last_commit_message: String,
    pub last_commit_date: String,
    pub commit_count: i64,
    pub pushed: bool,
    pub status: BranchStatus,
    pub dirty_files: i64,
    pub worktree_active: bool,
}

/// Result of a merge attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflicts: bool,
    pub message: String,
}

/// One entry of `git status --porcelain`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    pub status: String,
}

/// Result of best-effort staging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAllOutcome {
    pub staged: usize,
    pub errors: Vec<String>,
}

/// The version-control adapter for one project repository
pub struct GitAdapter {
    project_path: PathBuf,
    base_branch: RwLock<String>,
    runner: GitRunner,
    bus: Arc<EventBus>,
    /// task id -> (worktree path, branch), recovered on startup
    worktrees: Mutex<HashMap<i64, (PathBuf, String)>>,
}

impl GitAdapter {
    /// Open the adapter over a project repository. The base branch is
    /// auto-detected ("main", then "master", then the current HEAD) and the
    /// worktree map is recovered from `git worktree list`.
    pub async fn open(project_path: impl Into<PathBuf>, bus: Arc<EventBus>) -> Result<Self, VcsError> {
        let project_path = project_path.into();
        debug!(path = %project_path.display(), "GitAdapter::open: called");
        let runner = GitRunner::new(bus.clone());

        let base_branch = Self::detect_base_branch(&runner, &project_path).await?;
        info!(%base_branch, "GitAdapter::open: base branch detected");

        let adapter = Self {
            project_path,
            base_branch: RwLock::new(base_branch),
            runner,
            bus,
            worktrees: Mutex::new(HashMap::new()),
        };
        adapter.recover_worktrees().await?;
        Ok(adapter)
    }

    async fn detect_base_branch(runner: &GitRunner, dir: &Path) -> Result<String, VcsError> {
        for candidate in ["main", "master"] {
            let probe = runner
                .run_quiet(dir, &["rev-parse", "--verify", "--quiet", candidate])
                .await?;
            if probe.success {
                return Ok(candidate.to_string());
            }
        }
        let head = runner.run_ok(dir, &["rev-parse", "--abbrev-ref", "HEAD"], None).await?;
        Ok(head.stdout.trim().to_string())
    }

    /// Rebuild the task id -> worktree map from existing worktrees
    async fn recover_worktrees(&self) -> Result<(), VcsError> {
        let out = self
            .runner
            .run_ok(&self.project_path, &["worktree", "list", "--porcelain"], None)
            .await?;

        let marker = clawstore::paths::worktrees_dir(&self.project_path);
        let mut map = self.worktrees.lock().await;
        let mut current_path: Option<PathBuf> = None;
        for line in out.stdout.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                if let Some(path) = current_path.take() {
                    if path.starts_with(&marker) {
                        if let Some(id) = path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .and_then(|n| n.parse::<i64>().ok())
                        {
                            debug!(task_id = id, %branch, "recover_worktrees: recovered");
                            map.insert(id, (path, branch.to_string()));
                        }
                    }
                }
            }
        }
        info!(count = map.len(), "Recovered worktrees");
        Ok(())
    }

    pub async fn base_branch(&self) -> String {
        self.base_branch.read().await.clone()
    }

    pub async fn set_base_branch(&self, branch: &str) -> Result<(), VcsError> {
        let probe = self
            .runner
            .run_quiet(&self.project_path, &["rev-parse", "--verify", "--quiet", branch])
            .await?;
        if !probe.success {
            return Err(VcsError::CommandFailed {
                args: vec!["rev-parse".to_string(), branch.to_string()],
                stderr: format!("branch {branch} does not exist"),
            });
        }
        *self.base_branch.write().await = branch.to_string();
        Ok(())
    }

    /// Worktree path for a task, if one is active
    pub async fn worktree_path(&self, task_id: i64) -> Option<PathBuf> {
        self.worktrees.lock().await.get(&task_id).map(|(p, _)| p.clone())
    }

    async fn worktree_entry(&self, task_id: i64) -> Result<(PathBuf, String), VcsError> {
        self.worktrees
            .lock()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(VcsError::WorktreeMissing(task_id))
    }

    /// Branch for a task: from the worktree map, else by scanning branches
    async fn branch_for_task(&self, task_id: i64) -> Result<String, VcsError> {
        if let Some((_, branch)) = self.worktrees.lock().await.get(&task_id) {
            return Ok(branch.clone());
        }
        let out = self
            .runner
            .run_ok(
                &self.project_path,
                &[
                    "branch",
                    "--list",
                    "--format=%(refname:short)",
                    &format!("task/{task_id}"),
                    &format!("task/{task_id}-*"),
                ],
                Some(task_id),
            )
            .await?;
        out.stdout
            .lines()
            .next()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(VcsError::WorktreeMissing(task_id))
    }

    /// Create the worktree and branch in one step. Idempotent: an existing
    /// worktree for the task is returned as-is.
    pub async fn create_worktree(&self, task_id: i64, title: &str) -> Result<(PathBuf, String), VcsError> {
        debug!(task_id, %title, "create_worktree: called");
        if let Some(entry) = self.worktrees.lock().await.get(&task_id) {
            debug!(task_id, "create_worktree: already exists");
            return Ok(entry.clone());
        }

        let path = clawstore::paths::worktree_path(&self.project_path, task_id);
        let branch = branch_name(task_id, title);
        tokio::fs::create_dir_all(path.parent().expect("worktree path has parent")).await?;

        let base = self.base_branch().await;
        let path_str = path.to_string_lossy().to_string();
        self.runner
            .run_ok(
                &self.project_path,
                &["worktree", "add", &path_str, "-b", &branch, &base],
                Some(task_id),
            )
            .await?;

        self.worktrees
            .lock()
            .await
            .insert(task_id, (path.clone(), branch.clone()));

        self.bus.emit(PipelineEvent::BranchCreated {
            task_id,
            branch: branch.clone(),
        });
        self.bus.emit(PipelineEvent::WorktreeCreated {
            task_id,
            path: path_str,
            branch: branch.clone(),
        });
        info!(task_id, %branch, "Created worktree");
        Ok((path, branch))
    }

    /// Stage everything and commit with the canonical stage message.
    /// Returns `None` when the tree is clean.
    pub async fn stage_commit(&self, task_id: i64, stage: &str) -> Result<Option<(String, String)>, VcsError> {
        debug!(task_id, %stage, "stage_commit: called");
        let (path, _) = self.worktree_entry(task_id).await?;

        let status = self
            .runner
            .run_ok(&path, &["status", "--porcelain"], Some(task_id))
            .await?;
        if status.stdout.trim().is_empty() {
            debug!(task_id, "stage_commit: tree clean, nothing to commit");
            return Ok(None);
        }

        self.runner.run_ok(&path, &["add", "-A"], Some(task_id)).await?;
        let message = stage_commit_message(task_id, stage);
        self.runner
            .run_ok(&path, &["commit", "-m", &message], Some(task_id))
            .await?;
        let hash = self
            .runner
            .run_ok(&path, &["rev-parse", "HEAD"], Some(task_id))
            .await?
            .stdout
            .trim()
            .to_string();

        self.bus.emit(PipelineEvent::CommitComplete {
            task_id,
            stage: stage.to_string(),
            commit_hash: hash.clone(),
        });
        info!(task_id, %stage, %hash, "Stage commit");
        Ok(Some((hash, message)))
    }

    /// Stash uncommitted changes (labeled), then hard-reset the worktree to
    /// the merge-base of the task branch and the base branch. Returns
    /// whether a stash entry was created.
    pub async fn stash_and_reset(&self, task_id: i64) -> Result<bool, VcsError> {
        debug!(task_id, "stash_and_reset: called");
        let (path, _) = self.worktree_entry(task_id).await?;

        let status = self
            .runner
            .run_ok(&path, &["status", "--porcelain"], Some(task_id))
            .await?;
        let mut stashed = false;
        if !status.stdout.trim().is_empty() {
            let label = format!("clawflow: task {task_id} restart");
            self.runner
                .run_ok(&path, &["stash", "push", "-u", "-m", &label], Some(task_id))
                .await?;
            stashed = true;
        }

        let base = self.base_branch().await;
        let merge_base = self
            .runner
            .run_ok(&path, &["merge-base", &base, "HEAD"], Some(task_id))
            .await?
            .stdout
            .trim()
            .to_string();
        self.runner
            .run_ok(&path, &["reset", "--hard", &merge_base], Some(task_id))
            .await?;
        info!(task_id, stashed, "stash_and_reset: worktree reset to merge-base");
        Ok(stashed)
    }

    /// Reset the worktree to the commit that completed `stage`. Falls back
    /// to [`stash_and_reset`](Self::stash_and_reset) when the branch log
    /// has no such commit.
    pub async fn reset_to_stage_commit(&self, task_id: i64, stage: &str) -> Result<(), VcsError> {
        debug!(task_id, %stage, "reset_to_stage_commit: called");
        let (path, _) = self.worktree_entry(task_id).await?;

        // Park uncommitted and untracked work in a labeled stash so the
        // hard reset leaves a clean tree
        let status = self
            .runner
            .run_ok(&path, &["status", "--porcelain"], Some(task_id))
            .await?;
        if !status.stdout.trim().is_empty() {
            let label = format!("clawflow: task {task_id} restart");
            self.runner
                .run_ok(&path, &["stash", "push", "-u", "-m", &label], Some(task_id))
                .await?;
        }

        let wanted = stage_commit_message(task_id, stage);
        let log = self
            .runner
            .run_ok(&path, &["log", "--format=%H%x09%s"], Some(task_id))
            .await?;

        let hash = log.stdout.lines().find_map(|line| {
            let (hash, subject) = line.split_once('\t')?;
            (subject == wanted).then(|| hash.to_string())
        });

        match hash {
            Some(hash) => {
                self.runner
                    .run_ok(&path, &["reset", "--hard", &hash], Some(task_id))
                    .await?;
                info!(task_id, %stage, %hash, "reset_to_stage_commit: reset to stage commit");
                Ok(())
            }
            None => {
                warn!(task_id, %stage, "reset_to_stage_commit: stage commit not found, falling back");
                self.stash_and_reset(task_id).await.map(|_| ())
            }
        }
    }

    /// Push the task branch to origin
    pub async fn push(&self, task_id: i64) -> Result<(), VcsError> {
        debug!(task_id, "push: called");
        let (path, branch) = self.worktree_entry(task_id).await?;
        let out = self
            .runner
            .run(&path, &["push", "-u", "origin", &branch], Some(task_id))
            .await?;
        if !out.success {
            let stderr = out.stderr.to_lowercase();
            if stderr.contains("no configured push destination")
                || stderr.contains("does not appear to be a git repository")
                || stderr.contains("could not read from remote repository")
            {
                return Err(VcsError::NoRemote);
            }
            if stderr.contains("non-fast-forward") || stderr.contains("fetch first") || stderr.contains("[rejected]") {
                return Err(VcsError::NonFastForward);
            }
            return Err(VcsError::CommandFailed {
                args: vec!["push".to_string(), branch],
                stderr: out.stderr,
            });
        }
        self.bus.emit(PipelineEvent::PushComplete { task_id, branch });
        Ok(())
    }

    /// Merge the task branch into `target` (default: the base branch) with
    /// a non-fast-forward merge, then return to the originally checked-out
    /// branch.
    pub async fn merge(&self, task_id: i64, target: Option<&str>) -> Result<MergeOutcome, VcsError> {
        let base = self.base_branch().await;
        let target = target.unwrap_or(&base).to_string();
        debug!(task_id, %target, "merge: called");
        let branch = self.branch_for_task(task_id).await?;

        let original = self
            .runner
            .run_ok(&self.project_path, &["rev-parse", "--abbrev-ref", "HEAD"], Some(task_id))
            .await?
            .stdout
            .trim()
            .to_string();

        self.runner
            .run_ok(&self.project_path, &["checkout", &target], Some(task_id))
            .await?;

        let merge_msg = format!("Merge {branch}");
        let out = self
            .runner
            .run(
                &self.project_path,
                &["merge", "--no-ff", &branch, "-m", &merge_msg],
                Some(task_id),
            )
            .await?;

        let outcome = if out.success {
            self.bus.emit(PipelineEvent::MergeComplete {
                task_id,
                target: target.clone(),
            });
            MergeOutcome {
                success: true,
                conflicts: false,
                message: format!("Merged {branch} into {target}"),
            }
        } else {
            let text = format!("{}\n{}", out.stdout, out.stderr);
            if text.contains("CONFLICT") {
                // Leave the repository clean for the next attempt
                let _ = self
                    .runner
                    .run(&self.project_path, &["merge", "--abort"], Some(task_id))
                    .await;
                self.bus.emit(PipelineEvent::MergeConflict {
                    task_id,
                    message: text.clone(),
                });
                MergeOutcome {
                    success: false,
                    conflicts: true,
                    message: text,
                }
            } else if text.contains("would be overwritten") {
                // Untracked/local files in the way: nothing was applied, so
                // nothing to abort
                MergeOutcome {
                    success: false,
                    conflicts: false,
                    message: text,
                }
            } else {
                MergeOutcome {
                    success: false,
                    conflicts: false,
                    message: text,
                }
            }
        };

        // Best effort: restore whatever was checked out before
        if original != target {
            let _ = self
                .runner
                .run(&self.project_path, &["checkout", &original], Some(task_id))
                .await;
        }

        Ok(outcome)
    }

    /// Remove the worktree (if active) and delete the branch
    pub async fn delete_branch(&self, task_id: i64) -> Result<(), VcsError> {
        debug!(task_id, "delete_branch: called");
        let branch = self.branch_for_task(task_id).await?;

        let entry = self.worktrees.lock().await.remove(&task_id);
        if let Some((path, _)) = entry {
            let path_str = path.to_string_lossy().to_string();
            let out = self
                .runner
                .run(
                    &self.project_path,
                    &["worktree", "remove", &path_str, "--force"],
                    Some(task_id),
                )
                .await?;
            if !out.success && !out.stderr.contains("is not a working tree") {
                return Err(VcsError::CommandFailed {
                    args: vec!["worktree".to_string(), "remove".to_string(), path_str],
                    stderr: out.stderr,
                });
            }
            self.bus.emit(PipelineEvent::WorktreeRemoved { task_id });
        }

        self.runner
            .run_ok(&self.project_path, &["branch", "-D", &branch], Some(task_id))
            .await?;
        self.bus.emit(PipelineEvent::BranchDeleted {
            task_id,
            branch: branch.clone(),
        });
        info!(task_id, %branch, "Deleted branch");
        Ok(())
    }

    /// All local branches (for the base-branch picker)
    pub async fn get_local_branches(&self) -> Result<Vec<String>, VcsError> {
        let out = self
            .runner
            .run_ok(&self.project_path, &["branch", "--format=%(refname:short)"], None)
            .await?;
        Ok(out.stdout.lines().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
    }

    /// Rich detail for one task branch
    pub async fn get_branch_detail(
        &self,
        task_id: i64,
        task_status: Option<TaskStatus>,
    ) -> Result<BranchDetail, VcsError> {
        let branch = self.branch_for_task(task_id).await?;
        let base = self.base_branch().await;

        let counts = self
            .runner
            .run_ok(
                &self.project_path,
                &["rev-list", "--left-right", "--count", &format!("{base}...{branch}")],
                Some(task_id),
            )
            .await?;
        let mut parts = counts.stdout.split_whitespace();
        let behind: i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let ahead: i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        let last = self
            .runner
            .run_ok(
                &self.project_path,
                &["log", "-1", "--format=%s%x09%cI", &branch],
                Some(task_id),
            )
            .await?;
        let (last_commit_message, last_commit_date) = last
            .stdout
            .trim()
            .split_once('\t')
            .map(|(m, d)| (m.to_string(), d.to_string()))
            .unwrap_or_default();

        let pushed = self
            .runner
            .run_quiet(
                &self.project_path,
                &["rev-parse", "--verify", "--quiet", &format!("origin/{branch}")],
            )
            .await?
            .success;

        let worktree_active = self.worktrees.lock().await.contains_key(&task_id);
        let dirty_files = if worktree_active {
            self.get_working_tree_status(task_id).await?.len() as i64
        } else {
            0
        };

        Ok(BranchDetail {
            task_id,
            branch,
            ahead,
            behind,
            last_commit_message,
            last_commit_date,
            commit_count: ahead,
            pushed,
            status: derive_branch_status(task_status, ahead),
            dirty_files,
            worktree_active,
        })
    }

    /// Details for every `task/*` branch. `statuses` maps task ids to their
    /// pipeline status for the derived branch state.
    pub async fn get_branches(&self, statuses: &HashMap<i64, TaskStatus>) -> Result<Vec<BranchDetail>, VcsError> {
        let out = self
            .runner
            .run_ok(
                &self.project_path,
                &["branch", "--list", "--format=%(refname:short)", "task/*"],
                None,
            )
            .await?;

        let mut details = Vec::new();
        for line in out.stdout.lines() {
            let branch = line.trim();
            let Some(task_id) = parse_task_id(branch) else {
                continue;
            };
            match self.get_branch_detail(task_id, statuses.get(&task_id).copied()).await {
                Ok(detail) => details.push(detail),
                Err(e) => warn!(task_id, error = %e, "get_branches: skipping branch"),
            }
        }
        Ok(details)
    }

    /// File-level working tree status for a task
    pub async fn get_working_tree_status(&self, task_id: i64) -> Result<Vec<FileStatus>, VcsError> {
        let (path, _) = self.worktree_entry(task_id).await?;
        let out = self
            .runner
            .run_ok(&path, &["status", "--porcelain"], Some(task_id))
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| FileStatus {
                status: l[..2].trim().to_string(),
                path: l[3..].to_string(),
            })
            .collect())
    }

    /// Best-effort staging: paths that fail to stage (for example invalid
    /// on a case-insensitive filesystem) are reported, not fatal.
    pub async fn stage_all(&self, task_id: i64) -> Result<StageAllOutcome, VcsError> {
        let (path, _) = self.worktree_entry(task_id).await?;
        let files = self.get_working_tree_status(task_id).await?;

        let mut staged = 0;
        let mut errors = Vec::new();
        for file in files {
            match self.runner.run(&path, &["add", "--", &file.path], Some(task_id)).await {
                Ok(out) if out.success => staged += 1,
                Ok(out) => errors.push(format!("{}: {}", file.path, out.stderr.trim())),
                Err(e) => errors.push(format!("{}: {e}", file.path)),
            }
        }
        Ok(StageAllOutcome { staged, errors })
    }

    /// Commit everything in the worktree with an arbitrary message
    /// (command-surface operation). Returns `None` on a clean tree.
    pub async fn commit(&self, task_id: i64, message: &str) -> Result<Option<String>, VcsError> {
        let (path, _) = self.worktree_entry(task_id).await?;
        let status = self
            .runner
            .run_ok(&path, &["status", "--porcelain"], Some(task_id))
            .await?;
        if status.stdout.trim().is_empty() {
            return Ok(None);
        }
        self.runner.run_ok(&path, &["add", "-A"], Some(task_id)).await?;
        self.runner
            .run_ok(&path, &["commit", "-m", message], Some(task_id))
            .await?;
        let hash = self
            .runner
            .run_ok(&path, &["rev-parse", "HEAD"], Some(task_id))
            .await?
            .stdout
            .trim()
            .to_string();
        Ok(Some(hash))
    }
}

/// Branch state derived from the task's pipeline status and ahead count
fn derive_branch_status(task_status: Option<TaskStatus>, ahead: i64) -> BranchStatus {
    match task_status {
        Some(TaskStatus::Done) => {
            if ahead == 0 {
                BranchStatus::Merged
            } else {
                BranchStatus::Completed
            }
        }
        Some(
            TaskStatus::Brainstorming
            | TaskStatus::DesignReview
            | TaskStatus::Planning
            | TaskStatus::Implementing
            | TaskStatus::CodeReview
            | TaskStatus::Verifying,
        ) => BranchStatus::Active,
        _ => BranchStatus::Stale,
    }
}

/// Extract the task id from a `task/{id}` or `task/{id}-{slug}` branch name
fn parse_task_id(branch: &str) -> Option<i64> {
    let rest = branch.strip_prefix("task/")?;
    let id_part = rest.split('-').next()?;
    id_part.parse().ok()
}
