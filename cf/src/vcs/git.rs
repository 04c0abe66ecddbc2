//! Low-level git invocation: explicit argument arrays, per-directory
//! serialization, a hard timeout, and an output cap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::events::{EventBus, PipelineEvent};

use super::VcsError;

/// Timeout for any single git invocation
pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on captured stdout/stderr per invocation (10 MiB)
pub const GIT_OUTPUT_CAP: usize = 10 * 1024 * 1024;

/// Captured output of a finished git command
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// stdout if the command succeeded, stderr otherwise
    pub fn text(&self) -> &str {
        if self.success { &self.stdout } else { &self.stderr }
    }
}

/// Serialized git runner. Invocations are serialized per working directory
/// (one mutex per worktree); different worktrees proceed in parallel.
pub struct GitRunner {
    bus: Arc<EventBus>,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitRunner {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(dir.to_path_buf()).or_default().clone()
    }

    /// Run git with the given argument array. Failures emit a `git:error`
    /// event before returning.
    pub async fn run(&self, dir: &Path, args: &[&str], task_id: Option<i64>) -> Result<GitOutput, VcsError> {
        debug!(dir = %dir.display(), ?args, "GitRunner::run: called");
        let lock = self.lock_for(dir).await;
        let _guard = lock.lock().await;

        let output = tokio::time::timeout(
            GIT_TIMEOUT,
            Command::new("git").args(args).current_dir(dir).output(),
        )
        .await;

        let args_owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = match output {
            Err(_) => {
                let err = VcsError::Timeout { args: args_owned.clone() };
                self.bus.emit(PipelineEvent::GitError {
                    task_id,
                    args: args_owned,
                    error: err.to_string(),
                });
                return Err(err);
            }
            Ok(Err(e)) => {
                self.bus.emit(PipelineEvent::GitError {
                    task_id,
                    args: args_owned,
                    error: e.to_string(),
                });
                return Err(VcsError::Io(e));
            }
            Ok(Ok(out)) => out,
        };

        let result = GitOutput {
            success: output.status.success(),
            stdout: capped(&output.stdout),
            stderr: capped(&output.stderr),
        };

        if !result.success {
            warn!(?args, stderr = %result.stderr.trim(), "git command failed");
            self.bus.emit(PipelineEvent::GitError {
                task_id,
                args: args_owned,
                error: result.stderr.clone(),
            });
        }

        Ok(result)
    }

    /// Probe variant for commands whose nonzero exit is an expected
    /// answer (e.g. `rev-parse --verify`); failures emit no event.
    pub async fn run_quiet(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, VcsError> {
        debug!(dir = %dir.display(), ?args, "GitRunner::run_quiet: called");
        let lock = self.lock_for(dir).await;
        let _guard = lock.lock().await;

        let output = tokio::time::timeout(
            GIT_TIMEOUT,
            Command::new("git").args(args).current_dir(dir).output(),
        )
        .await;

        match output {
            Err(_) => Err(VcsError::Timeout {
                args: args.iter().map(|s| s.to_string()).collect(),
            }),
            Ok(Err(e)) => Err(VcsError::Io(e)),
            Ok(Ok(out)) => Ok(GitOutput {
                success: out.status.success(),
                stdout: capped(&out.stdout),
                stderr: capped(&out.stderr),
            }),
        }
    }

    /// Like [`run`](Self::run) but a nonzero exit is an error
    pub async fn run_ok(&self, dir: &Path, args: &[&str], task_id: Option<i64>) -> Result<GitOutput, VcsError> {
        let output = self.run(dir, args, task_id).await?;
        if !output.success {
            return Err(VcsError::CommandFailed {
                args: args.iter().map(|s| s.to_string()).collect(),
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

fn capped(bytes: &[u8]) -> String {
    let slice = if bytes.len() > GIT_OUTPUT_CAP {
        &bytes[..GIT_OUTPUT_CAP]
    } else {
        bytes
    };
    String::from_utf8_lossy(slice).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use tempfile::tempdir;

    fn runner() -> (GitRunner, Arc<EventBus>) {
        let bus = Arc::new(EventBus::with_default_capacity());
        (GitRunner::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn test_run_ok_success() {
        let dir = tempdir().unwrap();
        let (runner, _bus) = runner();
        let out = runner.run_ok(dir.path(), &["--version"], None).await.unwrap();
        assert!(out.stdout.contains("git version"));
    }

    #[tokio::test]
    async fn test_failure_emits_git_error_event() {
        let dir = tempdir().unwrap();
        let (runner, bus) = runner();
        let mut rx = bus.subscribe();

        // Not a repository, so status fails
        let result = runner.run_ok(dir.path(), &["status"], Some(5)).await;
        assert!(result.is_err());

        let event = rx.try_recv().unwrap();
        match event {
            PipelineEvent::GitError { task_id, args, .. } => {
                assert_eq!(task_id, Some(5));
                assert_eq!(args, vec!["status".to_string()]);
            }
            other => panic!("expected git:error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_reports_failure_without_error() {
        let dir = tempdir().unwrap();
        let (runner, _bus) = runner();
        let out = runner.run(dir.path(), &["status"], None).await.unwrap();
        assert!(!out.success);
        assert!(!out.stderr.is_empty());
    }

    #[test]
    fn test_capped_truncates() {
        let big = vec![b'x'; GIT_OUTPUT_CAP + 100];
        assert_eq!(capped(&big).len(), GIT_OUTPUT_CAP);
    }
}
