//! Post-stage hooks: lint/typecheck/test commands gated per stage
//!
//! Hooks are configured per project under `.clawflow/hooks.yml`. A failed
//! required hook blocks the task; hook failures never re-enter the
//! rejection path.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::Stage;

/// One configured hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub name: String,
    /// Shell-free invocation: program plus arguments
    pub command: Vec<String>,
    /// Stage names this hook runs after
    pub stages: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Outcome of one hook run
#[derive(Debug, Clone)]
pub struct HookResult {
    pub name: String,
    pub required: bool,
    pub passed: bool,
    pub output: String,
}

/// Hook configuration loaded from the project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSet {
    pub hooks: Vec<Hook>,
}

impl HookSet {
    /// Load `.clawflow/hooks.yml` from the project; absent file means no
    /// hooks.
    pub fn load(project_path: &Path) -> Self {
        let path = project_path.join(".clawflow").join("hooks.yml");
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(set) => {
                    debug!(path = %path.display(), "HookSet::load: loaded");
                    set
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid hooks file, ignoring");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn hooks_for(&self, stage: Stage) -> Vec<&Hook> {
        self.hooks
            .iter()
            .filter(|h| h.stages.iter().any(|s| s == stage.as_str()))
            .collect()
    }

    /// Run every hook configured for the stage inside the worktree
    pub async fn run_for_stage(&self, stage: Stage, worktree: &Path, timeout: Duration) -> Vec<HookResult> {
        let mut results = Vec::new();
        for hook in self.hooks_for(stage) {
            results.push(run_hook(hook, worktree, timeout).await);
        }
        results
    }
}

async fn run_hook(hook: &Hook, worktree: &Path, timeout: Duration) -> HookResult {
    let Some((program, args)) = hook.command.split_first() else {
        return HookResult {
            name: hook.name.clone(),
            required: hook.required,
            passed: false,
            output: "empty hook command".to_string(),
        };
    };
    info!(hook = %hook.name, "running post-stage hook");

    let output = tokio::time::timeout(
        timeout,
        Command::new(program).args(args).current_dir(worktree).output(),
    )
    .await;

    match output {
        Err(_) => HookResult {
            name: hook.name.clone(),
            required: hook.required,
            passed: false,
            output: format!("hook timed out after {timeout:?}"),
        },
        Ok(Err(e)) => HookResult {
            name: hook.name.clone(),
            required: hook.required,
            passed: false,
            output: e.to_string(),
        },
        Ok(Ok(out)) => HookResult {
            name: hook.name.clone(),
            required: hook.required,
            passed: out.status.success(),
            output: {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let stderr = String::from_utf8_lossy(&out.stderr);
                format!("{stdout}{stderr}").trim().to_string()
            },
        },
    }
}

/// Summary of failed required hooks: one bold line per failure
pub fn failed_hook_summary(results: &[HookResult]) -> Option<String> {
    let failed: Vec<&HookResult> = results.iter().filter(|r| r.required && !r.passed).collect();
    if failed.is_empty() {
        return None;
    }
    Some(
        failed
            .iter()
            .map(|r| format!("**{}** failed:\n{}", r.name, r.output))
            .collect::<Vec<_>>()
            .join("\n\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hook(name: &str, command: Vec<&str>, required: bool) -> Hook {
        Hook {
            name: name.to_string(),
            command: command.into_iter().map(|s| s.to_string()).collect(),
            stages: vec!["implement".to_string()],
            required,
        }
    }

    #[tokio::test]
    async fn test_passing_hook() {
        let dir = TempDir::new().unwrap();
        let set = HookSet {
            hooks: vec![hook("truthy", vec!["true"], true)],
        };
        let results = set
            .run_for_stage(Stage::Implement, dir.path(), Duration::from_secs(5))
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        assert!(failed_hook_summary(&results).is_none());
    }

    #[tokio::test]
    async fn test_failing_required_hook_summarized() {
        let dir = TempDir::new().unwrap();
        let set = HookSet {
            hooks: vec![hook("lint", vec!["false"], true)],
        };
        let results = set
            .run_for_stage(Stage::Implement, dir.path(), Duration::from_secs(5))
            .await;
        assert!(!results[0].passed);
        let summary = failed_hook_summary(&results).unwrap();
        assert!(summary.contains("**lint** failed"));
    }

    #[tokio::test]
    async fn test_failing_optional_hook_does_not_block() {
        let dir = TempDir::new().unwrap();
        let set = HookSet {
            hooks: vec![hook("advisory", vec!["false"], false)],
        };
        let results = set
            .run_for_stage(Stage::Implement, dir.path(), Duration::from_secs(5))
            .await;
        assert!(!results[0].passed);
        assert!(failed_hook_summary(&results).is_none());
    }

    #[tokio::test]
    async fn test_hooks_filtered_by_stage() {
        let dir = TempDir::new().unwrap();
        let set = HookSet {
            hooks: vec![hook("impl-only", vec!["true"], true)],
        };
        let results = set
            .run_for_stage(Stage::Plan, dir.path(), Duration::from_secs(5))
            .await;
        assert!(results.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let set = HookSet::load(dir.path());
        assert!(set.hooks.is_empty());
    }

    #[test]
    fn test_load_parses_yaml() {
        let dir = TempDir::new().unwrap();
        let hooks_dir = dir.path().join(".clawflow");
        std::fs::create_dir_all(&hooks_dir).unwrap();
        std::fs::write(
            hooks_dir.join("hooks.yml"),
            "hooks:\n  - name: tests\n    command: [cargo, test]\n    stages: [implement, verify]\n",
        )
        .unwrap();

        let set = HookSet::load(dir.path());
        assert_eq!(set.hooks.len(), 1);
        assert!(set.hooks[0].required);
        assert_eq!(set.hooks_for(Stage::Verify).len(), 1);
    }
}
