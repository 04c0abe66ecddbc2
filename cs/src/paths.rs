//! Persisted state layout
//!
//! - Global store: `~/.clawflow/clawflow.db`
//! - Per-project store: `~/.clawflow/dbs/{projectName}.db`
//! - Project marker: `{projectPath}/.clawflow/project.json`
//! - Worktrees: `{projectPath}/.clawflow/worktrees/{taskId}`

use std::path::{Path, PathBuf};

/// Root of ClawFlow's home-directory state
pub fn clawflow_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".clawflow")
}

/// Global database (projects registry, global settings, global knowledge)
pub fn global_db_path() -> PathBuf {
    clawflow_home().join("clawflow.db")
}

/// Per-project database
pub fn project_db_path(project_name: &str) -> PathBuf {
    clawflow_home().join("dbs").join(format!("{project_name}.db"))
}

/// Marker file written into a registered project
pub fn project_marker_path(project_path: &Path) -> PathBuf {
    project_path.join(".clawflow").join("project.json")
}

/// Directory holding one worktree per task
pub fn worktrees_dir(project_path: &Path) -> PathBuf {
    project_path.join(".clawflow").join("worktrees")
}

/// The isolated working copy for one task
pub fn worktree_path(project_path: &Path, task_id: i64) -> PathBuf {
    worktrees_dir(project_path).join(task_id.to_string())
}

/// Workshop artifact file: `{projectPath}/docs/workshop/{name-slug}.{ext}`
pub fn workshop_artifact_path(project_path: &Path, name_slug: &str, ext: &str) -> PathBuf {
    project_path
        .join("docs")
        .join("workshop")
        .join(format!("{name_slug}.{ext}"))
}
