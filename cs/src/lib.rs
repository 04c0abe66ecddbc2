//! ClawStore - durable state for the ClawFlow pipeline
//!
//! ClawStore persists every entity the orchestration core needs: tasks and
//! their stage outputs, task groups, handoffs, audit logs, dependencies,
//! agent-produced knowledge, and the project registry. Storage is SQLite
//! (one database per project plus one global database), opened with
//! idempotent add-column migrations so older databases upgrade in place.
//!
//! # Layout
//!
//! - Global store: `~/.clawflow/clawflow.db` (projects, settings, global
//!   knowledge)
//! - Per-project store: `~/.clawflow/dbs/{project}.db` (tasks, groups,
//!   handoffs, logs, domain knowledge, settings)
//! - Project marker: `{projectPath}/.clawflow/project.json`
//!
//! # Modules
//!
//! - [`domain`] - Entity structs and enums
//! - [`store`] - The SQLite store and its typed operations
//! - [`paths`] - Persisted state layout helpers

pub mod domain;
pub mod paths;
pub mod store;

pub use domain::{
    AgentLogEntry, FileAction, FileAssignment, GroupStatus, Handoff, HandoffStatus, KnowledgeCategory,
    KnowledgeEntry, KnowledgeSource, KnowledgeStatus, PauseReason, Project, TaskGroup, TaskPatch, TaskPriority,
    TaskStats, TaskStatus, TaskTier, TestResults, TodoItem, TodoStatus, WorkOrder,
};
pub use domain::task::Task;
pub use store::{NewKnowledge, NewTask, Store, StoreError};
