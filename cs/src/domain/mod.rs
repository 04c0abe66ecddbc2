//! Entity types persisted by the store

pub mod group;
pub mod handoff;
pub mod knowledge;
pub mod project;
pub mod task;

pub use group::{GroupStatus, TaskGroup};
pub use handoff::{AgentLogEntry, Handoff, HandoffStatus};
pub use knowledge::{KnowledgeCategory, KnowledgeEntry, KnowledgeSource, KnowledgeStatus};
pub use project::Project;
pub use task::{
    FileAction, FileAssignment, PauseReason, Task, TaskPatch, TaskPriority, TaskStats, TaskStatus, TaskTier,
    TestResults, TodoItem, TodoStatus, WorkOrder,
};

/// Parse a JSON column permissively: corrupt or missing JSON yields the
/// type's default instead of an error.
pub(crate) fn lenient_json<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    match raw {
        Some(s) if !s.is_empty() => serde_json::from_str(&s).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Malformed JSON column, using default");
            T::default()
        }),
        _ => T::default(),
    }
}
