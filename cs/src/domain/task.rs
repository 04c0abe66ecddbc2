//! Task - one unit of work flowing through the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Complexity class selecting the stage sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskTier {
    L1,
    L2,
    L3,
}

impl TaskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskTier::L1 => "L1",
            TaskTier::L2 => "L2",
            TaskTier::L3 => "L3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "L1" => Some(TaskTier::L1),
            "L2" => Some(TaskTier::L2),
            "L3" => Some(TaskTier::L3),
            _ => None,
        }
    }
}

/// Task priority, ordered so that `Critical > High > Medium > Low`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            "critical" => Some(TaskPriority::Critical),
            _ => None,
        }
    }
}

/// Externally visible task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Brainstorming,
    DesignReview,
    Planning,
    Implementing,
    CodeReview,
    Verifying,
    Done,
    Blocked,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Brainstorming => "brainstorming",
            TaskStatus::DesignReview => "design_review",
            TaskStatus::Planning => "planning",
            TaskStatus::Implementing => "implementing",
            TaskStatus::CodeReview => "code_review",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backlog" => Some(TaskStatus::Backlog),
            "brainstorming" => Some(TaskStatus::Brainstorming),
            "design_review" => Some(TaskStatus::DesignReview),
            "planning" => Some(TaskStatus::Planning),
            "implementing" => Some(TaskStatus::Implementing),
            "code_review" => Some(TaskStatus::CodeReview),
            "verifying" => Some(TaskStatus::Verifying),
            "done" => Some(TaskStatus::Done),
            "blocked" => Some(TaskStatus::Blocked),
            "paused" => Some(TaskStatus::Paused),
            _ => None,
        }
    }

    /// Statuses that never carry a current agent
    pub fn is_agentless(&self) -> bool {
        matches!(self, TaskStatus::Backlog | TaskStatus::Done)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a task entered the paused state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    UsageLimit,
    MergeConflict,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Manual => "manual",
            PauseReason::UsageLimit => "usage_limit",
            PauseReason::MergeConflict => "merge_conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(PauseReason::Manual),
            "usage_limit" => Some(PauseReason::UsageLimit),
            "merge_conflict" => Some(PauseReason::MergeConflict),
            _ => None,
        }
    }
}

/// Whether a file assignment creates a new file or modifies an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
}

/// One file a grouped task is assigned to touch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAssignment {
    pub path: String,
    pub action: FileAction,
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Work order carried by tasks that belong to a group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkOrder {
    pub objective: String,
    pub file_assignments: Vec<FileAssignment>,
    pub integration_notes: String,
    pub constraints: String,
    pub tests: String,
}

/// Status of a single todo produced by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl Default for TodoStatus {
    fn default() -> Self {
        TodoStatus::Pending
    }
}

/// One entry in the agent's todo list, persisted on the task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
}

/// Outcome of the verify stage's test run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResults {
    pub passed: bool,
    pub summary: String,
}

/// One unit of work flowing through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,

    pub tier: TaskTier,
    pub priority: TaskPriority,

    pub status: TaskStatus,
    /// Stage name the task is at; `None` iff status is backlog or done
    pub current_agent: Option<String>,
    /// Bypass human gates and permission prompts
    pub auto_mode: bool,
    pub auto_merge: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,

    // Stage outputs, one per stage
    pub brainstorm_output: Option<String>,
    pub design_review: Option<String>,
    pub plan: Option<String>,
    pub implementation_notes: Option<String>,
    pub review_comments: Option<String>,
    pub review_score: Option<f64>,
    pub test_results: Option<TestResults>,
    pub verify_result: Option<String>,
    pub commit_hash: Option<String>,

    // Circuit breaker counters
    pub plan_review_count: i64,
    pub impl_review_count: i64,

    // Pause state
    pub paused_from_status: Option<TaskStatus>,
    pub pause_reason: Option<PauseReason>,

    // Version-control isolation
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,

    // Grouping
    pub group_id: Option<i64>,
    pub work_order: Option<WorkOrder>,
    pub assigned_skill: Option<String>,

    // Session bookkeeping
    pub active_session_id: Option<String>,
    pub context_tokens: Option<i64>,
    pub context_max: Option<i64>,
    pub rich_handoff: Option<String>,

    /// Agent todo list (write-through view, debounced by the runner)
    pub todos: Vec<TodoItem>,
    /// Handoff history view; the `handoffs` table is authoritative
    pub handoffs: Vec<super::Handoff>,
}

impl Task {
    /// Check the status/agent consistency invariant
    pub fn agent_consistent(&self) -> bool {
        self.current_agent.is_none() == self.status.is_agentless()
    }
}

/// Deserialize helper distinguishing an absent field from an explicit null:
/// a present field (even `null`) becomes `Some(inner)`, an absent field
/// stays `None` via `#[serde(default)]`.
fn nullable<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

/// Partial update for a task. Every updatable field is listed explicitly;
/// anything not representable here cannot be patched, and unknown fields
/// are rejected outright.
///
/// `Option<Option<T>>` fields distinguish "leave unchanged" (outer `None`)
/// from "set to NULL" (inner `None`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<TaskTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub current_agent: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_merge: Option<bool>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Option<DateTime<Utc>>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Option<DateTime<Utc>>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub brainstorm_output: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub design_review: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub plan: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub implementation_notes: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub review_comments: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub review_score: Option<Option<f64>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub test_results: Option<Option<TestResults>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub verify_result: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_review_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impl_review_count: Option<i64>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub paused_from_status: Option<Option<TaskStatus>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<Option<PauseReason>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Option<i64>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub work_order: Option<Option<WorkOrder>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub assigned_skill: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub active_session_id: Option<Option<String>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<Option<i64>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub context_max: Option<Option<i64>>,
    #[serde(deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub rich_handoff: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoffs: Option<Vec<super::Handoff>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Aggregate statistics over all non-archived tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub backlog: i64,
    pub in_progress: i64,
    pub done: i64,
    pub blocked: i64,
    /// `done / max(1, total - backlog)`
    pub completion_rate: f64,
    pub avg_review_score: Option<f64>,
    pub circuit_breaker_trips: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            TaskStatus::Backlog,
            TaskStatus::Brainstorming,
            TaskStatus::DesignReview,
            TaskStatus::Planning,
            TaskStatus::Implementing,
            TaskStatus::CodeReview,
            TaskStatus::Verifying,
            TaskStatus::Done,
            TaskStatus::Blocked,
            TaskStatus::Paused,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    #[test]
    fn test_agentless_statuses() {
        assert!(TaskStatus::Backlog.is_agentless());
        assert!(TaskStatus::Done.is_agentless());
        assert!(!TaskStatus::Implementing.is_agentless());
        assert!(!TaskStatus::Paused.is_agentless());
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        let err = serde_json::from_str::<TaskPatch>(r#"{"no_such_field": 1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_patch_nullable_set_and_clear() {
        let patch: TaskPatch = serde_json::from_str(r#"{"current_agent": null, "plan": "do it"}"#).unwrap();
        assert_eq!(patch.current_agent, Some(None));
        assert_eq!(patch.plan, Some(Some("do it".to_string())));
        assert!(patch.brainstorm_output.is_none());
    }

    #[test]
    fn test_work_order_defaults() {
        let wo: WorkOrder = serde_json::from_str(r#"{"objective": "split the parser"}"#).unwrap();
        assert_eq!(wo.objective, "split the parser");
        assert!(wo.file_assignments.is_empty());
    }
}
