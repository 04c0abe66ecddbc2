//! Streaming event protocol (core -> renderer)

use chrono::{DateTime, Utc};
use clawstore::TodoItem;
use serde::{Deserialize, Serialize};

/// Kind of an incremental stream chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Text,
    ToolUse,
    Context,
    Thinking,
}

/// The event vocabulary. Serialized with a `kind` tag matching the wire
/// protocol consumed by the renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PipelineEvent {
    /// Incremental agent output
    #[serde(rename = "pipeline:stream")]
    Stream {
        task_id: i64,
        agent: String,
        #[serde(rename = "type")]
        stream_type: StreamType,
        content: String,
        timestamp: DateTime<Utc>,
    },

    /// Debounced todo-list patch after a TodoWrite-style tool call
    #[serde(rename = "pipeline:todos-updated")]
    TodosUpdated {
        task_id: i64,
        stage: String,
        todos: Vec<TodoItem>,
    },

    /// The renderer must eventually answer with `resolveApproval`
    #[serde(rename = "pipeline:approval-request")]
    ApprovalRequest {
        request_id: String,
        task_id: i64,
        tool_use_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
    },

    /// Emitted after every transition, including restarts
    #[serde(rename = "pipeline:stageChange")]
    StageChange {
        task_id: i64,
        stage: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },

    #[serde(rename = "stage:start")]
    StageStart { task_id: i64, stage: String },

    #[serde(rename = "stage:complete")]
    StageComplete {
        task_id: i64,
        stage: String,
        summary: String,
    },

    #[serde(rename = "stage:error")]
    StageError {
        task_id: i64,
        stage: String,
        error: String,
    },

    #[serde(rename = "stage:pause")]
    StagePause {
        task_id: i64,
        stage: String,
        open_questions: String,
    },

    /// Third rejection in a phase
    #[serde(rename = "circuit-breaker")]
    CircuitBreaker { task_id: i64, reason: String },

    #[serde(rename = "group:created")]
    GroupCreated { group_id: i64, title: String },

    #[serde(rename = "group:task-stage-complete")]
    GroupTaskStageComplete {
        group_id: i64,
        task_id: i64,
        stage: String,
        summary: String,
    },

    #[serde(rename = "group:paused")]
    GroupPaused {
        group_id: i64,
        reason: String,
        paused_count: usize,
    },

    #[serde(rename = "group:completed")]
    GroupCompleted { group_id: i64 },

    #[serde(rename = "group:deleted")]
    GroupDeleted { group_id: i64 },

    /// Token meter for the renderer
    #[serde(rename = "context-update")]
    ContextUpdate {
        task_id: i64,
        context_tokens: i64,
        context_max: i64,
    },

    // === VCS observability ===
    #[serde(rename = "git:error")]
    GitError {
        task_id: Option<i64>,
        args: Vec<String>,
        error: String,
    },

    #[serde(rename = "worktree:created")]
    WorktreeCreated { task_id: i64, path: String, branch: String },

    #[serde(rename = "worktree:removed")]
    WorktreeRemoved { task_id: i64 },

    #[serde(rename = "branch:created")]
    BranchCreated { task_id: i64, branch: String },

    #[serde(rename = "branch:deleted")]
    BranchDeleted { task_id: i64, branch: String },

    #[serde(rename = "commit:complete")]
    CommitComplete {
        task_id: i64,
        stage: String,
        commit_hash: String,
    },

    #[serde(rename = "push:complete")]
    PushComplete { task_id: i64, branch: String },

    #[serde(rename = "merge:complete")]
    MergeComplete { task_id: i64, target: String },

    #[serde(rename = "merge:conflict")]
    MergeConflict { task_id: i64, message: String },
}

impl PipelineEvent {
    /// The wire `kind` tag
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::Stream { .. } => "pipeline:stream",
            PipelineEvent::TodosUpdated { .. } => "pipeline:todos-updated",
            PipelineEvent::ApprovalRequest { .. } => "pipeline:approval-request",
            PipelineEvent::StageChange { .. } => "pipeline:stageChange",
            PipelineEvent::StageStart { .. } => "stage:start",
            PipelineEvent::StageComplete { .. } => "stage:complete",
            PipelineEvent::StageError { .. } => "stage:error",
            PipelineEvent::StagePause { .. } => "stage:pause",
            PipelineEvent::CircuitBreaker { .. } => "circuit-breaker",
            PipelineEvent::GroupCreated { .. } => "group:created",
            PipelineEvent::GroupTaskStageComplete { .. } => "group:task-stage-complete",
            PipelineEvent::GroupPaused { .. } => "group:paused",
            PipelineEvent::GroupCompleted { .. } => "group:completed",
            PipelineEvent::GroupDeleted { .. } => "group:deleted",
            PipelineEvent::ContextUpdate { .. } => "context-update",
            PipelineEvent::GitError { .. } => "git:error",
            PipelineEvent::WorktreeCreated { .. } => "worktree:created",
            PipelineEvent::WorktreeRemoved { .. } => "worktree:removed",
            PipelineEvent::BranchCreated { .. } => "branch:created",
            PipelineEvent::BranchDeleted { .. } => "branch:deleted",
            PipelineEvent::CommitComplete { .. } => "commit:complete",
            PipelineEvent::PushComplete { .. } => "push:complete",
            PipelineEvent::MergeComplete { .. } => "merge:complete",
            PipelineEvent::MergeConflict { .. } => "merge:conflict",
        }
    }

    /// The task this event concerns, when it concerns exactly one
    pub fn task_id(&self) -> Option<i64> {
        match self {
            PipelineEvent::Stream { task_id, .. }
            | PipelineEvent::TodosUpdated { task_id, .. }
            | PipelineEvent::ApprovalRequest { task_id, .. }
            | PipelineEvent::StageChange { task_id, .. }
            | PipelineEvent::StageStart { task_id, .. }
            | PipelineEvent::StageComplete { task_id, .. }
            | PipelineEvent::StageError { task_id, .. }
            | PipelineEvent::StagePause { task_id, .. }
            | PipelineEvent::CircuitBreaker { task_id, .. }
            | PipelineEvent::GroupTaskStageComplete { task_id, .. }
            | PipelineEvent::ContextUpdate { task_id, .. }
            | PipelineEvent::WorktreeCreated { task_id, .. }
            | PipelineEvent::WorktreeRemoved { task_id, .. }
            | PipelineEvent::BranchCreated { task_id, .. }
            | PipelineEvent::BranchDeleted { task_id, .. }
            | PipelineEvent::CommitComplete { task_id, .. }
            | PipelineEvent::PushComplete { task_id, .. }
            | PipelineEvent::MergeComplete { task_id, .. }
            | PipelineEvent::MergeConflict { task_id, .. } => Some(*task_id),
            PipelineEvent::GitError { task_id, .. } => *task_id,
            PipelineEvent::GroupCreated { .. }
            | PipelineEvent::GroupPaused { .. }
            | PipelineEvent::GroupCompleted { .. }
            | PipelineEvent::GroupDeleted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_match_wire_protocol() {
        let e = PipelineEvent::StageStart {
            task_id: 1,
            stage: "plan".to_string(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "stage:start");
        assert_eq!(e.kind(), "stage:start");
    }

    #[test]
    fn test_stream_event_serializes_type_field() {
        let e = PipelineEvent::Stream {
            task_id: 3,
            agent: "implement".to_string(),
            stream_type: StreamType::ToolUse,
            content: "Write".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "pipeline:stream");
        assert_eq!(json["type"], "tool_use");
    }

    #[test]
    fn test_stage_change_omits_absent_action() {
        let e = PipelineEvent::StageChange {
            task_id: 1,
            stage: "plan".to_string(),
            status: "planning".to_string(),
            action: None,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("action").is_none());
    }

    #[test]
    fn test_task_id_accessor() {
        let e = PipelineEvent::GroupCompleted { group_id: 9 };
        assert_eq!(e.task_id(), None);
        let e = PipelineEvent::CircuitBreaker {
            task_id: 4,
            reason: "plan rejections".to_string(),
        };
        assert_eq!(e.task_id(), Some(4));
    }

    #[test]
    fn test_roundtrip() {
        let e = PipelineEvent::ApprovalRequest {
            request_id: "req-1".to_string(),
            task_id: 2,
            tool_use_id: "tu-1".to_string(),
            tool_name: "Bash".to_string(),
            tool_input: serde_json::json!({"command": "rm -rf /tmp/x"}),
        };
        let json = serde_json::to_string(&e).unwrap();
        let parsed: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), "pipeline:approval-request");
    }
}
