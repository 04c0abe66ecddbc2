//! TaskGroup - a set of tasks implementing one feature

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Planning,
    Queued,
    Running,
    Paused,
    Completed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Planning => "planning",
            GroupStatus::Queued => "queued",
            GroupStatus::Running => "running",
            GroupStatus::Paused => "paused",
            GroupStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planning" => Some(GroupStatus::Planning),
            "queued" => Some(GroupStatus::Queued),
            "running" => Some(GroupStatus::Running),
            "paused" => Some(GroupStatus::Paused),
            "completed" => Some(GroupStatus::Completed),
            _ => None,
        }
    }
}

/// A set of tasks produced together from a workshop conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: i64,
    pub title: String,
    /// Originating workshop session, if any
    pub session_id: Option<i64>,
    pub status: GroupStatus,
    /// Free-text context shared by every member task's prompts
    pub shared_context: Option<String>,
    /// Design artifact the group was planned from
    pub design_artifact_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
