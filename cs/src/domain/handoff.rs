//! Handoff and audit-log records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status reported by a stage's handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Completed,
    Blocked,
    NeedsIntervention,
}

impl HandoffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Completed => "completed",
            HandoffStatus::Blocked => "blocked",
            HandoffStatus::NeedsIntervention => "needs_intervention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(HandoffStatus::Completed),
            "blocked" => Some(HandoffStatus::Blocked),
            "needs_intervention" => Some(HandoffStatus::NeedsIntervention),
            _ => None,
        }
    }
}

/// One stage's structured output passed to the next stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub status: HandoffStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_decisions: String,
    #[serde(default)]
    pub open_questions: String,
    #[serde(default)]
    pub files_modified: String,
    #[serde(default)]
    pub next_stage_needs: String,
    #[serde(default)]
    pub warnings: String,
}

impl Handoff {
    /// An empty `completed` handoff for the given stage
    pub fn completed(stage: &str, agent: &str, model: &str) -> Self {
        Self {
            stage: stage.to_string(),
            agent: agent.to_string(),
            model: model.to_string(),
            timestamp: Utc::now(),
            status: HandoffStatus::Completed,
            summary: String::new(),
            key_decisions: String::new(),
            open_questions: String::new(),
            files_modified: String::new(),
            next_stage_needs: String::new(),
            warnings: String::new(),
        }
    }
}

/// Immutable audit record of one engine action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogEntry {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub model: String,
    pub action: String,
    pub details: String,
}
