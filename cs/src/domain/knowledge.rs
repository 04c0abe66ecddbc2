//! KnowledgeEntry - agent-produced facts kept for reuse

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    BusinessRule,
    Architecture,
    ApiQuirk,
    LessonLearned,
    Convention,
}

impl KnowledgeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeCategory::BusinessRule => "business_rule",
            KnowledgeCategory::Architecture => "architecture",
            KnowledgeCategory::ApiQuirk => "api_quirk",
            KnowledgeCategory::LessonLearned => "lesson_learned",
            KnowledgeCategory::Convention => "convention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "business_rule" => Some(KnowledgeCategory::BusinessRule),
            "architecture" => Some(KnowledgeCategory::Architecture),
            "api_quirk" => Some(KnowledgeCategory::ApiQuirk),
            "lesson_learned" => Some(KnowledgeCategory::LessonLearned),
            "convention" => Some(KnowledgeCategory::Convention),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeSource {
    Workshop,
    Pipeline,
    Manual,
    Fdrl,
}

impl KnowledgeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeSource::Workshop => "workshop",
            KnowledgeSource::Pipeline => "pipeline",
            KnowledgeSource::Manual => "manual",
            KnowledgeSource::Fdrl => "fdrl",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "workshop" => Some(KnowledgeSource::Workshop),
            "pipeline" => Some(KnowledgeSource::Pipeline),
            "manual" => Some(KnowledgeSource::Manual),
            "fdrl" => Some(KnowledgeSource::Fdrl),
            _ => None,
        }
    }
}

/// Promotion state: candidates await human review, active entries feed
/// prompt assembly, archived entries are kept but never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeStatus {
    Candidate,
    Active,
    Archived,
}

impl KnowledgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeStatus::Candidate => "candidate",
            KnowledgeStatus::Active => "active",
            KnowledgeStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candidate" => Some(KnowledgeStatus::Candidate),
            "active" => Some(KnowledgeStatus::Active),
            "archived" => Some(KnowledgeStatus::Archived),
            _ => None,
        }
    }
}

/// A fact produced by agents for reuse across tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// UUID, stable across updates to the same `(key, status)` row
    pub id: String,
    /// Short identifier; unique together with `status` within a scope
    pub key: String,
    pub summary: String,
    pub content: String,
    pub category: KnowledgeCategory,
    #[serde(default)]
    pub tags: Vec<String>,
    pub source: KnowledgeSource,
    pub source_id: Option<String>,
    pub status: KnowledgeStatus,
    pub token_estimate: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
