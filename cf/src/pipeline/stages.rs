//! Stage vocabulary: tier sequences, per-stage config, status mapping,
//! and the restart clear-field table

use clawstore::{TaskStatus, TaskTier};
use serde::{Deserialize, Serialize};

/// One step of a task's pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Brainstorm,
    DesignReview,
    Plan,
    Implement,
    CodeReview,
    Verify,
    Done,
}

/// Canonical ordering over all stages, used for the restart suffix clear
pub const ALL_STAGES: [Stage; 7] = [
    Stage::Brainstorm,
    Stage::DesignReview,
    Stage::Plan,
    Stage::Implement,
    Stage::CodeReview,
    Stage::Verify,
    Stage::Done,
];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Brainstorm => "brainstorm",
            Stage::DesignReview => "design_review",
            Stage::Plan => "plan",
            Stage::Implement => "implement",
            Stage::CodeReview => "code_review",
            Stage::Verify => "verify",
            Stage::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "brainstorm" => Some(Stage::Brainstorm),
            "design_review" => Some(Stage::DesignReview),
            "plan" => Some(Stage::Plan),
            "implement" => Some(Stage::Implement),
            "code_review" => Some(Stage::CodeReview),
            "verify" => Some(Stage::Verify),
            "done" => Some(Stage::Done),
            _ => None,
        }
    }

    /// The external task status while this stage runs
    pub fn status(&self) -> TaskStatus {
        match self {
            Stage::Brainstorm => TaskStatus::Brainstorming,
            Stage::DesignReview => TaskStatus::DesignReview,
            Stage::Plan => TaskStatus::Planning,
            Stage::Implement => TaskStatus::Implementing,
            Stage::CodeReview => TaskStatus::CodeReview,
            Stage::Verify => TaskStatus::Verifying,
            Stage::Done => TaskStatus::Done,
        }
    }

    /// Position in the canonical ordering
    pub fn ordinal(&self) -> usize {
        ALL_STAGES.iter().position(|s| s == self).expect("stage in ALL_STAGES")
    }

    /// Whether rejections at this stage count against the planning phase
    /// (as opposed to the implementation phase)
    pub fn is_planning_phase(&self) -> bool {
        matches!(self, Stage::Brainstorm | Stage::DesignReview | Stage::Plan)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The stage sequence selected by a task's tier
pub fn sequence_for(tier: TaskTier) -> &'static [Stage] {
    match tier {
        TaskTier::L1 => &[Stage::Plan, Stage::Implement, Stage::Done],
        TaskTier::L2 => &[Stage::Brainstorm, Stage::Plan, Stage::Implement, Stage::Verify, Stage::Done],
        TaskTier::L3 => &[
            Stage::Brainstorm,
            Stage::DesignReview,
            Stage::Plan,
            Stage::Implement,
            Stage::CodeReview,
            Stage::Verify,
            Stage::Done,
        ],
    }
}

/// The stage after `stage` in the tier's sequence
pub fn next_stage(tier: TaskTier, stage: Stage) -> Option<Stage> {
    let seq = sequence_for(tier);
    let idx = seq.iter().position(|s| *s == stage)?;
    seq.get(idx + 1).copied()
}

/// Static per-stage configuration
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Model override; empty means the configured default
    pub model: &'static str,
    pub max_turns: u32,
    /// Whether the stage waits for human approval before advancing
    pub pauses: bool,
    /// Skill applied by default when the task has none assigned
    pub skill: &'static str,
    pub timeout_ms: u64,
}

const DEFAULT_STAGE_TIMEOUT_MS: u64 = 15 * 60 * 1000;

/// Config for one stage. `Done` is a terminal marker and never runs.
pub fn config_for(stage: Stage) -> StageConfig {
    match stage {
        Stage::Brainstorm => StageConfig {
            model: "",
            max_turns: 20,
            pauses: false,
            skill: "",
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        },
        Stage::DesignReview => StageConfig {
            model: "",
            max_turns: 15,
            pauses: true,
            skill: "",
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        },
        Stage::Plan => StageConfig {
            model: "",
            max_turns: 25,
            pauses: true,
            skill: "",
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        },
        Stage::Implement => StageConfig {
            model: "",
            max_turns: 60,
            pauses: false,
            skill: "minimal-diff",
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        },
        Stage::CodeReview => StageConfig {
            model: "",
            max_turns: 20,
            pauses: true,
            skill: "",
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        },
        Stage::Verify => StageConfig {
            model: "",
            max_turns: 30,
            pauses: false,
            skill: "",
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        },
        Stage::Done => StageConfig {
            model: "",
            max_turns: 0,
            pauses: false,
            skill: "",
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
        },
    }
}

/// Task fields each stage populates, used by restart to clear the suffix.
/// `plan_review_count`/`impl_review_count` reset to 0; other fields null.
pub fn clear_fields(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Brainstorm => &["brainstorm_output"],
        Stage::DesignReview => &["design_review"],
        Stage::Plan => &["plan", "plan_review_count"],
        Stage::Implement => &["implementation_notes", "impl_review_count"],
        Stage::CodeReview => &["review_comments", "review_score"],
        Stage::Verify => &["verify_result", "test_results"],
        Stage::Done => &["commit_hash", "completed_at"],
    }
}
