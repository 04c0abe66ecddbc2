//! The per-task pipeline state machine
//!
//! A task advances through its tier's stage sequence. Each stage run
//! streams one SDK session, parses a structured handoff, writes stage
//! outputs, and either advances, waits for human approval, pauses, or
//! blocks. Rejections feed a circuit breaker; restart rolls the worktree
//! back to a stage-tagged commit and clears the affected outputs.

mod engine;
mod hooks;
mod stages;

pub use engine::{PipelineEngine, PipelineError};
pub use hooks::{failed_hook_summary, Hook, HookResult, HookSet};
pub use stages::{clear_fields, config_for, next_stage, sequence_for, Stage, StageConfig, ALL_STAGES};
