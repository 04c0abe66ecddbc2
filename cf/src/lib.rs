//! ClawFlow - staged pipeline orchestrator for LLM coding agents
//!
//! ClawFlow drives coding agents through a structured, per-task pipeline
//! with human gates at review points. Each task owns an isolated git
//! worktree, a streaming SDK session, and a durable state row; groups of
//! tasks implementing one feature run concurrently under a coordinator
//! with shared pause/resume.
//!
//! # Core Concepts
//!
//! - **Stages, not iterations**: a task advances brainstorm -> plan ->
//!   implement -> verify according to its tier, with stage-tagged commits
//!   so any stage can be rolled back to later
//! - **Pause wins**: human pause always beats a racing failure
//! - **Circuit breaker**: three rejections in a phase blocks the task
//! - **Everything observable**: every transition emits an event consumed
//!   by the renderer over a broadcast bus
//!
//! # Modules
//!
//! - [`events`] - Event vocabulary and broadcast bus
//! - [`vcs`] - Per-task worktrees, stage commits, rollback, merge
//! - [`llm`] - LLM client trait and Anthropic streaming implementation
//! - [`runner`] - SDK session runner: streaming, retries, cancellation
//! - [`pipeline`] - The per-task stage state machine
//! - [`group`] - Orchestration of task groups
//! - [`prompts`] - Template rendering and handoff parsing
//! - [`commands`] - Renderer-facing command surface

pub mod cli;
pub mod commands;
pub mod config;
pub mod events;
pub mod group;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod runner;
pub mod vcs;

use std::sync::Arc;

/// The store is shared across sessions; each public mutator runs in its own
/// transaction, so a single async mutex gives single-writer discipline.
pub type SharedStore = Arc<tokio::sync::Mutex<clawstore::Store>>;

pub use config::Config;
pub use events::{EventBus, PipelineEvent};
pub use llm::{AnthropicClient, LlmClient, LlmError};
pub use pipeline::{PipelineEngine, Stage};
pub use runner::{SdkRunner, SessionParams, SessionRegistry, SessionResult};
pub use vcs::GitAdapter;
