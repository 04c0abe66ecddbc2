//! PipelineEngine - drives a task through its tier's stage sequence

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clawstore::{
    AgentLogEntry, HandoffStatus, KnowledgeStatus, PauseReason, TaskPatch, TaskStatus, TestResults,
};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::events::{EventBus, PipelineEvent};
use crate::llm::LlmError;
use crate::prompts::{parse_handoff, PromptAssembler};
use crate::runner::{SdkRunner, SessionParams, SessionResult};
use crate::vcs::{GitAdapter, VcsError};
use crate::SharedStore;

use super::hooks::{failed_hook_summary, HookSet};
use super::stages::{clear_fields, config_for, next_stage, sequence_for, Stage, ALL_STAGES};

/// Errors surfaced by engine operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Task {task_id} has no stage {stage}")]
    MissingStage { task_id: i64, stage: String },

    #[error("Store error: {0}")]
    Store(#[from] clawstore::StoreError),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Prompt error: {0}")]
    Prompt(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

const HOOK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How much trailing session output is kept for `peek`
const PEEK_TAIL: usize = 4000;

/// The pipeline engine. One instance drives every task in a project.
pub struct PipelineEngine {
    store: SharedStore,
    vcs: Arc<GitAdapter>,
    runner: Arc<SdkRunner>,
    bus: Arc<EventBus>,
    prompts: PromptAssembler,
    hooks: HookSet,
    config: PipelineConfig,
    default_model: String,
    /// Operator messages queued for each task's next stage run
    pending_messages: Mutex<HashMap<i64, Vec<String>>>,
    /// Tail of each task's most recent session output, for `peek`
    recent_output: Mutex<HashMap<i64, String>>,
}

impl PipelineEngine {
    pub fn new(
        store: SharedStore,
        vcs: Arc<GitAdapter>,
        runner: Arc<SdkRunner>,
        bus: Arc<EventBus>,
        project_path: impl Into<PathBuf>,
        config: PipelineConfig,
        default_model: String,
    ) -> eyre::Result<Self> {
        let project_path = project_path.into();
        let prompts = PromptAssembler::new(&project_path)?;
        let hooks = HookSet::load(&project_path);
        Ok(Self {
            store,
            vcs,
            runner,
            bus,
            prompts,
            hooks,
            config,
            default_model,
            pending_messages: Mutex::new(HashMap::new()),
            recent_output: Mutex::new(HashMap::new()),
        })
    }

    /// The cancellation key shared with the runner
    pub fn session_key(task_id: i64) -> String {
        format!("task-{task_id}")
    }

    fn current_stage(task: &clawstore::Task) -> Result<Stage> {
        task.current_agent
            .as_deref()
            .and_then(Stage::parse)
            .ok_or_else(|| PipelineError::MissingStage {
                task_id: task.id,
                stage: task.current_agent.clone().unwrap_or_default(),
            })
    }

    fn model_for(&self, stage: Stage) -> String {
        let cfg = config_for(stage);
        if cfg.model.is_empty() {
            self.default_model.clone()
        } else {
            cfg.model.to_string()
        }
    }

    /// The circuit breaker: no transition once either phase has hit the
    /// rejection threshold.
    fn can_transition(&self, task: &clawstore::Task) -> bool {
        task.plan_review_count < self.config.circuit_breaker_threshold
            && task.impl_review_count < self.config.circuit_breaker_threshold
    }

    async fn audit(&self, task_id: i64, stage: Stage, action: &str, details: String) {
        let entry = AgentLogEntry {
            timestamp: Utc::now(),
            agent: stage.as_str().to_string(),
            model: self.model_for(stage),
            action: action.to_string(),
            details,
        };
        if let Err(e) = self.store.lock().await.append_agent_log(task_id, &entry) {
            warn!(task_id, action, error = %e, "failed to append audit entry");
        }
    }

    async fn get_task(&self, task_id: i64) -> Result<clawstore::Task> {
        Ok(self.store.lock().await.get_task(task_id)?)
    }

    async fn patch_task(&self, task_id: i64, patch: &TaskPatch) -> Result<clawstore::Task> {
        Ok(self.store.lock().await.update_task(task_id, patch)?)
    }

    // === Operations ===

    /// Start a backlog task: create its worktree, enter the first stage,
    /// and run it.
    pub async fn start_task(&self, task_id: i64) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Backlog {
            return Err(PipelineError::Precondition(format!(
                "Task {task_id} is {}, only backlog tasks can start",
                task.status
            )));
        }
        info!(task_id, tier = task.tier.as_str(), "start_task");

        let (worktree, branch) = self.vcs.create_worktree(task_id, &task.title).await?;
        let first = sequence_for(task.tier)[0];

        let mut patch = TaskPatch::default();
        patch.status = Some(first.status());
        patch.current_agent = Some(Some(first.as_str().to_string()));
        patch.started_at = Some(Some(Utc::now()));
        patch.branch_name = Some(Some(branch));
        patch.worktree_path = Some(Some(worktree.to_string_lossy().to_string()));
        self.patch_task(task_id, &patch).await?;

        self.audit(task_id, first, "start", format!("Task started at {first}")).await;
        self.bus.emit(PipelineEvent::StageChange {
            task_id,
            stage: first.as_str().to_string(),
            status: first.status().as_str().to_string(),
            action: Some("start".to_string()),
        });

        self.run_stage(task_id, first, None, None).await
    }

    /// Re-run the current stage (after a transient failure). A blocked
    /// task is restored to its stage's status first; a paused task must be
    /// resumed instead.
    pub async fn step_task(&self, task_id: i64) -> Result<()> {
        let task = self.get_task(task_id).await?;
        match task.status {
            TaskStatus::Paused => {
                return Err(PipelineError::Precondition(format!(
                    "Task {task_id} is paused; resume it instead"
                )));
            }
            TaskStatus::Backlog => {
                return Err(PipelineError::Precondition(format!("Task {task_id} has not started")));
            }
            TaskStatus::Done => {
                return Err(PipelineError::Precondition(format!("Task {task_id} is done")));
            }
            _ => {}
        }
        let stage = Self::current_stage(&task)?;
        if task.status == TaskStatus::Blocked {
            self.patch_task(task_id, &TaskPatch::status(stage.status())).await?;
        }
        self.run_stage(task_id, stage, None, None).await
    }

    /// Advance through stages until a pausing stage awaits approval or the
    /// task reaches done/blocked/paused.
    pub async fn run_full_pipeline(&self, task_id: i64) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if task.status == TaskStatus::Backlog {
            self.start_task(task_id).await?;
        }

        loop {
            let before = self.get_task(task_id).await?;
            if matches!(
                before.status,
                TaskStatus::Done | TaskStatus::Blocked | TaskStatus::Paused
            ) {
                return Ok(());
            }
            let stage = Self::current_stage(&before)?;
            let already_ran = before.handoffs.iter().any(|h| h.stage == stage.as_str());
            if already_ran {
                // Awaiting approval (pausing stage) or operator input
                return Ok(());
            }

            self.run_stage(task_id, stage, None, None).await?;

            let after = self.get_task(task_id).await?;
            if after.status == before.status && after.current_agent == before.current_agent {
                return Ok(());
            }
        }
    }

    /// Approve the current stage and advance
    pub async fn approve_stage(&self, task_id: i64) -> Result<()> {
        let task = self.get_task(task_id).await?;
        let stage = Self::current_stage(&task)?;
        debug!(task_id, %stage, "approve_stage");
        self.audit(task_id, stage, "approve", format!("Stage {stage} approved")).await;

        if !self.can_transition(&task) {
            self.trip_circuit_breaker(task_id, stage).await?;
            return Ok(());
        }

        match next_stage(task.tier, stage) {
            None | Some(Stage::Done) => {
                let last_output = last_stage_output(&task, stage);
                self.mark_done(task_id, last_output.as_deref()).await
            }
            Some(next) => {
                self.transition_to(task_id, next).await?;
                self.run_stage(task_id, next, None, None).await
            }
        }
    }

    /// Reject the current stage with feedback: bump the phase's counter,
    /// trip the breaker at the threshold, otherwise re-run with the
    /// feedback appended.
    pub async fn reject_stage(&self, task_id: i64, feedback: &str) -> Result<()> {
        let task = self.get_task(task_id).await?;
        let stage = Self::current_stage(&task)?;
        if matches!(task.status, TaskStatus::Paused | TaskStatus::Backlog | TaskStatus::Done) {
            return Err(PipelineError::Precondition(format!(
                "Task {task_id} is {}, nothing to reject",
                task.status
            )));
        }

        let mut patch = TaskPatch::default();
        let count = if stage.is_planning_phase() {
            let count = task.plan_review_count + 1;
            patch.plan_review_count = Some(count);
            count
        } else {
            let count = task.impl_review_count + 1;
            patch.impl_review_count = Some(count);
            count
        };
        self.patch_task(task_id, &patch).await?;
        self.audit(task_id, stage, "reject", feedback.to_string()).await;
        info!(task_id, %stage, count, "stage rejected");

        if count >= self.config.circuit_breaker_threshold {
            self.trip_circuit_breaker(task_id, stage).await?;
            return Ok(());
        }

        self.run_stage(task_id, stage, Some(feedback), None).await
    }

    async fn trip_circuit_breaker(&self, task_id: i64, stage: Stage) -> Result<()> {
        let reason = format!("Circuit breaker tripped at {stage}: rejection threshold reached");
        warn!(task_id, %stage, "circuit breaker tripped");
        self.patch_task(task_id, &TaskPatch::status(TaskStatus::Blocked)).await?;
        self.audit(task_id, stage, "circuit_breaker", reason.clone()).await;
        self.bus.emit(PipelineEvent::CircuitBreaker { task_id, reason });
        Ok(())
    }

    /// Pause a task: persist the pre-pause status first so a racing stage
    /// failure observes the pause, then abort the session. Idempotent.
    pub async fn pause_task(&self, task_id: i64, reason: PauseReason) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if task.status == TaskStatus::Paused {
            debug!(task_id, "pause_task: already paused");
            return Ok(());
        }
        if matches!(task.status, TaskStatus::Backlog | TaskStatus::Done) {
            return Err(PipelineError::Precondition(format!(
                "Task {task_id} is {}, nothing to pause",
                task.status
            )));
        }
        info!(task_id, reason = reason.as_str(), "pause_task");

        let mut patch = TaskPatch::default();
        patch.paused_from_status = Some(Some(task.status));
        patch.status = Some(TaskStatus::Paused);
        patch.pause_reason = Some(Some(reason));
        self.patch_task(task_id, &patch).await?;

        self.runner.abort_session(&Self::session_key(task_id));

        if let Ok(stage) = Self::current_stage(&task) {
            self.audit(task_id, stage, "pause", format!("Paused ({})", reason.as_str())).await;
        }
        self.bus.emit(PipelineEvent::StageChange {
            task_id,
            stage: task.current_agent.clone().unwrap_or_default(),
            status: TaskStatus::Paused.as_str().to_string(),
            action: Some("pause".to_string()),
        });
        Ok(())
    }

    /// Resume a paused task: restore its status atomically with clearing
    /// the pause fields, then continue the stage's SDK session.
    pub async fn resume_task(&self, task_id: i64) -> Result<()> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Paused {
            return Err(PipelineError::Precondition(format!("Task {task_id} is not paused")));
        }
        let restored = task.paused_from_status.ok_or_else(|| {
            PipelineError::Precondition(format!("Task {task_id} is paused without a saved status"))
        })?;
        info!(task_id, restored = restored.as_str(), "resume_task");

        let mut patch = TaskPatch::default();
        patch.status = Some(restored);
        patch.paused_from_status = Some(None);
        patch.pause_reason = Some(None);
        self.patch_task(task_id, &patch).await?;

        let stage = match Self::current_stage(&task) {
            Ok(stage) => stage,
            // Paused from a non-stage state; restoring the status is enough
            Err(_) => return Ok(()),
        };
        self.audit(task_id, stage, "resume", format!("Resumed to {}", restored.as_str())).await;

        if restored == TaskStatus::Blocked || restored == TaskStatus::Done {
            return Ok(());
        }
        // Continue the prior SDK session rather than starting over
        self.run_stage(task_id, stage, None, task.active_session_id.clone()).await
    }

    /// Roll a task back to an earlier (or the same) stage: abort the
    /// session, reset the worktree to the prior stage's commit, clear every
    /// stage output at or after the target, and re-enter the target stage.
    pub async fn restart_to_stage(&self, task_id: i64, target: Stage) -> Result<()> {
        let task = self.get_task(task_id).await?;
        let sequence = sequence_for(task.tier);
        let target_index = sequence
            .iter()
            .position(|s| *s == target)
            .ok_or_else(|| PipelineError::Precondition(format!(
                "Stage {target} is not in the {} sequence",
                task.tier.as_str()
            )))?;
        info!(task_id, %target, "restart_to_stage");

        // 1. Abort the active session and forget it
        self.runner.abort_session(&Self::session_key(task_id));

        // 2. Roll the worktree back; a VCS failure degrades to
        //    stash-and-reset and never aborts the restart
        let rollback = if target_index == 0 {
            self.vcs.stash_and_reset(task_id).await.map(|_| ())
        } else {
            self.vcs
                .reset_to_stage_commit(task_id, sequence[target_index - 1].as_str())
                .await
        };
        if let Err(e) = rollback {
            warn!(task_id, error = %e, "restart rollback failed, falling back to stash-and-reset");
            if let Err(e) = self.vcs.stash_and_reset(task_id).await {
                warn!(task_id, error = %e, "stash-and-reset fallback also failed");
            }
        }

        // 3. Clear stage outputs for every stage at or after the target
        let mut patch = TaskPatch::default();
        for stage in ALL_STAGES {
            if stage.ordinal() >= target.ordinal() {
                for field in clear_fields(stage) {
                    apply_clear(&mut patch, field);
                }
            }
        }
        patch.active_session_id = Some(None);
        patch.rich_handoff = Some(None);
        patch.todos = Some(Vec::new());
        patch.context_tokens = Some(None);
        patch.context_max = Some(None);

        // 4. Enter the target stage
        patch.status = Some(target.status());
        patch.current_agent = Some(Some(target.as_str().to_string()));
        self.patch_task(task_id, &patch).await?;
        self.store.lock().await.clear_handoffs(task_id)?;

        self.audit(task_id, target, "restart", format!("Restarted to {target}")).await;
        self.bus.emit(PipelineEvent::StageChange {
            task_id,
            stage: target.as_str().to_string(),
            status: target.status().as_str().to_string(),
            action: Some("restart".to_string()),
        });
        Ok(())
    }

    /// Queue an operator message for the task's next stage run
    pub async fn message_agent(&self, task_id: i64, content: &str) -> Result<()> {
        self.get_task(task_id).await?;
        self.pending_messages
            .lock()
            .await
            .entry(task_id)
            .or_default()
            .push(content.to_string());
        let entry = AgentLogEntry {
            timestamp: Utc::now(),
            agent: "operator".to_string(),
            model: String::new(),
            action: "message".to_string(),
            details: content.to_string(),
        };
        if let Err(e) = self.store.lock().await.append_agent_log(task_id, &entry) {
            warn!(task_id, error = %e, "failed to log operator message");
        }
        Ok(())
    }

    /// Snapshot of the task's most recent session output
    pub async fn peek_agent(&self, task_id: i64) -> Result<String> {
        self.get_task(task_id).await?;
        Ok(self
            .recent_output
            .lock()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn transition_to(&self, task_id: i64, next: Stage) -> Result<()> {
        let mut patch = TaskPatch::default();
        patch.status = Some(next.status());
        patch.current_agent = Some(Some(next.as_str().to_string()));
        self.patch_task(task_id, &patch).await?;
        self.bus.emit(PipelineEvent::StageChange {
            task_id,
            stage: next.as_str().to_string(),
            status: next.status().as_str().to_string(),
            action: None,
        });
        Ok(())
    }

    async fn mark_done(&self, task_id: i64, final_output: Option<&str>) -> Result<()> {
        info!(task_id, "mark_done");
        let mut patch = TaskPatch::default();
        patch.status = Some(TaskStatus::Done);
        patch.current_agent = Some(None);
        patch.completed_at = Some(Some(Utc::now()));
        if let Some(hash) = final_output.and_then(extract_commit_hash) {
            patch.commit_hash = Some(Some(hash));
        }
        self.patch_task(task_id, &patch).await?;
        self.audit(task_id, Stage::Done, "done", "Task completed".to_string()).await;
        self.bus.emit(PipelineEvent::StageChange {
            task_id,
            stage: Stage::Done.as_str().to_string(),
            status: TaskStatus::Done.as_str().to_string(),
            action: None,
        });

        let task = self.get_task(task_id).await?;
        if task.auto_merge {
            match self.vcs.merge(task_id, None).await {
                Ok(outcome) if outcome.conflicts => {
                    warn!(task_id, "auto-merge hit conflicts, pausing task");
                    let mut patch = TaskPatch::default();
                    patch.paused_from_status = Some(Some(TaskStatus::Done));
                    patch.status = Some(TaskStatus::Paused);
                    patch.pause_reason = Some(Some(PauseReason::MergeConflict));
                    self.patch_task(task_id, &patch).await?;
                }
                Ok(_) => {}
                Err(e) => warn!(task_id, error = %e, "auto-merge failed"),
            }
        }
        Ok(())
    }

    /// Run one stage: compose the prompt, stream the session under the
    /// stage timeout, parse the handoff, write outputs, and dispatch.
    ///
    /// SDK failures are absorbed here: they are audited, emitted as
    /// `stage:error`, and move the task to blocked unless a concurrent
    /// pause already won.
    pub async fn run_stage(
        &self,
        task_id: i64,
        stage: Stage,
        feedback: Option<&str>,
        resume_session_id: Option<String>,
    ) -> Result<()> {
        if stage == Stage::Done {
            return self.mark_done(task_id, None).await;
        }
        let task = self.get_task(task_id).await?;
        let cfg = config_for(stage);
        let model = self.model_for(stage);

        self.bus.emit(PipelineEvent::StageStart {
            task_id,
            stage: stage.as_str().to_string(),
        });
        self.audit(task_id, stage, "stage_start", format!("Running {stage}")).await;

        let knowledge = self
            .store
            .lock()
            .await
            .list_knowledge(None, Some(KnowledgeStatus::Active))?;
        // Tasks without an assigned skill fall back to the stage's default
        let mut prompt_task = task.clone();
        if prompt_task.assigned_skill.is_none() && !cfg.skill.is_empty() {
            prompt_task.assigned_skill = Some(cfg.skill.to_string());
        }
        let (system_prompt, mut prompt) = self
            .prompts
            .compose(&prompt_task, stage.as_str(), &knowledge, feedback)
            .map_err(|e| PipelineError::Prompt(e.to_string()))?;

        // Operator messages queued since the last run land in this turn
        let queued = self.pending_messages.lock().await.remove(&task_id).unwrap_or_default();
        if !queued.is_empty() {
            prompt.push_str("\n\n## Messages from the orchestrator\n");
            for message in &queued {
                prompt.push_str(&format!("- {message}\n"));
            }
        }

        let params = SessionParams {
            task_id,
            agent: stage.as_str().to_string(),
            stage: stage.as_str().to_string(),
            system_prompt,
            prompt,
            model: model.clone(),
            max_turns: cfg.max_turns,
            working_dir: task
                .worktree_path
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            auto_mode: task.auto_mode,
            resume_session_id,
            session_key: Some(Self::session_key(task_id)),
        };

        let timeout = Duration::from_millis(cfg.timeout_ms.min(self.config.stage_timeout_ms));
        let outcome = match tokio::time::timeout(timeout, self.runner.run(params)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // The stage outlived its budget; stop the session
                self.runner.abort_session(&Self::session_key(task_id));
                Err(LlmError::InvalidResponse(format!(
                    "stage {stage} timed out after {timeout:?}"
                )))
            }
        };

        match outcome {
            Ok(result) => self.complete_stage(task_id, stage, &model, result).await,
            Err(e) => self.fail_stage(task_id, stage, e).await,
        }
    }

    async fn complete_stage(
        &self,
        task_id: i64,
        stage: Stage,
        model: &str,
        result: SessionResult,
    ) -> Result<()> {
        let cfg = config_for(stage);
        let handoff = parse_handoff(&result.output, stage.as_str(), stage.as_str(), model);

        {
            let mut store = self.store.lock().await;
            store.append_handoff(task_id, &handoff)?;
            let patch = stage_output_patch(stage, &result.output);
            store.update_task(task_id, &patch)?;
        }
        self.remember_output(task_id, &result.output).await;
        self.audit(task_id, stage, "stage_complete", handoff.summary.clone()).await;

        match handoff.status {
            HandoffStatus::Blocked => {
                self.patch_task(task_id, &TaskPatch::status(TaskStatus::Blocked)).await?;
                self.bus.emit(PipelineEvent::StageError {
                    task_id,
                    stage: stage.as_str().to_string(),
                    error: if handoff.summary.is_empty() {
                        "Agent reported blocked".to_string()
                    } else {
                        handoff.summary.clone()
                    },
                });
                return Ok(());
            }
            HandoffStatus::NeedsIntervention => {
                self.bus.emit(PipelineEvent::StagePause {
                    task_id,
                    stage: stage.as_str().to_string(),
                    open_questions: handoff.open_questions.clone(),
                });
                return Ok(());
            }
            HandoffStatus::Completed if !handoff.open_questions.is_empty() => {
                self.bus.emit(PipelineEvent::StagePause {
                    task_id,
                    stage: stage.as_str().to_string(),
                    open_questions: handoff.open_questions.clone(),
                });
                return Ok(());
            }
            HandoffStatus::Completed => {}
        }

        // Required post-stage checks gate completion; a failed hook blocks
        // the task and never re-enters the rejection path
        let task = self.get_task(task_id).await?;
        if let Some(worktree) = task.worktree_path.as_deref() {
            let results = self
                .hooks
                .run_for_stage(stage, std::path::Path::new(worktree), HOOK_TIMEOUT)
                .await;
            if let Some(summary) = failed_hook_summary(&results) {
                self.patch_task(task_id, &TaskPatch::status(TaskStatus::Blocked)).await?;
                self.audit(task_id, stage, "hooks_failed", summary.clone()).await;
                self.bus.emit(PipelineEvent::StageError {
                    task_id,
                    stage: stage.as_str().to_string(),
                    error: summary,
                });
                return Ok(());
            }
        }

        // Stage boundary: isolate this stage's changes behind a tagged
        // commit so restart can find it
        if let Err(e) = self.vcs.stage_commit(task_id, stage.as_str()).await {
            warn!(task_id, %stage, error = %e, "stage commit failed");
        }

        self.bus.emit(PipelineEvent::StageComplete {
            task_id,
            stage: stage.as_str().to_string(),
            summary: handoff.summary.clone(),
        });

        if cfg.pauses && !task.auto_mode {
            debug!(task_id, %stage, "stage awaits human approval");
            return Ok(());
        }

        match next_stage(task.tier, stage) {
            None | Some(Stage::Done) => self.mark_done(task_id, Some(&result.output)).await,
            Some(next) => {
                let fresh = self.get_task(task_id).await?;
                if !self.can_transition(&fresh) {
                    self.trip_circuit_breaker(task_id, stage).await?;
                    return Ok(());
                }
                self.transition_to(task_id, next).await
            }
        }
    }

    async fn fail_stage(&self, task_id: i64, stage: Stage, error: LlmError) -> Result<()> {
        warn!(task_id, %stage, error = %error, "stage failed");
        self.audit(task_id, stage, "stage_error", error.to_string()).await;

        // Pausing races the failure; the pause must win
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Paused {
            self.patch_task(task_id, &TaskPatch::status(TaskStatus::Blocked)).await?;
        }

        self.bus.emit(PipelineEvent::StageError {
            task_id,
            stage: stage.as_str().to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn remember_output(&self, task_id: i64, output: &str) {
        let tail = if output.len() > PEEK_TAIL {
            let mut start = output.len() - PEEK_TAIL;
            while !output.is_char_boundary(start) {
                start += 1;
            }
            output[start..].to_string()
        } else {
            output.to_string()
        };
        self.recent_output.lock().await.insert(task_id, tail);
    }
}

/// Clear one field by name when restarting (counters reset to 0, outputs
/// to NULL)
fn apply_clear(patch: &mut TaskPatch, field: &str) {
    match field {
        "brainstorm_output" => patch.brainstorm_output = Some(None),
        "design_review" => patch.design_review = Some(None),
        "plan" => patch.plan = Some(None),
        "implementation_notes" => patch.implementation_notes = Some(None),
        "review_comments" => patch.review_comments = Some(None),
        "review_score" => patch.review_score = Some(None),
        "verify_result" => patch.verify_result = Some(None),
        "test_results" => patch.test_results = Some(None),
        "commit_hash" => patch.commit_hash = Some(None),
        "completed_at" => patch.completed_at = Some(None),
        "plan_review_count" => patch.plan_review_count = Some(0),
        "impl_review_count" => patch.impl_review_count = Some(0),
        other => warn!(field = other, "unknown clear field"),
    }
}

/// Write the stage's output into the task field it populates
fn stage_output_patch(stage: Stage, output: &str) -> TaskPatch {
    let mut patch = TaskPatch::default();
    let text = Some(Some(output.to_string()));
    match stage {
        Stage::Brainstorm => patch.brainstorm_output = text,
        Stage::DesignReview => patch.design_review = text,
        Stage::Plan => patch.plan = text,
        Stage::Implement => patch.implementation_notes = text,
        Stage::CodeReview => {
            patch.review_comments = text;
            patch.review_score = Some(extract_review_score(output));
        }
        Stage::Verify => {
            patch.verify_result = text;
            patch.test_results = Some(Some(TestResults {
                passed: tests_passed(output),
                summary: output.lines().next().unwrap_or_default().to_string(),
            }));
        }
        Stage::Done => {}
    }
    patch
}

fn extract_review_score(output: &str) -> Option<f64> {
    let re = Regex::new(r"(?i)(?:score|rating)\s*[:=]\s*(\d+(?:\.\d+)?)").expect("static regex");
    re.captures(output).and_then(|c| c[1].parse().ok())
}

fn tests_passed(output: &str) -> bool {
    let re = Regex::new(r"(?i)tests?\s+passed").expect("static regex");
    re.is_match(output)
}

fn extract_commit_hash(output: &str) -> Option<String> {
    let re = Regex::new(r"(?i)commit\s+([0-9a-f]{7,40})\b").expect("static regex");
    re.captures(output).map(|c| c[1].to_lowercase())
}

/// The stored output of the stage the task just finished
fn last_stage_output(task: &clawstore::Task, stage: Stage) -> Option<String> {
    match stage {
        Stage::Brainstorm => task.brainstorm_output.clone(),
        Stage::DesignReview => task.design_review.clone(),
        Stage::Plan => task.plan.clone(),
        Stage::Implement => task.implementation_notes.clone(),
        Stage::CodeReview => task.review_comments.clone(),
        Stage::Verify => task.verify_result.clone(),
        Stage::Done => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_review_score() {
        assert_eq!(extract_review_score("Overall Score: 8.5 out of 10"), Some(8.5));
        assert_eq!(extract_review_score("rating = 7"), Some(7.0));
        assert_eq!(extract_review_score("no score here"), None);
    }

    #[test]
    fn test_tests_passed_detection() {
        assert!(tests_passed("All 42 tests passed."));
        assert!(tests_passed("Tests Passed"));
        assert!(!tests_passed("3 tests failed"));
    }

    #[test]
    fn test_extract_commit_hash() {
        assert_eq!(
            extract_commit_hash("Final commit abc1234 pushed").as_deref(),
            Some("abc1234")
        );
        assert_eq!(
            extract_commit_hash("Commit DEADBEEFCAFE done").as_deref(),
            Some("deadbeefcafe")
        );
        assert_eq!(extract_commit_hash("no hash"), None);
    }

    #[test]
    fn test_stage_output_patch_code_review() {
        let patch = stage_output_patch(Stage::CodeReview, "Looks good.\nScore: 9");
        assert!(patch.review_comments.is_some());
        assert_eq!(patch.review_score, Some(Some(9.0)));
    }

    #[test]
    fn test_stage_output_patch_verify() {
        let patch = stage_output_patch(Stage::Verify, "ok\nAll tests passed");
        let tr = patch.test_results.unwrap().unwrap();
        assert!(tr.passed);
        assert_eq!(tr.summary, "ok");
    }

    #[test]
    fn test_apply_clear_counters_zero() {
        let mut patch = TaskPatch::default();
        apply_clear(&mut patch, "plan_review_count");
        apply_clear(&mut patch, "plan");
        assert_eq!(patch.plan_review_count, Some(0));
        assert_eq!(patch.plan, Some(None));
    }
}
