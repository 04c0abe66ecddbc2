//! End-to-end pipeline scenarios driven by a scripted LLM client over a
//! real git repository and store.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;

use clawflow::events::{EventBus, PipelineEvent};
use clawflow::group::GroupOrchestrator;
use clawflow::llm::{
    CompletionResponse, LlmClient, LlmError, SessionRequest, StreamChunk, TokenUsage, ToolGate,
};
use clawflow::pipeline::{PipelineEngine, Stage};
use clawflow::runner::SdkRunner;
use clawflow::vcs::GitAdapter;
use clawflow::SharedStore;
use clawstore::{NewTask, PauseReason, Store, TaskPatch, TaskStatus, TaskTier};

/// One scripted agent response, consumed in order
struct ScriptStep {
    files: Vec<(&'static str, &'static str)>,
    output: String,
    delay_ms: u64,
    error: Option<LlmError>,
}

impl ScriptStep {
    fn completed(summary: &str) -> Self {
        Self {
            files: Vec::new(),
            output: format!(
                "Work done.\n\n## Handoff\nStatus: completed\nSummary: {summary}\nOpen Questions: None\n"
            ),
            delay_ms: 0,
            error: None,
        }
    }

    fn blocked(summary: &str) -> Self {
        Self {
            files: Vec::new(),
            output: format!("Stuck.\n\n## Handoff\nStatus: blocked\nSummary: {summary}\n"),
            delay_ms: 0,
            error: None,
        }
    }

    fn needs_intervention(question: &str) -> Self {
        Self {
            files: Vec::new(),
            output: format!(
                "Partway there.\n\n## Handoff\nStatus: needs_intervention\nOpen Questions: {question}\n"
            ),
            delay_ms: 0,
            error: None,
        }
    }

    fn writing(mut self, path: &'static str, content: &'static str) -> Self {
        self.files.push((path, content));
        self
    }

    fn delayed(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    fn erroring(error: LlmError) -> Self {
        Self {
            files: Vec::new(),
            output: String::new(),
            delay_ms: 0,
            error: Some(error),
        }
    }
}

struct ScriptClient {
    steps: Mutex<VecDeque<ScriptStep>>,
}

impl ScriptClient {
    fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptClient {
    async fn stream(
        &self,
        request: SessionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
        _gate: Arc<dyn ToolGate>,
    ) -> Result<CompletionResponse, LlmError> {
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted: unexpected extra stage run");

        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
        }
        if let Some(error) = step.error {
            return Err(error);
        }
        for (name, content) in &step.files {
            tokio::fs::write(request.working_dir.join(name), content)
                .await
                .expect("write scripted file");
        }
        let _ = chunk_tx.send(StreamChunk::Text(step.output.clone())).await;
        Ok(CompletionResponse {
            output: step.output,
            result: None,
            cost: 0.01,
            turns: 1,
            session_id: Some("scripted-session".to_string()),
            usage: TokenUsage::default(),
        })
    }
}

struct Harness {
    store: SharedStore,
    engine: Arc<PipelineEngine>,
    orchestrator: Arc<GroupOrchestrator>,
    bus: Arc<EventBus>,
    repo: tempfile::TempDir,
    _state: tempfile::TempDir,
}

async fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git").args(args).current_dir(dir).output().await.unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

async fn harness(steps: Vec<ScriptStep>) -> Harness {
    let repo = tempfile::TempDir::new().unwrap();
    git(repo.path(), &["init"]).await;
    git(repo.path(), &["config", "user.email", "test@test.com"]).await;
    git(repo.path(), &["config", "user.name", "Test"]).await;
    tokio::fs::write(repo.path().join("README.md"), "# project\n").await.unwrap();
    git(repo.path(), &["add", "-A"]).await;
    git(repo.path(), &["commit", "-m", "initial"]).await;
    git(repo.path(), &["branch", "-M", "main"]).await;

    let state = tempfile::TempDir::new().unwrap();
    let store: SharedStore = Arc::new(tokio::sync::Mutex::new(
        Store::open_project(state.path().join("project.db")).unwrap(),
    ));
    let bus = Arc::new(EventBus::with_default_capacity());
    let vcs = Arc::new(GitAdapter::open(repo.path(), bus.clone()).await.unwrap());
    let client: Arc<dyn LlmClient> = Arc::new(ScriptClient::new(steps));
    let runner = Arc::new(SdkRunner::new(client, store.clone(), bus.clone()));
    let engine = Arc::new(
        PipelineEngine::new(
            store.clone(),
            vcs,
            runner,
            bus.clone(),
            repo.path(),
            clawflow::config::PipelineConfig::default(),
            "test-model".to_string(),
        )
        .unwrap(),
    );
    let orchestrator = Arc::new(GroupOrchestrator::new(store.clone(), engine.clone(), bus.clone()));
    let _listener = orchestrator.start_listener();

    Harness {
        store,
        engine,
        orchestrator,
        bus,
        repo,
        _state: state,
    }
}

async fn create_task(store: &SharedStore, title: &str, tier: TaskTier, auto: bool) -> i64 {
    let mut task = NewTask::new(title, tier);
    task.auto_mode = auto;
    store.lock().await.create_task(task).unwrap().id
}

// === Scenario 1: L2 happy path through brainstorm ===

#[tokio::test]
async fn l2_brainstorm_advances_to_planning() {
    let h = harness(vec![ScriptStep::completed("Explored three approaches")]).await;
    let task_id = create_task(&h.store, "Build the adapter", TaskTier::L2, false).await;

    h.engine.start_task(task_id).await.unwrap();

    let task = h.store.lock().await.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Planning);
    assert_eq!(task.current_agent.as_deref(), Some("plan"));
    assert!(task.brainstorm_output.unwrap().contains("Explored three approaches"));
    assert!(task.started_at.is_some());

    let handoffs = h.store.lock().await.handoffs_for_task(task_id).unwrap();
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0].stage, "brainstorm");
}

// === Scenario 2: rejection and the circuit breaker ===

#[tokio::test]
async fn three_rejections_trip_the_circuit_breaker() {
    let h = harness(vec![
        ScriptStep::completed("brainstorm done"),
        ScriptStep::completed("plan v2"),
        ScriptStep::completed("plan v3"),
    ])
    .await;
    let mut rx = h.bus.subscribe();
    let task_id = create_task(&h.store, "Breaker test", TaskTier::L2, false).await;

    h.engine.start_task(task_id).await.unwrap();
    // Now at plan; reject twice re-runs the stage, the third trips
    h.engine.reject_stage(task_id, "be specific").await.unwrap();
    h.engine.reject_stage(task_id, "still vague").await.unwrap();
    h.engine.reject_stage(task_id, "no").await.unwrap();

    let task = h.store.lock().await.get_task(task_id).unwrap();
    assert_eq!(task.plan_review_count, 3);
    assert_eq!(task.status, TaskStatus::Blocked);

    let mut breaker_seen = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, PipelineEvent::CircuitBreaker { .. }) {
            breaker_seen = true;
        }
    }
    assert!(breaker_seen, "circuit-breaker event was emitted");

    // Approval cannot advance a tripped task
    h.engine.approve_stage(task_id).await.unwrap();
    let task = h.store.lock().await.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
}

// === Scenario 3: stage-aware restart ===

#[tokio::test]
async fn restart_rolls_back_worktree_and_clears_suffix() {
    let h = harness(vec![
        ScriptStep::completed("brainstormed").writing("brainstorm.md", "ideas"),
        ScriptStep::completed("planned").writing("plan.md", "the plan"),
        ScriptStep::needs_intervention("which schema?").writing("wip.rs", "half done"),
    ])
    .await;
    let mut rx = h.bus.subscribe();
    let task_id = create_task(&h.store, "Restart test", TaskTier::L2, false).await;

    h.engine.start_task(task_id).await.unwrap();
    h.engine.step_task(task_id).await.unwrap(); // run plan
    h.engine.approve_stage(task_id).await.unwrap(); // run implement (leaves uncommitted wip)

    // Capture the brainstorm stage commit
    let mut brainstorm_commit = None;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::CommitComplete { stage, commit_hash, .. } = event {
            if stage == "brainstorm" {
                brainstorm_commit = Some(commit_hash);
            }
        }
    }
    let brainstorm_commit = brainstorm_commit.expect("brainstorm was committed");

    let before = h.store.lock().await.get_task(task_id).unwrap();
    assert!(before.plan.is_some());
    assert!(before.implementation_notes.is_some());
    let worktree = std::path::PathBuf::from(before.worktree_path.clone().unwrap());
    assert!(worktree.join("wip.rs").exists());

    h.engine.restart_to_stage(task_id, Stage::Plan).await.unwrap();

    // Worktree is back at the brainstorm commit
    assert_eq!(git(&worktree, &["rev-parse", "HEAD"]).await, brainstorm_commit);
    assert!(worktree.join("brainstorm.md").exists());
    assert!(!worktree.join("plan.md").exists());
    assert!(!worktree.join("wip.rs").exists());

    // Outputs at or after plan are cleared; brainstorm survives
    let task = h.store.lock().await.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Planning);
    assert_eq!(task.current_agent.as_deref(), Some("plan"));
    assert!(task.plan.is_none());
    assert!(task.implementation_notes.is_none());
    assert!(task.review_comments.is_none());
    assert!(task.test_results.is_none());
    assert!(task.verify_result.is_none());
    assert!(task.commit_hash.is_none());
    assert_eq!(task.plan_review_count, 0);
    assert_eq!(task.impl_review_count, 0);
    assert!(task.brainstorm_output.is_some());
    assert!(task.active_session_id.is_none());
    assert!(task.handoffs.is_empty());

    let logs = h.store.lock().await.agent_logs_for_task(task_id).unwrap();
    assert!(logs.iter().any(|l| l.action == "restart"));
}

// === Scenario 4: pause wins the race against a failing session ===

#[tokio::test]
async fn pause_beats_a_racing_stage_failure() {
    let h = harness(vec![
        ScriptStep::completed("planned"),
        // Implement hangs long enough for the pause, then would fail
        ScriptStep::erroring(LlmError::Api {
            status: 500,
            message: "server exploded".to_string(),
        })
        .delayed(5_000),
    ])
    .await;
    let task_id = create_task(&h.store, "Pause race", TaskTier::L1, false).await;

    h.engine.start_task(task_id).await.unwrap(); // plan completes, waits for approval
    let engine = h.engine.clone();
    let approve = tokio::spawn(async move { engine.approve_stage(task_id).await });

    // Let implement enter its (delayed) session, then pause
    tokio::time::sleep(Duration::from_millis(300)).await;
    {
        let task = h.store.lock().await.get_task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Implementing);
    }
    h.engine.pause_task(task_id, PauseReason::Manual).await.unwrap();

    approve.await.unwrap().unwrap();

    let task = h.store.lock().await.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.pause_reason, Some(PauseReason::Manual));
    assert_eq!(task.paused_from_status, Some(TaskStatus::Implementing));
}

// === Scenario 5: group launch, dependency gating, pause propagation ===

#[tokio::test]
async fn group_pauses_when_a_member_fails_and_dependents_never_start() {
    let h = harness(vec![
        ScriptStep::completed("A brainstorm"),
        ScriptStep::completed("A plan"),
        ScriptStep::completed("A implement"),
        ScriptStep::blocked("verify could not run the tests"),
    ])
    .await;
    let mut rx = h.bus.subscribe();

    let a = create_task(&h.store, "Member A", TaskTier::L2, true).await;
    let b = create_task(&h.store, "Member B", TaskTier::L2, true).await;
    let group = {
        let mut store = h.store.lock().await;
        let group = store.create_group("Feature G", None, None).unwrap();
        for id in [a, b] {
            let mut patch = TaskPatch::default();
            patch.group_id = Some(Some(group.id));
            store.update_task(id, &patch).unwrap();
        }
        store.add_task_dependencies(b, &[a]).unwrap();
        group
    };

    h.orchestrator.launch_group(group.id).await.unwrap();

    let mut settled = false;
    for _ in 0..100 {
        {
            let st = h.store.lock().await;
            let a_blocked = st.get_task(a).map(|t| t.status == TaskStatus::Blocked).unwrap_or(false);
            let g_paused = st
                .get_group(group.id)
                .map(|g| g.status == clawstore::GroupStatus::Paused)
                .unwrap_or(false);
            if a_blocked && g_paused {
                settled = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(settled, "member A blocked and group paused");

    // B never started: its dependency never reached done
    let task_b = h.store.lock().await.get_task(b).unwrap();
    assert_eq!(task_b.status, TaskStatus::Backlog);

    let mut group_paused = false;
    let mut member_stage_completes = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::GroupPaused { group_id, .. } => {
                assert_eq!(group_id, group.id);
                group_paused = true;
            }
            PipelineEvent::GroupTaskStageComplete { task_id, .. } => {
                assert_eq!(task_id, a);
                member_stage_completes += 1;
            }
            _ => {}
        }
    }
    assert!(group_paused, "group:paused was emitted");
    assert!(member_stage_completes >= 3, "member stage completions surfaced");
}

// === Full L1 run to done ===

#[tokio::test]
async fn l1_auto_mode_runs_to_done() {
    let h = harness(vec![
        ScriptStep::completed("planned").writing("plan.md", "plan"),
        ScriptStep::completed("implemented, final commit abc1234 created").writing("code.rs", "fn main() {}"),
    ])
    .await;
    let task_id = create_task(&h.store, "Straight through", TaskTier::L1, true).await;

    h.engine.run_full_pipeline(task_id).await.unwrap();

    let task = h.store.lock().await.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.current_agent.is_none());
    assert!(task.completed_at.is_some());
    assert_eq!(task.commit_hash.as_deref(), Some("abc1234"));

    let handoffs = h.store.lock().await.handoffs_for_task(task_id).unwrap();
    assert_eq!(handoffs.len(), 2);
}

// === Resume continues the stored session ===

#[tokio::test]
async fn resume_restores_status_and_reruns_stage() {
    let h = harness(vec![
        ScriptStep::completed("brainstormed"),
        ScriptStep::completed("planned after resume"),
    ])
    .await;
    let task_id = create_task(&h.store, "Resume test", TaskTier::L2, false).await;

    h.engine.start_task(task_id).await.unwrap(); // brainstorm, advance to plan
    h.engine.pause_task(task_id, PauseReason::UsageLimit).await.unwrap();

    {
        let task = h.store.lock().await.get_task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.paused_from_status, Some(TaskStatus::Planning));
        assert_eq!(task.pause_reason, Some(PauseReason::UsageLimit));
    }

    // step on a paused task is a precondition error
    assert!(h.engine.step_task(task_id).await.is_err());

    h.engine.resume_task(task_id).await.unwrap();
    let task = h.store.lock().await.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Planning);
    assert!(task.paused_from_status.is_none());
    assert!(task.pause_reason.is_none());
    assert!(task.plan.unwrap().contains("planned after resume"));
}

// === Stage pause on open questions ===

#[tokio::test]
async fn open_questions_hold_the_stage() {
    let h = harness(vec![ScriptStep::needs_intervention("Which auth provider?")]).await;
    let mut rx = h.bus.subscribe();
    let task_id = create_task(&h.store, "Questions", TaskTier::L2, false).await;

    h.engine.start_task(task_id).await.unwrap();

    // Stage did not advance
    let task = h.store.lock().await.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Brainstorming);
    assert_eq!(task.current_agent.as_deref(), Some("brainstorm"));

    let mut saw_pause = false;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::StagePause { open_questions, .. } = event {
            assert!(open_questions.contains("Which auth provider?"));
            saw_pause = true;
        }
    }
    assert!(saw_pause);
}

// === Worktree isolation ===

#[tokio::test]
async fn start_task_creates_isolated_worktree() {
    let h = harness(vec![ScriptStep::completed("ok").writing("inside.txt", "agent wrote this")]).await;
    let task_id = create_task(&h.store, "Isolated", TaskTier::L2, false).await;

    h.engine.start_task(task_id).await.unwrap();

    let task = h.store.lock().await.get_task(task_id).unwrap();
    let worktree = std::path::PathBuf::from(task.worktree_path.unwrap());
    assert!(worktree.starts_with(h.repo.path().join(".clawflow").join("worktrees")));
    assert!(task.branch_name.unwrap().starts_with("task/"));
    // The agent's file landed in the worktree, not the main checkout
    assert!(worktree.join("inside.txt").exists());
    assert!(!h.repo.path().join("inside.txt").exists());
}
