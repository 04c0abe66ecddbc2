//! The session run loop: streaming, permissions, retries, persistence

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use clawstore::{KnowledgeCategory, KnowledgeSource, KnowledgeStatus, NewKnowledge, TaskPatch, TodoItem, TodoStatus};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, PipelineEvent, StreamType};
use crate::llm::{
    LlmClient, LlmError, PermissionDecision, SessionRequest, StreamChunk, TokenUsage, ToolGate,
};
use crate::SharedStore;

use super::approvals::ApprovalBroker;
use super::registry::{abortable_sleep, CancelToken, SessionRegistry};

/// Retries after the initial attempt
pub const MAX_RETRIES: u32 = 3;

/// Hard cap on any delay between retries, including `retry-after`
pub const RETRY_DELAY_CAP: Duration = Duration::from_secs(120);

/// Default delay for a 429 without a `retry-after` hint
const RATE_LIMIT_DEFAULT_DELAY: Duration = Duration::from_secs(30);

/// Base for exponential backoff
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Debounce window for todo persistence
const TODO_DEBOUNCE: Duration = Duration::from_millis(500);

/// Tools that are always read-only
const READ_ONLY_TOOLS: [&str; 5] = ["Read", "Glob", "Grep", "WebSearch", "WebFetch"];

/// Orchestration bookkeeping tools
const ORCHESTRATION_TOOLS: [&str; 5] = ["TaskCreate", "TaskUpdate", "TaskList", "TaskGet", "TodoWrite"];

/// Parameters for one session run
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub task_id: i64,
    /// Stage name, used as the agent label on stream events
    pub agent: String,
    pub stage: String,
    pub system_prompt: String,
    pub prompt: String,
    pub model: String,
    pub max_turns: u32,
    /// The task's worktree
    pub working_dir: PathBuf,
    pub auto_mode: bool,
    /// Continue a prior SDK session
    pub resume_session_id: Option<String>,
    /// Key for cancellation and retry tracking; defaults to `task-{id}`
    pub session_key: Option<String>,
}

impl SessionParams {
    pub fn session_key(&self) -> String {
        self.session_key
            .clone()
            .unwrap_or_else(|| format!("task-{}", self.task_id))
    }
}

/// Final outcome of a session run
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub output: String,
    pub cost: f64,
    pub turns: u32,
    pub session_id: Option<String>,
    pub context_tokens: i64,
    pub context_max: i64,
    pub usage: TokenUsage,
}

/// Delay before the next retry. 429 honors the server hint (default 30 s);
/// everything else backs off exponentially. Always capped at two minutes.
pub fn retry_delay(error: &LlmError, attempt: u32) -> Duration {
    let delay = match error.retry_after() {
        Some(hint) => hint,
        None if matches!(error, LlmError::RateLimited { .. }) => RATE_LIMIT_DEFAULT_DELAY,
        None => BACKOFF_BASE * 2u32.saturating_pow(attempt),
    };
    delay.min(RETRY_DELAY_CAP)
}

/// The SDK session runner
pub struct SdkRunner {
    client: Arc<dyn LlmClient>,
    store: SharedStore,
    bus: Arc<EventBus>,
    registry: SessionRegistry,
    approvals: Arc<ApprovalBroker>,
}

impl SdkRunner {
    pub fn new(client: Arc<dyn LlmClient>, store: SharedStore, bus: Arc<EventBus>) -> Self {
        Self {
            client,
            store,
            bus,
            registry: SessionRegistry::new(),
            approvals: Arc::new(ApprovalBroker::new()),
        }
    }

    /// The registry handle for `abort_session`
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// The approval broker for `resolve_approval`
    pub fn approvals(&self) -> Arc<ApprovalBroker> {
        self.approvals.clone()
    }

    /// Cancel a session's stream or pending retry sleep
    pub fn abort_session(&self, session_key: &str) -> bool {
        self.registry.abort(session_key)
    }

    /// Run one session to completion with retries and cancellation.
    ///
    /// On any terminal exit the session's registry entry is removed and
    /// dangling approval requests are denied with "Session ended".
    pub async fn run(&self, params: SessionParams) -> Result<SessionResult, LlmError> {
        let session_key = params.session_key();
        info!(task_id = params.task_id, stage = %params.stage, %session_key, "SdkRunner::run: starting");
        let token = self.registry.register(&session_key);

        let result = self.run_with_retries(&params, &session_key, &token).await;

        self.registry.remove(&session_key);
        self.approvals.end_session(&session_key);
        result
    }

    async fn run_with_retries(
        &self,
        params: &SessionParams,
        session_key: &str,
        token: &CancelToken,
    ) -> Result<SessionResult, LlmError> {
        let mut attempt = 0;
        loop {
            match self.attempt_stream(params, session_key, token).await {
                Ok(result) => return Ok(result),
                Err(LlmError::Aborted) => return Err(LlmError::Aborted),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = retry_delay(&e, attempt);
                    warn!(
                        task_id = params.task_id,
                        attempt,
                        ?delay,
                        error = %e,
                        "transient LLM failure, retrying"
                    );
                    if !abortable_sleep(delay, token).await {
                        return Err(LlmError::Aborted);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_stream(
        &self,
        params: &SessionParams,
        session_key: &str,
        token: &CancelToken,
    ) -> Result<SessionResult, LlmError> {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(256);

        let gate: Arc<dyn ToolGate> = Arc::new(SessionGate {
            task_id: params.task_id,
            session_key: session_key.to_string(),
            auto_mode: params.auto_mode,
            working_dir: params.working_dir.clone(),
            bus: self.bus.clone(),
            approvals: self.approvals.clone(),
        });

        let request = SessionRequest {
            system_prompt: params.system_prompt.clone(),
            prompt: params.prompt.clone(),
            model: params.model.clone(),
            max_turns: params.max_turns,
            working_dir: params.working_dir.clone(),
            resume_session_id: params.resume_session_id.clone(),
        };

        let client = self.client.clone();
        let stream_task = tokio::spawn(async move { client.stream(request, chunk_tx, gate).await });

        let mut output = String::new();
        let mut context_tokens: i64 = 0;
        let mut context_max: i64 = 0;
        let mut todos = TodoBuffer::new();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    stream_task.abort();
                    debug!(task_id = params.task_id, "attempt_stream: aborted mid-stream");
                    return Err(LlmError::Aborted);
                }
                chunk = chunk_rx.recv() => match chunk {
                    Some(chunk) => {
                        self.handle_chunk(params, chunk, &mut output, &mut context_tokens, &mut context_max, &mut todos)
                            .await;
                    }
                    None => break,
                }
            }
        }

        let response = match stream_task.await {
            Ok(result) => result?,
            Err(e) => return Err(LlmError::InvalidResponse(format!("stream task failed: {e}"))),
        };

        // Trailing todo flush
        self.flush_todos(params, &mut todos, true).await;

        // The final result payload wins over accumulated text
        let final_output = match &response.result {
            Some(result) => result.clone(),
            None if output.is_empty() => response.output.clone(),
            None => output,
        };

        self.extract_tool_calls(&final_output).await;

        // Persist session bookkeeping on the task
        let mut patch = TaskPatch::default();
        patch.active_session_id = Some(response.session_id.clone());
        if context_tokens > 0 {
            patch.context_tokens = Some(Some(context_tokens));
            patch.context_max = Some(Some(context_max));
        }
        if let Err(e) = self.store.lock().await.update_task(params.task_id, &patch) {
            warn!(task_id = params.task_id, error = %e, "failed to persist session bookkeeping");
        }

        Ok(SessionResult {
            output: final_output,
            cost: response.cost,
            turns: response.turns,
            session_id: response.session_id,
            context_tokens,
            context_max,
            usage: response.usage,
        })
    }

    async fn handle_chunk(
        &self,
        params: &SessionParams,
        chunk: StreamChunk,
        output: &mut String,
        context_tokens: &mut i64,
        context_max: &mut i64,
        todos: &mut TodoBuffer,
    ) {
        match chunk {
            StreamChunk::Text(text) => {
                output.push_str(&text);
                self.emit_stream(params, StreamType::Text, text);
            }
            StreamChunk::Thinking(text) => {
                self.emit_stream(params, StreamType::Thinking, text);
            }
            StreamChunk::ToolUse { name, input, .. } => {
                if ORCHESTRATION_TOOLS.contains(&name.as_str()) {
                    todos.apply(&name, &input);
                    self.flush_todos(params, todos, false).await;
                }
                self.emit_stream(params, StreamType::ToolUse, name);
            }
            StreamChunk::Usage {
                input_tokens,
                cache_read_tokens,
                context_max: max,
            } => {
                *context_tokens = (input_tokens + cache_read_tokens) as i64;
                *context_max = max as i64;
                self.emit_stream(
                    params,
                    StreamType::Context,
                    format!("__context:{context_tokens}:{context_max}"),
                );
                self.bus.emit(PipelineEvent::ContextUpdate {
                    task_id: params.task_id,
                    context_tokens: *context_tokens,
                    context_max: *context_max,
                });
            }
        }
    }

    fn emit_stream(&self, params: &SessionParams, stream_type: StreamType, content: impl Into<String>) {
        self.bus.emit(PipelineEvent::Stream {
            task_id: params.task_id,
            agent: params.agent.clone(),
            stream_type,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    async fn flush_todos(&self, params: &SessionParams, todos: &mut TodoBuffer, force: bool) {
        if !todos.should_flush(force) {
            return;
        }
        let items = todos.flush();
        let mut patch = TaskPatch::default();
        patch.todos = Some(items.clone());
        if let Err(e) = self.store.lock().await.update_task(params.task_id, &patch) {
            warn!(task_id = params.task_id, error = %e, "failed to persist todos");
            return;
        }
        self.bus.emit(PipelineEvent::TodosUpdated {
            task_id: params.task_id,
            stage: params.stage.clone(),
            todos: items,
        });
    }

    /// Scan the final output for XML-wrapped tool calls. Malformed JSON in
    /// a block is logged and skipped; it never aborts the run.
    async fn extract_tool_calls(&self, output: &str) {
        let re = Regex::new(r#"(?s)<tool_call name="([^"]+)">(.*?)</tool_call>"#).expect("static regex");
        for caps in re.captures_iter(output) {
            let name = &caps[1];
            let payload = caps[2].trim();
            let parsed: serde_json::Value = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!(tool = %name, error = %e, "malformed tool_call payload, skipping");
                    continue;
                }
            };
            match name {
                "save_knowledge" => self.save_knowledge(&parsed).await,
                other => debug!(tool = %other, "ignoring unknown tool_call"),
            }
        }
    }

    async fn save_knowledge(&self, payload: &serde_json::Value) {
        let Some(key) = payload["key"].as_str().filter(|k| !k.is_empty()) else {
            warn!("save_knowledge without a key, skipping");
            return;
        };
        let category = payload["category"]
            .as_str()
            .and_then(KnowledgeCategory::parse)
            .unwrap_or(KnowledgeCategory::LessonLearned);
        let tags = payload["tags"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let new = NewKnowledge {
            key: key.to_string(),
            summary: payload["summary"].as_str().unwrap_or_default().to_string(),
            content: payload["content"].as_str().unwrap_or_default().to_string(),
            category,
            tags,
            source: KnowledgeSource::Pipeline,
            source_id: None,
            status: KnowledgeStatus::Candidate,
        };
        // Dedup is the store's (key, status) upsert
        if let Err(e) = self.store.lock().await.create_or_update_knowledge(new) {
            warn!(%key, error = %e, "failed to save candidate knowledge");
        } else {
            info!(%key, "saved candidate knowledge");
        }
    }
}

/// Buffered todo state, debounced before persistence
struct TodoBuffer {
    items: Vec<TodoItem>,
    dirty: bool,
    last_flush: Instant,
}

impl TodoBuffer {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            dirty: false,
            // Backdated so the first write flushes immediately
            last_flush: Instant::now().checked_sub(TODO_DEBOUNCE).unwrap_or_else(Instant::now),
        }
    }

    fn apply(&mut self, tool: &str, input: &serde_json::Value) {
        match tool {
            "TodoWrite" => {
                if let Some(todos) = input["todos"].as_array() {
                    self.items = todos
                        .iter()
                        .filter_map(|t| serde_json::from_value::<TodoItem>(t.clone()).ok())
                        .collect();
                    self.dirty = true;
                }
            }
            "TaskCreate" => {
                if let Some(content) = text_field(input, &["subject", "content"]) {
                    self.items.push(TodoItem {
                        content,
                        status: TodoStatus::Pending,
                    });
                    self.dirty = true;
                }
            }
            "TaskUpdate" => {
                let Some(content) = text_field(input, &["subject", "content"]) else {
                    return;
                };
                let status = match input["status"].as_str() {
                    Some("completed") => TodoStatus::Completed,
                    Some("in_progress") => TodoStatus::InProgress,
                    _ => TodoStatus::Pending,
                };
                if let Some(item) = self.items.iter_mut().find(|i| i.content == content) {
                    item.status = status;
                    self.dirty = true;
                }
            }
            _ => {}
        }
    }

    fn should_flush(&self, force: bool) -> bool {
        self.dirty && (force || self.last_flush.elapsed() >= TODO_DEBOUNCE)
    }

    fn flush(&mut self) -> Vec<TodoItem> {
        self.dirty = false;
        self.last_flush = Instant::now();
        self.items.clone()
    }
}

fn text_field(input: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| input[k].as_str())
        .map(|s| s.to_string())
}

/// Per-session permission broker
struct SessionGate {
    task_id: i64,
    session_key: String,
    auto_mode: bool,
    working_dir: PathBuf,
    bus: Arc<EventBus>,
    approvals: Arc<ApprovalBroker>,
}

#[async_trait]
impl ToolGate for SessionGate {
    async fn decide(&self, tool_use_id: &str, tool_name: &str, input: &serde_json::Value) -> PermissionDecision {
        if READ_ONLY_TOOLS.contains(&tool_name) {
            return PermissionDecision::Allow;
        }
        if ORCHESTRATION_TOOLS.contains(&tool_name) {
            return PermissionDecision::Allow;
        }
        if matches!(tool_name, "Write" | "Edit") {
            if let Some(file_path) = input["file_path"].as_str() {
                if path_within(&self.working_dir, file_path) {
                    // Agents routinely write into directories that don't
                    // exist yet
                    let resolved = resolve_in(&self.working_dir, file_path);
                    if let Some(parent) = resolved.parent() {
                        let _ = tokio::fs::create_dir_all(parent).await;
                    }
                    return PermissionDecision::Allow;
                }
            }
        }
        if tool_name == "Bash" {
            if let Some(command) = input["command"].as_str() {
                if command.starts_with("mkdir ") {
                    return PermissionDecision::Allow;
                }
            }
        }
        if self.auto_mode {
            return PermissionDecision::Allow;
        }

        // Human gate: suspend until the renderer resolves
        let request_id = Uuid::now_v7().to_string();
        let rx = self.approvals.register(&self.session_key, &request_id);
        self.bus.emit(PipelineEvent::ApprovalRequest {
            request_id: request_id.clone(),
            task_id: self.task_id,
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input: input.clone(),
        });
        debug!(task_id = self.task_id, %request_id, tool = %tool_name, "awaiting approval");

        match rx.await {
            Ok(response) if response.approved => PermissionDecision::Allow,
            Ok(response) => PermissionDecision::Deny {
                message: response.message.unwrap_or_else(|| "Denied".to_string()),
            },
            Err(_) => PermissionDecision::Deny {
                message: "Session ended".to_string(),
            },
        }
    }
}

fn resolve_in(base: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Lexical containment check: does `raw` resolve inside `base`?
fn path_within(base: &Path, raw: &str) -> bool {
    let joined = resolve_in(base, raw);
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized.starts_with(base)
}
