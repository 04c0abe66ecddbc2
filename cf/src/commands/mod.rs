//! Renderer-facing command surface
//!
//! A small, stable request/response protocol: the renderer (or the CLI)
//! sends a [`Command`], the handler answers with a [`CommandResponse`].
//! Long-running pipeline operations are spawned and acknowledged
//! immediately; their progress streams over the event bus.

use std::collections::HashMap;
use std::sync::Arc;

use clawstore::{KnowledgeCategory, KnowledgeStatus, NewKnowledge, NewTask, PauseReason, TaskPatch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::events::EventBus;
use crate::group::GroupOrchestrator;
use crate::pipeline::{PipelineEngine, Stage};
use crate::runner::SdkRunner;
use crate::vcs::GitAdapter;
use crate::SharedStore;

/// Every operation the renderer can invoke
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    // Projects (global store)
    ProjectList,
    ProjectRegister { name: String, path: String },
    ProjectOpen { name: String },
    ProjectDelete { name: String },

    // Tasks
    TaskList {
        #[serde(default)]
        include_archived: bool,
    },
    TaskCreate { task: NewTask },
    TaskGet { task_id: i64 },
    TaskUpdate { task_id: i64, patch: TaskPatch },
    TaskDelete { task_id: i64 },
    TaskStats,
    TaskArchive { task_id: i64 },
    TaskUnarchive { task_id: i64 },
    TaskArchiveAllDone,
    DependenciesGet { task_id: i64 },
    DependenciesAdd { task_id: i64, depends_on: Vec<i64> },

    // Pipeline
    PipelineStart { task_id: i64 },
    PipelineStep { task_id: i64 },
    PipelineRunFull { task_id: i64 },
    PipelineApprove { task_id: i64 },
    PipelineReject { task_id: i64, feedback: String },
    PipelinePause {
        task_id: i64,
        #[serde(default)]
        reason: Option<PauseReason>,
    },
    PipelineResume { task_id: i64 },
    PipelineRestart { task_id: i64, stage: Stage },
    ResolveApproval {
        request_id: String,
        approved: bool,
        #[serde(default)]
        message: Option<String>,
    },

    // Groups
    GroupCreate {
        title: String,
        #[serde(default)]
        task_ids: Vec<i64>,
        #[serde(default)]
        shared_context: Option<String>,
    },
    GroupLaunch { group_id: i64 },
    GroupPause { group_id: i64 },
    GroupResume { group_id: i64 },
    GroupDelete { group_id: i64 },
    GroupStatus { group_id: i64 },
    AgentMessage { task_id: i64, content: String },
    AgentPeek { task_id: i64 },

    // VCS
    VcsBranches,
    VcsBranchDetail { task_id: i64 },
    VcsPush { task_id: i64 },
    VcsMerge {
        task_id: i64,
        #[serde(default)]
        target: Option<String>,
    },
    VcsDeleteBranch { task_id: i64 },
    VcsCommit { task_id: i64, message: String },
    VcsLocalBranches,
    VcsSetBaseBranch { branch: String },
    VcsWorkingTreeStatus { task_id: i64 },
    VcsStageAll { task_id: i64 },

    // Knowledge (project scope by default; `global` flips the scope)
    KnowledgeCreate {
        #[serde(default)]
        global: bool,
        entry: NewKnowledge,
    },
    KnowledgeUpdate {
        #[serde(default)]
        global: bool,
        id: String,
        entry: NewKnowledge,
    },
    KnowledgeDelete {
        #[serde(default)]
        global: bool,
        id: String,
    },
    KnowledgeList {
        #[serde(default)]
        global: bool,
        #[serde(default)]
        category: Option<KnowledgeCategory>,
        #[serde(default)]
        status: Option<KnowledgeStatus>,
    },
    KnowledgeListCandidates,
    KnowledgePromote {
        id: String,
        #[serde(default)]
        global: bool,
    },
    KnowledgeDiscard { id: String },

    // Filesystem (renderer-owned; reserved here)
    PickDirectory,
}

/// Command outcome on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error { message: String },
}

impl CommandResponse {
    pub fn ok<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => CommandResponse::Ok { data: Some(value) },
            Err(e) => CommandResponse::Error {
                message: format!("failed to serialize response: {e}"),
            },
        }
    }

    pub fn ack() -> Self {
        CommandResponse::Ok { data: None }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        CommandResponse::Error {
            message: message.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CommandResponse::Ok { .. })
    }
}

/// Owns every subsystem the command surface touches
pub struct CommandHandler {
    global_store: SharedStore,
    store: SharedStore,
    engine: Arc<PipelineEngine>,
    orchestrator: Arc<GroupOrchestrator>,
    vcs: Arc<GitAdapter>,
    runner: Arc<SdkRunner>,
    bus: Arc<EventBus>,
}

impl CommandHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        global_store: SharedStore,
        store: SharedStore,
        engine: Arc<PipelineEngine>,
        orchestrator: Arc<GroupOrchestrator>,
        vcs: Arc<GitAdapter>,
        runner: Arc<SdkRunner>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            global_store,
            store,
            engine,
            orchestrator,
            vcs,
            runner,
            bus,
        }
    }

    /// Dispatch one command. Never panics; failures become `Error`
    /// responses.
    pub async fn handle(&self, command: Command) -> CommandResponse {
        debug!(?command, "CommandHandler::handle");
        match command {
            // === Projects ===
            Command::ProjectList => respond(self.global_store.lock().await.list_projects()),
            Command::ProjectRegister { name, path } => {
                respond(self.global_store.lock().await.register_project(&name, &path))
            }
            Command::ProjectOpen { name } => respond(self.global_store.lock().await.open_project_entry(&name)),
            Command::ProjectDelete { name } => respond(self.global_store.lock().await.delete_project(&name)),

            // === Tasks ===
            Command::TaskList { include_archived } => {
                respond(self.store.lock().await.list_tasks(include_archived))
            }
            Command::TaskCreate { task } => respond(self.store.lock().await.create_task(task)),
            Command::TaskGet { task_id } => respond(self.store.lock().await.get_task(task_id)),
            Command::TaskUpdate { task_id, patch } => {
                respond(self.store.lock().await.update_task(task_id, &patch))
            }
            Command::TaskDelete { task_id } => respond(self.store.lock().await.delete_task(task_id)),
            Command::TaskStats => respond(self.store.lock().await.task_stats()),
            Command::TaskArchive { task_id } => respond(self.store.lock().await.archive_task(task_id)),
            Command::TaskUnarchive { task_id } => respond(self.store.lock().await.unarchive_task(task_id)),
            Command::TaskArchiveAllDone => respond(self.store.lock().await.archive_all_done()),
            Command::DependenciesGet { task_id } => respond(self.store.lock().await.get_dependencies(task_id)),
            Command::DependenciesAdd { task_id, depends_on } => {
                respond(self.store.lock().await.add_task_dependencies(task_id, &depends_on))
            }

            // === Pipeline (long ops are spawned, progress goes to the bus) ===
            Command::PipelineStart { task_id } => self.spawn_pipeline_op(task_id, "start"),
            Command::PipelineStep { task_id } => self.spawn_pipeline_op(task_id, "step"),
            Command::PipelineRunFull { task_id } => self.spawn_pipeline_op(task_id, "run_full"),
            Command::PipelineApprove { task_id } => self.spawn_pipeline_op(task_id, "approve"),
            Command::PipelineReject { task_id, feedback } => {
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.reject_stage(task_id, &feedback).await {
                        warn!(task_id, error = %e, "reject failed");
                    }
                });
                CommandResponse::ack()
            }
            Command::PipelinePause { task_id, reason } => respond_unit(
                self.engine
                    .pause_task(task_id, reason.unwrap_or(PauseReason::Manual))
                    .await,
            ),
            Command::PipelineResume { task_id } => self.spawn_pipeline_op(task_id, "resume"),
            Command::PipelineRestart { task_id, stage } => {
                respond_unit(self.engine.restart_to_stage(task_id, stage).await)
            }
            Command::ResolveApproval {
                request_id,
                approved,
                message,
            } => {
                let resolved = self.runner.approvals().resolve(&request_id, approved, message);
                CommandResponse::ok(json!({ "resolved": resolved }))
            }

            // === Groups ===
            Command::GroupCreate {
                title,
                task_ids,
                shared_context,
            } => self.create_group(title, task_ids, shared_context).await,
            Command::GroupLaunch { group_id } => respond_unit(self.orchestrator.launch_group(group_id).await),
            Command::GroupPause { group_id } => {
                respond_unit(self.orchestrator.pause_group(group_id, "manual pause").await)
            }
            Command::GroupResume { group_id } => respond_unit(self.orchestrator.resume_group(group_id).await),
            Command::GroupDelete { group_id } => respond_unit(self.orchestrator.delete_group(group_id).await),
            Command::GroupStatus { group_id } => respond(self.orchestrator.get_status(group_id).await),
            Command::AgentMessage { task_id, content } => {
                respond_unit(self.orchestrator.message_agent(task_id, &content).await)
            }
            Command::AgentPeek { task_id } => respond(self.orchestrator.peek_agent(task_id).await),

            // === VCS ===
            Command::VcsBranches => {
                let statuses: HashMap<i64, clawstore::TaskStatus> = match self.store.lock().await.list_tasks(true)
                {
                    Ok(tasks) => tasks.into_iter().map(|t| (t.id, t.status)).collect(),
                    Err(e) => return CommandResponse::error(e),
                };
                respond(self.vcs.get_branches(&statuses).await)
            }
            Command::VcsBranchDetail { task_id } => {
                let status = self.store.lock().await.get_task(task_id).ok().map(|t| t.status);
                respond(self.vcs.get_branch_detail(task_id, status).await)
            }
            Command::VcsPush { task_id } => respond_unit(self.vcs.push(task_id).await),
            Command::VcsMerge { task_id, target } => {
                respond(self.vcs.merge(task_id, target.as_deref()).await)
            }
            Command::VcsDeleteBranch { task_id } => respond_unit(self.vcs.delete_branch(task_id).await),
            Command::VcsCommit { task_id, message } => respond(self.vcs.commit(task_id, &message).await),
            Command::VcsLocalBranches => respond(self.vcs.get_local_branches().await),
            Command::VcsSetBaseBranch { branch } => {
                if let Err(e) = self.vcs.set_base_branch(&branch).await {
                    return CommandResponse::error(e);
                }
                respond(self.store.lock().await.set_setting("base_branch", &branch))
            }
            Command::VcsWorkingTreeStatus { task_id } => {
                respond(self.vcs.get_working_tree_status(task_id).await)
            }
            Command::VcsStageAll { task_id } => respond(self.vcs.stage_all(task_id).await),

            // === Knowledge ===
            Command::KnowledgeCreate { global, entry } => {
                respond(self.knowledge_store(global).lock().await.create_or_update_knowledge(entry))
            }
            Command::KnowledgeUpdate { global, id, entry } => {
                respond(self.knowledge_store(global).lock().await.update_knowledge(&id, &entry))
            }
            Command::KnowledgeDelete { global, id } => {
                respond(self.knowledge_store(global).lock().await.delete_knowledge(&id))
            }
            Command::KnowledgeList {
                global,
                category,
                status,
            } => respond(self.knowledge_store(global).lock().await.list_knowledge(category, status)),
            Command::KnowledgeListCandidates => respond(self.store.lock().await.list_knowledge_candidates()),
            Command::KnowledgePromote { id, global } => {
                let mut store = self.store.lock().await;
                if global {
                    let mut global_store = self.global_store.lock().await;
                    respond(store.promote_candidate(&id, Some(&mut global_store)))
                } else {
                    respond(store.promote_candidate(&id, None))
                }
            }
            Command::KnowledgeDiscard { id } => respond(self.store.lock().await.discard_candidate(&id)),

            // === Filesystem ===
            Command::PickDirectory => {
                CommandResponse::error("pick_directory is handled by the renderer, not the core")
            }
        }
    }

    fn knowledge_store(&self, global: bool) -> &SharedStore {
        if global {
            &self.global_store
        } else {
            &self.store
        }
    }

    fn spawn_pipeline_op(&self, task_id: i64, op: &'static str) -> CommandResponse {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let result = match op {
                "start" => engine.start_task(task_id).await,
                "step" => engine.step_task(task_id).await,
                "run_full" => engine.run_full_pipeline(task_id).await,
                "approve" => engine.approve_stage(task_id).await,
                "resume" => engine.resume_task(task_id).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(task_id, op, error = %e, "pipeline operation failed");
            }
        });
        CommandResponse::ack()
    }

    async fn create_group(
        &self,
        title: String,
        task_ids: Vec<i64>,
        shared_context: Option<String>,
    ) -> CommandResponse {
        let group = {
            let mut store = self.store.lock().await;
            let group = match store.create_group(&title, None, shared_context) {
                Ok(group) => group,
                Err(e) => return CommandResponse::error(e),
            };
            for task_id in &task_ids {
                let mut patch = TaskPatch::default();
                patch.group_id = Some(Some(group.id));
                if let Err(e) = store.update_task(*task_id, &patch) {
                    return CommandResponse::error(e);
                }
            }
            group
        };
        self.bus.emit(crate::events::PipelineEvent::GroupCreated {
            group_id: group.id,
            title: group.title.clone(),
        });
        CommandResponse::ok(group)
    }
}

fn respond<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> CommandResponse {
    match result {
        Ok(value) => CommandResponse::ok(value),
        Err(e) => CommandResponse::error(e),
    }
}

fn respond_unit<E: std::fmt::Display>(result: Result<(), E>) -> CommandResponse {
    match result {
        Ok(()) => CommandResponse::ack(),
        Err(e) => CommandResponse::error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let json = r#"{"cmd": "pipeline_reject", "task_id": 3, "feedback": "be specific"}"#;
        let command: Command = serde_json::from_str(json).unwrap();
        match command {
            Command::PipelineReject { task_id, feedback } => {
                assert_eq!(task_id, 3);
                assert_eq!(feedback, "be specific");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_restart_command_parses_stage() {
        let json = r#"{"cmd": "pipeline_restart", "task_id": 1, "stage": "plan"}"#;
        let command: Command = serde_json::from_str(json).unwrap();
        assert!(matches!(
            command,
            Command::PipelineRestart {
                stage: Stage::Plan,
                ..
            }
        ));
    }

    #[test]
    fn test_task_create_defaults() {
        let json = r#"{"cmd": "task_create", "task": {"title": "minimal"}}"#;
        let command: Command = serde_json::from_str(json).unwrap();
        match command {
            Command::TaskCreate { task } => {
                assert_eq!(task.title, "minimal");
                assert_eq!(task.tier, clawstore::TaskTier::L2);
                assert!(!task.auto_mode);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let ok = CommandResponse::ok(json!({"id": 1}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"]["id"], 1);

        let err = CommandResponse::error("boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "boom");

        let ack = CommandResponse::ack();
        let json = serde_json::to_value(&ack).unwrap();
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_unknown_command_rejected() {
        let json = r#"{"cmd": "no_such_command"}"#;
        assert!(serde_json::from_str::<Command>(json).is_err());
    }
}
