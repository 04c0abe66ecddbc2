//! Command-line interface: headless access to the command surface

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::mpsc;

use clawstore::{NewKnowledge, NewTask, Store, TaskPatch, TaskPriority, TaskTier};

use crate::commands::{Command, CommandHandler, CommandResponse};
use crate::config::Config;
use crate::events::EventBus;
use crate::group::GroupOrchestrator;
use crate::llm::{
    AnthropicClient, CompletionResponse, LlmClient, LlmError, SessionRequest, StreamChunk, ToolGate,
};
use crate::pipeline::{PipelineEngine, Stage};
use crate::runner::SdkRunner;
use crate::vcs::GitAdapter;
use crate::SharedStore;

/// ClawFlow - staged pipeline orchestrator for LLM coding agents
#[derive(Debug, Parser)]
#[command(name = "cf", version, about)]
pub struct Cli {
    /// Path to a config file (default: .clawflow.yml, then
    /// ~/.config/clawflow/clawflow.yml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Project directory (default: current directory)
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Project registry operations
    #[command(subcommand)]
    Project(ProjectCmd),

    /// Task CRUD and stats
    #[command(subcommand)]
    Task(TaskCmd),

    /// Drive the pipeline
    #[command(subcommand)]
    Pipeline(PipelineCmd),

    /// Group orchestration
    #[command(subcommand)]
    Group(GroupCmd),

    /// Branches and worktrees
    #[command(subcommand)]
    Vcs(VcsCmd),

    /// Knowledge store
    #[command(subcommand)]
    Knowledge(KnowledgeCmd),
}

#[derive(Debug, Subcommand)]
pub enum ProjectCmd {
    List,
    Register { name: String, path: String },
    Open { name: String },
    Delete { name: String },
}

#[derive(Debug, Subcommand)]
pub enum TaskCmd {
    List {
        #[arg(long)]
        archived: bool,
    },
    Create {
        title: String,
        #[arg(long, default_value = "L2")]
        tier: String,
        #[arg(long, default_value = "medium")]
        priority: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        auto: bool,
    },
    Get { task_id: i64 },
    Update { task_id: i64, patch_json: String },
    Delete { task_id: i64 },
    Stats,
    Archive { task_id: i64 },
    Unarchive { task_id: i64 },
    ArchiveAllDone,
    Depend { task_id: i64, on: Vec<i64> },
}

#[derive(Debug, Subcommand)]
pub enum PipelineCmd {
    Start { task_id: i64 },
    Step { task_id: i64 },
    Run { task_id: i64 },
    Approve { task_id: i64 },
    Reject { task_id: i64, feedback: String },
    Pause { task_id: i64 },
    Resume { task_id: i64 },
    Restart { task_id: i64, stage: String },
}

#[derive(Debug, Subcommand)]
pub enum GroupCmd {
    Create {
        title: String,
        #[arg(long)]
        tasks: Vec<i64>,
    },
    Launch { group_id: i64 },
    Pause { group_id: i64 },
    Resume { group_id: i64 },
    Delete { group_id: i64 },
    Status { group_id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum VcsCmd {
    Branches,
    Detail { task_id: i64 },
    Push { task_id: i64 },
    Merge {
        task_id: i64,
        #[arg(long)]
        target: Option<String>,
    },
    DeleteBranch { task_id: i64 },
    Commit { task_id: i64, message: String },
    LocalBranches,
    SetBase { branch: String },
    Status { task_id: i64 },
    StageAll { task_id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum KnowledgeCmd {
    List {
        #[arg(long)]
        global: bool,
    },
    Candidates,
    Create {
        key: String,
        summary: String,
        #[arg(long, default_value = "")]
        content: String,
        #[arg(long, default_value = "convention")]
        category: String,
    },
    Promote {
        id: String,
        #[arg(long)]
        global: bool,
    },
    Discard { id: String },
    Delete {
        id: String,
        #[arg(long)]
        global: bool,
    },
}

/// Placeholder client used when no API key is configured; store and VCS
/// commands still work, pipeline runs fail with a clear message.
struct UnconfiguredClient(String);

#[async_trait]
impl LlmClient for UnconfiguredClient {
    async fn stream(
        &self,
        _request: SessionRequest,
        _chunk_tx: mpsc::Sender<StreamChunk>,
        _gate: Arc<dyn ToolGate>,
    ) -> Result<CompletionResponse, LlmError> {
        Err(LlmError::InvalidResponse(self.0.clone()))
    }
}

/// Everything a CLI invocation needs
pub struct Runtime {
    pub handler: CommandHandler,
    pub bus: Arc<EventBus>,
}

/// Build stores, adapter, runner, engine, and orchestrator for a project
pub async fn build_runtime(config: &Config, project_path: &Path) -> Result<Runtime> {
    let project_name = project_name_for(project_path);
    let global_store: SharedStore = Arc::new(tokio::sync::Mutex::new(Store::open_global(
        clawstore::paths::global_db_path(),
    )?));
    let store: SharedStore = Arc::new(tokio::sync::Mutex::new(Store::open_project(
        clawstore::paths::project_db_path(&project_name),
    )?));

    let bus = Arc::new(EventBus::with_default_capacity());
    let vcs = Arc::new(
        GitAdapter::open(project_path, bus.clone())
            .await
            .context("Failed to open the project repository")?,
    );

    let client: Arc<dyn LlmClient> = match AnthropicClient::from_config(&config.llm) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::warn!(error = %e, "LLM client unavailable; pipeline runs will fail");
            Arc::new(UnconfiguredClient(e.to_string()))
        }
    };
    let runner = Arc::new(SdkRunner::new(client, store.clone(), bus.clone()));

    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        vcs.clone(),
        runner.clone(),
        bus.clone(),
        project_path,
        config.pipeline.clone(),
        config.llm.model.clone(),
    )?);

    let orchestrator = Arc::new(GroupOrchestrator::new(store.clone(), engine.clone(), bus.clone()));
    let _listener = orchestrator.start_listener();

    let handler = CommandHandler::new(global_store, store, engine, orchestrator, vcs, runner, bus.clone());
    Ok(Runtime { handler, bus })
}

/// Project name: the marker file's name if registered, else the directory
/// name.
fn project_name_for(project_path: &Path) -> String {
    let marker = clawstore::paths::project_marker_path(project_path);
    if let Ok(content) = std::fs::read_to_string(&marker) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) {
            if let Some(name) = value["name"].as_str() {
                return name.to_string();
            }
        }
    }
    project_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("default")
        .to_string()
}

/// Translate a CLI invocation into a protocol command
pub fn to_command(cli_command: CliCommand) -> Result<Command> {
    let command = match cli_command {
        CliCommand::Project(cmd) => match cmd {
            ProjectCmd::List => Command::ProjectList,
            ProjectCmd::Register { name, path } => Command::ProjectRegister { name, path },
            ProjectCmd::Open { name } => Command::ProjectOpen { name },
            ProjectCmd::Delete { name } => Command::ProjectDelete { name },
        },
        CliCommand::Task(cmd) => match cmd {
            TaskCmd::List { archived } => Command::TaskList {
                include_archived: archived,
            },
            TaskCmd::Create {
                title,
                tier,
                priority,
                description,
                auto,
            } => {
                let tier = TaskTier::parse(&tier).ok_or_else(|| eyre::eyre!("invalid tier: {tier}"))?;
                let priority =
                    TaskPriority::parse(&priority).ok_or_else(|| eyre::eyre!("invalid priority: {priority}"))?;
                let mut task = NewTask::new(title, tier);
                task.priority = priority;
                task.description = description;
                task.auto_mode = auto;
                Command::TaskCreate { task }
            }
            TaskCmd::Get { task_id } => Command::TaskGet { task_id },
            TaskCmd::Update { task_id, patch_json } => {
                let patch: TaskPatch = serde_json::from_str(&patch_json).context("invalid patch JSON")?;
                Command::TaskUpdate { task_id, patch }
            }
            TaskCmd::Delete { task_id } => Command::TaskDelete { task_id },
            TaskCmd::Stats => Command::TaskStats,
            TaskCmd::Archive { task_id } => Command::TaskArchive { task_id },
            TaskCmd::Unarchive { task_id } => Command::TaskUnarchive { task_id },
            TaskCmd::ArchiveAllDone => Command::TaskArchiveAllDone,
            TaskCmd::Depend { task_id, on } => Command::DependenciesAdd {
                task_id,
                depends_on: on,
            },
        },
        CliCommand::Pipeline(cmd) => match cmd {
            PipelineCmd::Start { task_id } => Command::PipelineStart { task_id },
            PipelineCmd::Step { task_id } => Command::PipelineStep { task_id },
            PipelineCmd::Run { task_id } => Command::PipelineRunFull { task_id },
            PipelineCmd::Approve { task_id } => Command::PipelineApprove { task_id },
            PipelineCmd::Reject { task_id, feedback } => Command::PipelineReject { task_id, feedback },
            PipelineCmd::Pause { task_id } => Command::PipelinePause { task_id, reason: None },
            PipelineCmd::Resume { task_id } => Command::PipelineResume { task_id },
            PipelineCmd::Restart { task_id, stage } => {
                let stage = Stage::parse(&stage).ok_or_else(|| eyre::eyre!("invalid stage: {stage}"))?;
                Command::PipelineRestart { task_id, stage }
            }
        },
        CliCommand::Group(cmd) => match cmd {
            GroupCmd::Create { title, tasks } => Command::GroupCreate {
                title,
                task_ids: tasks,
                shared_context: None,
            },
            GroupCmd::Launch { group_id } => Command::GroupLaunch { group_id },
            GroupCmd::Pause { group_id } => Command::GroupPause { group_id },
            GroupCmd::Resume { group_id } => Command::GroupResume { group_id },
            GroupCmd::Delete { group_id } => Command::GroupDelete { group_id },
            GroupCmd::Status { group_id } => Command::GroupStatus { group_id },
        },
        CliCommand::Vcs(cmd) => match cmd {
            VcsCmd::Branches => Command::VcsBranches,
            VcsCmd::Detail { task_id } => Command::VcsBranchDetail { task_id },
            VcsCmd::Push { task_id } => Command::VcsPush { task_id },
            VcsCmd::Merge { task_id, target } => Command::VcsMerge { task_id, target },
            VcsCmd::DeleteBranch { task_id } => Command::VcsDeleteBranch { task_id },
            VcsCmd::Commit { task_id, message } => Command::VcsCommit { task_id, message },
            VcsCmd::LocalBranches => Command::VcsLocalBranches,
            VcsCmd::SetBase { branch } => Command::VcsSetBaseBranch { branch },
            VcsCmd::Status { task_id } => Command::VcsWorkingTreeStatus { task_id },
            VcsCmd::StageAll { task_id } => Command::VcsStageAll { task_id },
        },
        CliCommand::Knowledge(cmd) => match cmd {
            KnowledgeCmd::List { global } => Command::KnowledgeList {
                global,
                category: None,
                status: None,
            },
            KnowledgeCmd::Candidates => Command::KnowledgeListCandidates,
            KnowledgeCmd::Create {
                key,
                summary,
                content,
                category,
            } => {
                let category = clawstore::KnowledgeCategory::parse(&category)
                    .ok_or_else(|| eyre::eyre!("invalid category: {category}"))?;
                let mut entry = NewKnowledge::new(key, category);
                entry.summary = summary;
                entry.content = content;
                Command::KnowledgeCreate { global: false, entry }
            }
            KnowledgeCmd::Promote { id, global } => Command::KnowledgePromote { id, global },
            KnowledgeCmd::Discard { id } => Command::KnowledgeDiscard { id },
            KnowledgeCmd::Delete { id, global } => Command::KnowledgeDelete { global, id },
        },
    };
    Ok(command)
}

/// Print a response for human consumption
pub fn print_response(response: &CommandResponse) {
    match response {
        CommandResponse::Ok { data } => {
            println!("{}", "ok".green().bold());
            if let Some(data) = data {
                match serde_json::to_string_pretty(data) {
                    Ok(pretty) => println!("{pretty}"),
                    Err(_) => println!("{data}"),
                }
            }
        }
        CommandResponse::Error { message } => {
            eprintln!("{} {message}", "error:".red().bold());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_task_create() {
        let cli = Cli::parse_from(["cf", "task", "create", "Add login", "--tier", "L3", "--priority", "high"]);
        let command = to_command(cli.command).unwrap();
        match command {
            Command::TaskCreate { task } => {
                assert_eq!(task.title, "Add login");
                assert_eq!(task.tier, TaskTier::L3);
                assert_eq!(task.priority, TaskPriority::High);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_tier() {
        let cli = Cli::parse_from(["cf", "task", "create", "x", "--tier", "L9"]);
        assert!(to_command(cli.command).is_err());
    }

    #[test]
    fn test_cli_parses_restart_stage() {
        let cli = Cli::parse_from(["cf", "pipeline", "restart", "4", "plan"]);
        let command = to_command(cli.command).unwrap();
        assert!(matches!(
            command,
            Command::PipelineRestart {
                task_id: 4,
                stage: Stage::Plan
            }
        ));
    }

    #[test]
    fn test_project_name_prefers_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker_dir = dir.path().join(".clawflow");
        std::fs::create_dir_all(&marker_dir).unwrap();
        std::fs::write(
            marker_dir.join("project.json"),
            r#"{"name": "acme", "registeredAt": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(project_name_for(dir.path()), "acme");
    }

    #[test]
    fn test_project_name_falls_back_to_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let name = project_name_for(dir.path());
        assert!(!name.is_empty());
    }
}
