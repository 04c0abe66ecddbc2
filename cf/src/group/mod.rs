//! Group orchestrator: launches and coordinates the tasks of one feature
//!
//! Members start in dependency order, each owning an independent SDK
//! session. The orchestrator listens to engine events: member stage
//! completions surface as group events, a member error or pause propagates
//! a pause to every active member, and the group completes when every
//! member is done.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use clawstore::{GroupStatus, PauseReason, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::events::{EventBus, PipelineEvent};
use crate::pipeline::{PipelineEngine, PipelineError};
use crate::SharedStore;

/// Statuses that count as actively running in the pipeline
fn is_active(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Brainstorming
            | TaskStatus::DesignReview
            | TaskStatus::Planning
            | TaskStatus::Implementing
            | TaskStatus::CodeReview
            | TaskStatus::Verifying
    )
}

/// Snapshot returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub group: clawstore::TaskGroup,
    pub tasks: Vec<MemberReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberReport {
    pub task_id: i64,
    pub title: String,
    pub status: TaskStatus,
    pub current_agent: Option<String>,
    pub dependencies_met: bool,
}

/// The group orchestrator
pub struct GroupOrchestrator {
    store: SharedStore,
    engine: Arc<PipelineEngine>,
    bus: Arc<EventBus>,
}

impl GroupOrchestrator {
    pub fn new(store: SharedStore, engine: Arc<PipelineEngine>, bus: Arc<EventBus>) -> Self {
        Self { store, engine, bus }
    }

    /// Subscribe to engine events and propagate them at the group level.
    /// Call once at startup; the task runs until the bus closes.
    pub fn start_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.clone();
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "group listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Err(e) = orchestrator.handle_event(&event).await {
                    warn!(error = %e, "group listener failed to handle event");
                }
            }
        })
    }

    async fn handle_event(&self, event: &PipelineEvent) -> Result<(), PipelineError> {
        match event {
            PipelineEvent::StageComplete { task_id, stage, summary } => {
                if let Some(group_id) = self.group_of(*task_id).await? {
                    self.bus.emit(PipelineEvent::GroupTaskStageComplete {
                        group_id,
                        task_id: *task_id,
                        stage: stage.clone(),
                        summary: summary.clone(),
                    });
                }
            }
            PipelineEvent::StageError { task_id, stage, .. } | PipelineEvent::StagePause { task_id, stage, .. } => {
                if let Some(group_id) = self.group_of(*task_id).await? {
                    let reason = format!("task {task_id} {} at {stage}", kind_word(event));
                    self.pause_group(group_id, &reason).await?;
                }
            }
            PipelineEvent::StageChange { task_id, status, .. } if status == "done" => {
                if let Some(group_id) = self.group_of(*task_id).await? {
                    self.on_member_done(group_id).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn group_of(&self, task_id: i64) -> Result<Option<i64>, PipelineError> {
        let store = self.store.lock().await;
        match store.get_task(task_id) {
            Ok(task) => Ok(task.group_id),
            Err(clawstore::StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the group running and start every member whose dependencies
    /// are already met, in topological order. Remaining members start as
    /// their dependencies complete.
    pub async fn launch_group(&self, group_id: i64) -> Result<(), PipelineError> {
        let (tasks, deps) = {
            let mut store = self.store.lock().await;
            store.get_group(group_id)?;
            let tasks = store.tasks_by_group(group_id)?;
            if tasks.is_empty() {
                return Err(PipelineError::Precondition(format!("Group {group_id} has no tasks")));
            }
            let deps = dependency_map(&store, &tasks)?;
            store.update_group_status(group_id, GroupStatus::Queued)?;
            store.update_group_status(group_id, GroupStatus::Running)?;
            (tasks, deps)
        };
        info!(group_id, members = tasks.len(), "launch_group");

        let order = execution_order(&tasks, &deps);
        for task_id in order {
            self.maybe_start_member(task_id).await?;
        }
        Ok(())
    }

    /// Start a member if it is in backlog with all dependencies done
    async fn maybe_start_member(&self, task_id: i64) -> Result<(), PipelineError> {
        let ready = {
            let store = self.store.lock().await;
            let task = store.get_task(task_id)?;
            task.status == TaskStatus::Backlog && store.are_dependencies_met(task_id)?
        };
        if !ready {
            debug!(task_id, "member not ready to start");
            return Ok(());
        }

        info!(task_id, "starting group member");
        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_full_pipeline(task_id).await {
                warn!(task_id, error = %e, "group member pipeline failed");
            }
        });
        Ok(())
    }

    /// A member reached done: start newly unblocked members, or complete
    /// the group when every member is done.
    async fn on_member_done(&self, group_id: i64) -> Result<(), PipelineError> {
        let members = {
            let store = self.store.lock().await;
            store.tasks_by_group(group_id)?
        };
        if members.iter().all(|t| t.status == TaskStatus::Done) {
            info!(group_id, "group completed");
            self.store
                .lock()
                .await
                .update_group_status(group_id, GroupStatus::Completed)?;
            self.bus.emit(PipelineEvent::GroupCompleted { group_id });
            return Ok(());
        }
        for member in members {
            self.maybe_start_member(member.id).await?;
        }
        Ok(())
    }

    /// Pause every active member and mark the group paused. Requests the
    /// pauses and returns without waiting for the sessions to unwind.
    pub async fn pause_group(&self, group_id: i64, reason: &str) -> Result<(), PipelineError> {
        let members = {
            let mut store = self.store.lock().await;
            let group = store.get_group(group_id)?;
            if group.status == GroupStatus::Paused {
                return Ok(());
            }
            store.update_group_status(group_id, GroupStatus::Paused)?;
            store.tasks_by_group(group_id)?
        };
        info!(group_id, %reason, "pause_group");

        let mut paused_count = 0;
        for member in &members {
            if is_active(member.status) {
                match self.engine.pause_task(member.id, PauseReason::Manual).await {
                    Ok(()) => paused_count += 1,
                    Err(e) => warn!(task_id = member.id, error = %e, "failed to pause member"),
                }
            }
        }

        self.bus.emit(PipelineEvent::GroupPaused {
            group_id,
            reason: reason.to_string(),
            paused_count,
        });
        Ok(())
    }

    /// Resume every paused member whose dependencies are met. Idempotent.
    pub async fn resume_group(&self, group_id: i64) -> Result<(), PipelineError> {
        let members = {
            let mut store = self.store.lock().await;
            let group = store.get_group(group_id)?;
            if group.status != GroupStatus::Paused {
                return Ok(());
            }
            store.update_group_status(group_id, GroupStatus::Running)?;
            store.tasks_by_group(group_id)?
        };
        info!(group_id, "resume_group");

        for member in &members {
            if member.status != TaskStatus::Paused {
                continue;
            }
            let deps_met = self.store.lock().await.are_dependencies_met(member.id)?;
            if !deps_met {
                debug!(task_id = member.id, "member stays paused, dependencies unmet");
                continue;
            }
            let engine = self.engine.clone();
            let task_id = member.id;
            tokio::spawn(async move {
                if let Err(e) = engine.resume_task(task_id).await {
                    warn!(task_id, error = %e, "failed to resume member");
                }
            });
        }
        Ok(())
    }

    /// Delete a group: pause running members, unlink tasks, remove the row
    pub async fn delete_group(&self, group_id: i64) -> Result<(), PipelineError> {
        self.pause_group(group_id, "group deleted").await?;
        self.store.lock().await.delete_group(group_id)?;
        self.bus.emit(PipelineEvent::GroupDeleted { group_id });
        Ok(())
    }

    /// Queue a message into a member's next agent turn
    pub async fn message_agent(&self, task_id: i64, content: &str) -> Result<(), PipelineError> {
        self.engine.message_agent(task_id, content).await
    }

    /// Snapshot of a member's recent output
    pub async fn peek_agent(&self, task_id: i64) -> Result<String, PipelineError> {
        self.engine.peek_agent(task_id).await
    }

    /// Current member statuses for the renderer
    pub async fn get_status(&self, group_id: i64) -> Result<GroupReport, PipelineError> {
        let store = self.store.lock().await;
        let group = store.get_group(group_id)?;
        let tasks = store.tasks_by_group(group_id)?;
        let mut members = Vec::with_capacity(tasks.len());
        for task in tasks {
            let dependencies_met = store.are_dependencies_met(task.id)?;
            members.push(MemberReport {
                task_id: task.id,
                title: task.title,
                status: task.status,
                current_agent: task.current_agent,
                dependencies_met,
            });
        }
        Ok(GroupReport { group, tasks: members })
    }
}

fn kind_word(event: &PipelineEvent) -> &'static str {
    match event {
        PipelineEvent::StageError { .. } => "errored",
        PipelineEvent::StagePause { .. } => "paused",
        _ => "changed",
    }
}

/// In-group dependency edges for the members
fn dependency_map(store: &clawstore::Store, tasks: &[Task]) -> Result<HashMap<i64, Vec<i64>>, PipelineError> {
    let member_ids: HashSet<i64> = tasks.iter().map(|t| t.id).collect();
    let mut map = HashMap::new();
    for task in tasks {
        let deps: Vec<i64> = store
            .get_dependencies(task.id)?
            .into_iter()
            .filter(|d| member_ids.contains(d))
            .collect();
        map.insert(task.id, deps);
    }
    Ok(map)
}

/// Topological order over the group's dependency subgraph. Ready tasks are
/// taken highest priority first, then oldest first. The store guarantees
/// acyclicity; any residue from concurrent edits is appended at the end.
fn execution_order(tasks: &[Task], deps: &HashMap<i64, Vec<i64>>) -> Vec<i64> {
    let mut remaining: Vec<&Task> = tasks.iter().collect();
    let mut placed: HashSet<i64> = HashSet::new();
    let mut order = Vec::with_capacity(tasks.len());

    while !remaining.is_empty() {
        let mut ready: Vec<&Task> = remaining
            .iter()
            .copied()
            .filter(|t| {
                deps.get(&t.id)
                    .map(|d| d.iter().all(|dep| placed.contains(dep)))
                    .unwrap_or(true)
            })
            .collect();
        if ready.is_empty() {
            // Defensive: should not happen with an acyclic store
            warn!("execution_order: residual cycle, appending remaining tasks");
            order.extend(remaining.iter().map(|t| t.id));
            break;
        }
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)).then(a.id.cmp(&b.id)));
        let chosen = ready[0].id;
        placed.insert(chosen);
        order.push(chosen);
        remaining.retain(|t| t.id != chosen);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use clawstore::{TaskPriority, TaskTier};

    fn task(id: i64, priority: TaskPriority, age_secs: i64) -> Task {
        Task {
            id,
            title: format!("task {id}"),
            description: String::new(),
            tier: TaskTier::L1,
            priority,
            status: TaskStatus::Backlog,
            current_agent: None,
            auto_mode: false,
            auto_merge: false,
            created_at: Utc::now() - Duration::seconds(age_secs),
            started_at: None,
            completed_at: None,
            archived_at: None,
            brainstorm_output: None,
            design_review: None,
            plan: None,
            implementation_notes: None,
            review_comments: None,
            review_score: None,
            test_results: None,
            verify_result: None,
            commit_hash: None,
            plan_review_count: 0,
            impl_review_count: 0,
            paused_from_status: None,
            pause_reason: None,
            branch_name: None,
            worktree_path: None,
            group_id: Some(1),
            work_order: None,
            assigned_skill: None,
            active_session_id: None,
            context_tokens: None,
            context_max: None,
            rich_handoff: None,
            todos: Vec::new(),
            handoffs: Vec::new(),
        }
    }

    #[test]
    fn test_order_respects_dependencies() {
        let tasks = vec![
            task(1, TaskPriority::Low, 30),
            task(2, TaskPriority::Critical, 20),
            task(3, TaskPriority::Medium, 10),
        ];
        // 2 depends on 3; 3 depends on 1
        let deps = HashMap::from([(2, vec![3]), (3, vec![1]), (1, vec![])]);
        assert_eq!(execution_order(&tasks, &deps), vec![1, 3, 2]);
    }

    #[test]
    fn test_order_ties_break_by_priority_then_age() {
        let tasks = vec![
            task(1, TaskPriority::Medium, 30),
            task(2, TaskPriority::Critical, 10),
            task(3, TaskPriority::Medium, 40),
        ];
        let deps = HashMap::new();
        // Critical first, then the older of the two mediums
        assert_eq!(execution_order(&tasks, &deps), vec![2, 3, 1]);
    }

    #[test]
    fn test_order_ignores_out_of_group_deps() {
        let tasks = vec![task(5, TaskPriority::Medium, 0)];
        // Dependency on a task outside the group was filtered out upstream
        let deps = HashMap::from([(5, vec![])]);
        assert_eq!(execution_order(&tasks, &deps), vec![5]);
    }

    #[test]
    fn test_is_active_classification() {
        assert!(is_active(TaskStatus::Implementing));
        assert!(!is_active(TaskStatus::Backlog));
        assert!(!is_active(TaskStatus::Paused));
        assert!(!is_active(TaskStatus::Blocked));
        assert!(!is_active(TaskStatus::Done));
    }
}
