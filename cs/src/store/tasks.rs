//! Task CRUD, archive, and stats

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::Row;
use tracing::{debug, info};

use crate::domain::{
    lenient_json, PauseReason, Task, TaskPatch, TaskPriority, TaskStats, TaskStatus, TaskTier, TestResults,
    WorkOrder,
};

use super::{opt_ts, parse_ts, Result, Store, StoreError};

/// Fields accepted when creating a task
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub tier: TaskTier,
    pub priority: TaskPriority,
    pub auto_mode: bool,
    pub auto_merge: bool,
    pub group_id: Option<i64>,
    pub work_order: Option<WorkOrder>,
    pub assigned_skill: Option<String>,
}

impl Default for NewTask {
    fn default() -> Self {
        Self::new("", TaskTier::L2)
    }
}

impl NewTask {
    pub fn new(title: impl Into<String>, tier: TaskTier) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            tier,
            priority: TaskPriority::Medium,
            auto_mode: false,
            auto_merge: false,
            group_id: None,
            work_order: None,
            assigned_skill: None,
        }
    }
}

const TASK_SELECT: &str = "SELECT * FROM tasks";

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let tier: String = row.get("tier")?;
    let priority: String = row.get("priority")?;
    let status: String = row.get("status")?;
    let paused_from: Option<String> = row.get("paused_from_status")?;
    let pause_reason: Option<String> = row.get("pause_reason")?;
    let created_at: String = row.get("created_at")?;
    let test_results: Option<String> = row.get("test_results")?;

    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        tier: TaskTier::parse(&tier).unwrap_or(TaskTier::L2),
        priority: TaskPriority::parse(&priority).unwrap_or(TaskPriority::Medium),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Backlog),
        current_agent: row.get("current_agent")?,
        auto_mode: row.get::<_, i64>("auto_mode")? != 0,
        auto_merge: row.get::<_, i64>("auto_merge")? != 0,
        created_at: parse_ts(&created_at),
        started_at: opt_ts(row.get("started_at")?),
        completed_at: opt_ts(row.get("completed_at")?),
        archived_at: opt_ts(row.get("archived_at")?),
        brainstorm_output: row.get("brainstorm_output")?,
        design_review: row.get("design_review")?,
        plan: row.get("plan")?,
        implementation_notes: row.get("implementation_notes")?,
        review_comments: row.get("review_comments")?,
        review_score: row.get("review_score")?,
        test_results: test_results.and_then(|s| serde_json::from_str::<TestResults>(&s).ok()),
        verify_result: row.get("verify_result")?,
        commit_hash: row.get("commit_hash")?,
        plan_review_count: row.get("plan_review_count")?,
        impl_review_count: row.get("impl_review_count")?,
        paused_from_status: paused_from.as_deref().and_then(TaskStatus::parse),
        pause_reason: pause_reason.as_deref().and_then(PauseReason::parse),
        branch_name: row.get("branch_name")?,
        worktree_path: row.get("worktree_path")?,
        group_id: row.get("group_id")?,
        work_order: row
            .get::<_, Option<String>>("work_order")?
            .and_then(|s| serde_json::from_str::<WorkOrder>(&s).ok()),
        assigned_skill: row.get("assigned_skill")?,
        active_session_id: row.get("active_session_id")?,
        context_tokens: row.get("context_tokens")?,
        context_max: row.get("context_max")?,
        rich_handoff: row.get("rich_handoff")?,
        todos: lenient_json(row.get("todos")?),
        handoffs: lenient_json(row.get("handoffs")?),
    })
}

fn json_or_null<T: serde::Serialize>(value: &Option<T>) -> Result<Value> {
    Ok(match value {
        Some(v) => Value::Text(serde_json::to_string(v)?),
        None => Value::Null,
    })
}

impl Store {
    /// Create a task in backlog
    pub fn create_task(&mut self, new: NewTask) -> Result<Task> {
        debug!(title = %new.title, tier = new.tier.as_str(), "create_task: called");
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO tasks (title, description, tier, priority, auto_mode, auto_merge,
                                group_id, work_order, assigned_skill)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                new.title,
                new.description,
                new.tier.as_str(),
                new.priority.as_str(),
                new.auto_mode as i64,
                new.auto_merge as i64,
                new.group_id,
                match &new.work_order {
                    Some(wo) => Some(serde_json::to_string(wo)?),
                    None => None,
                },
                new.assigned_skill,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        info!(task_id = id, "Created task");
        self.get_task(id)
    }

    /// Get one task by id
    pub fn get_task(&self, id: i64) -> Result<Task> {
        let mut stmt = self.conn().prepare(&format!("{TASK_SELECT} WHERE id = ?1"))?;
        stmt.query_row([id], task_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("Task", id),
                other => StoreError::Sqlite(other),
            })
    }

    /// List tasks; archived tasks are excluded unless requested
    pub fn list_tasks(&self, include_archived: bool) -> Result<Vec<Task>> {
        let sql = if include_archived {
            format!("{TASK_SELECT} ORDER BY id")
        } else {
            format!("{TASK_SELECT} WHERE archived_at IS NULL ORDER BY id")
        };
        let mut stmt = self.conn().prepare(&sql)?;
        let tasks = stmt.query_map([], task_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Apply a partial patch. Only fields named in [`TaskPatch`] are
    /// updatable; everything else is immutable through this path.
    pub fn update_task(&mut self, id: i64, patch: &TaskPatch) -> Result<Task> {
        debug!(task_id = id, "update_task: called");
        let mut sets: Vec<String> = Vec::new();
        let mut vals: Vec<Value> = Vec::new();

        let set = |col: &str, value: Value, sets: &mut Vec<String>, vals: &mut Vec<Value>| {
            vals.push(value);
            sets.push(format!("{col} = ?{}", vals.len()));
        };

        if let Some(v) = &patch.title {
            set("title", Value::Text(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.description {
            set("description", Value::Text(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = patch.tier {
            set("tier", Value::Text(v.as_str().to_string()), &mut sets, &mut vals);
        }
        if let Some(v) = patch.priority {
            set("priority", Value::Text(v.as_str().to_string()), &mut sets, &mut vals);
        }
        if let Some(v) = patch.status {
            set("status", Value::Text(v.as_str().to_string()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.current_agent {
            set("current_agent", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = patch.auto_mode {
            set("auto_mode", Value::Integer(v as i64), &mut sets, &mut vals);
        }
        if let Some(v) = patch.auto_merge {
            set("auto_merge", Value::Integer(v as i64), &mut sets, &mut vals);
        }
        if let Some(v) = patch.started_at {
            set("started_at", text_or_null(v.map(super::ts)), &mut sets, &mut vals);
        }
        if let Some(v) = patch.completed_at {
            set("completed_at", text_or_null(v.map(super::ts)), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.brainstorm_output {
            set("brainstorm_output", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.design_review {
            set("design_review", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.plan {
            set("plan", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.implementation_notes {
            set("implementation_notes", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.review_comments {
            set("review_comments", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = patch.review_score {
            let value = match v {
                Some(score) => Value::Real(score),
                None => Value::Null,
            };
            set("review_score", value, &mut sets, &mut vals);
        }
        if let Some(v) = &patch.test_results {
            set("test_results", json_or_null(v)?, &mut sets, &mut vals);
        }
        if let Some(v) = &patch.verify_result {
            set("verify_result", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.commit_hash {
            set("commit_hash", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = patch.plan_review_count {
            set("plan_review_count", Value::Integer(v), &mut sets, &mut vals);
        }
        if let Some(v) = patch.impl_review_count {
            set("impl_review_count", Value::Integer(v), &mut sets, &mut vals);
        }
        if let Some(v) = patch.paused_from_status {
            set(
                "paused_from_status",
                text_or_null(v.map(|s| s.as_str().to_string())),
                &mut sets,
                &mut vals,
            );
        }
        if let Some(v) = patch.pause_reason {
            set(
                "pause_reason",
                text_or_null(v.map(|r| r.as_str().to_string())),
                &mut sets,
                &mut vals,
            );
        }
        if let Some(v) = &patch.branch_name {
            set("branch_name", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.worktree_path {
            set("worktree_path", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = patch.group_id {
            let value = match v {
                Some(gid) => Value::Integer(gid),
                None => Value::Null,
            };
            set("group_id", value, &mut sets, &mut vals);
        }
        if let Some(v) = &patch.work_order {
            set("work_order", json_or_null(v)?, &mut sets, &mut vals);
        }
        if let Some(v) = &patch.assigned_skill {
            set("assigned_skill", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.active_session_id {
            set("active_session_id", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = patch.context_tokens {
            let value = match v {
                Some(n) => Value::Integer(n),
                None => Value::Null,
            };
            set("context_tokens", value, &mut sets, &mut vals);
        }
        if let Some(v) = patch.context_max {
            let value = match v {
                Some(n) => Value::Integer(n),
                None => Value::Null,
            };
            set("context_max", value, &mut sets, &mut vals);
        }
        if let Some(v) = &patch.rich_handoff {
            set("rich_handoff", text_or_null(v.clone()), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.todos {
            set("todos", Value::Text(serde_json::to_string(v)?), &mut sets, &mut vals);
        }
        if let Some(v) = &patch.handoffs {
            set("handoffs", Value::Text(serde_json::to_string(v)?), &mut sets, &mut vals);
        }

        if sets.is_empty() {
            return self.get_task(id);
        }

        let sql = format!("UPDATE tasks SET {} WHERE id = ?{}", sets.join(", "), vals.len() + 1);
        vals.push(Value::Integer(id));

        let tx = self.conn_mut().transaction()?;
        let changed = tx.execute(&sql, rusqlite::params_from_iter(vals))?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::not_found("Task", id));
        }
        self.get_task(id)
    }

    /// Delete a task, its dependency edges, handoffs, logs, and workshop links
    pub fn delete_task(&mut self, id: i64) -> Result<()> {
        debug!(task_id = id, "delete_task: called");
        let tx = self.conn_mut().transaction()?;
        let deleted = tx.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(StoreError::not_found("Task", id));
        }
        tx.execute(
            "DELETE FROM task_dependencies WHERE task_id = ?1 OR depends_on = ?1",
            [id],
        )?;
        tx.execute("DELETE FROM handoffs WHERE task_id = ?1", [id])?;
        tx.execute("DELETE FROM agent_logs WHERE task_id = ?1", [id])?;
        tx.execute("DELETE FROM workshop_task_links WHERE task_id = ?1", [id])?;
        tx.commit()?;
        info!(task_id = id, "Deleted task");
        Ok(())
    }

    /// Stamp `archived_at`
    pub fn archive_task(&mut self, id: i64) -> Result<Task> {
        let tx = self.conn_mut().transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET archived_at = ?1 WHERE id = ?2",
            rusqlite::params![super::ts(Utc::now()), id],
        )?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::not_found("Task", id));
        }
        self.get_task(id)
    }

    /// Clear `archived_at`; status and id are untouched
    pub fn unarchive_task(&mut self, id: i64) -> Result<Task> {
        let tx = self.conn_mut().transaction()?;
        let changed = tx.execute("UPDATE tasks SET archived_at = NULL WHERE id = ?1", [id])?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::not_found("Task", id));
        }
        self.get_task(id)
    }

    /// Archive every task with status `done`; returns the count
    pub fn archive_all_done(&mut self) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET archived_at = ?1 WHERE status = 'done' AND archived_at IS NULL",
            [super::ts(Utc::now())],
        )?;
        tx.commit()?;
        info!(archived = changed, "archive_all_done");
        Ok(changed)
    }

    /// Aggregate statistics over non-archived tasks
    pub fn task_stats(&self) -> Result<TaskStats> {
        let conn = self.conn();
        let row = conn.query_row(
            "SELECT
                COUNT(*),
                SUM(CASE WHEN status = 'backlog' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'done' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'blocked' THEN 1 ELSE 0 END),
                AVG(review_score),
                SUM(CASE WHEN plan_review_count >= 3 OR impl_review_count >= 3 THEN 1 ELSE 0 END)
             FROM tasks WHERE archived_at IS NULL",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                ))
            },
        )?;
        let (total, backlog, done, blocked, avg_review_score, trips) = row;
        let in_progress = total - backlog - done - blocked;
        let started = (total - backlog).max(1);
        Ok(TaskStats {
            backlog,
            in_progress,
            done,
            blocked,
            completion_rate: done as f64 / started as f64,
            avg_review_score,
            circuit_breaker_trips: trips,
        })
    }
}

fn text_or_null(value: Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}
