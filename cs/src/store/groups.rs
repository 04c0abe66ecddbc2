//! TaskGroup CRUD

use chrono::Utc;
use rusqlite::Row;
use tracing::{debug, info};

use crate::domain::{GroupStatus, Task, TaskGroup};

use super::{opt_ts, parse_ts, Result, Store, StoreError};

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<TaskGroup> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(TaskGroup {
        id: row.get("id")?,
        title: row.get("title")?,
        session_id: row.get("session_id")?,
        status: GroupStatus::parse(&status).unwrap_or(GroupStatus::Planning),
        shared_context: row.get("shared_context")?,
        design_artifact_id: row.get("design_artifact_id")?,
        created_at: parse_ts(&created_at),
        completed_at: opt_ts(row.get("completed_at")?),
    })
}

impl Store {
    /// Create a group in `planning`
    pub fn create_group(
        &mut self,
        title: impl Into<String>,
        session_id: Option<i64>,
        shared_context: Option<String>,
    ) -> Result<TaskGroup> {
        let title = title.into();
        debug!(%title, "create_group: called");
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO task_groups (title, session_id, shared_context) VALUES (?1, ?2, ?3)",
            rusqlite::params![title, session_id, shared_context],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        info!(group_id = id, "Created group");
        self.get_group(id)
    }

    pub fn get_group(&self, id: i64) -> Result<TaskGroup> {
        self.conn()
            .query_row("SELECT * FROM task_groups WHERE id = ?1", [id], group_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("TaskGroup", id),
                other => StoreError::Sqlite(other),
            })
    }

    pub fn list_groups(&self) -> Result<Vec<TaskGroup>> {
        let mut stmt = self.conn().prepare("SELECT * FROM task_groups ORDER BY id")?;
        let groups = stmt
            .query_map([], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    pub fn update_group_status(&mut self, id: i64, status: GroupStatus) -> Result<TaskGroup> {
        debug!(group_id = id, status = status.as_str(), "update_group_status: called");
        let completed_at = match status {
            GroupStatus::Completed => Some(super::ts(Utc::now())),
            _ => None,
        };
        let tx = self.conn_mut().transaction()?;
        let changed = tx.execute(
            "UPDATE task_groups SET status = ?1, completed_at = COALESCE(?2, completed_at) WHERE id = ?3",
            rusqlite::params![status.as_str(), completed_at, id],
        )?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::not_found("TaskGroup", id));
        }
        self.get_group(id)
    }

    /// Member tasks, oldest first
    pub fn tasks_by_group(&self, group_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM tasks WHERE group_id = ?1 ORDER BY id")?;
        let tasks = stmt
            .query_map([group_id], super::tasks::task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Delete a group; member tasks are unlinked, never deleted
    pub fn delete_group(&mut self, id: i64) -> Result<()> {
        debug!(group_id = id, "delete_group: called");
        let tx = self.conn_mut().transaction()?;
        let deleted = tx.execute("DELETE FROM task_groups WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(StoreError::not_found("TaskGroup", id));
        }
        tx.execute("UPDATE tasks SET group_id = NULL WHERE group_id = ?1", [id])?;
        tx.commit()?;
        info!(group_id = id, "Deleted group, tasks unlinked");
        Ok(())
    }
}
