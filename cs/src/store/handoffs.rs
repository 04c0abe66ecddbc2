//! Append-only handoff and audit-log helpers
//!
//! Handoffs are first-class rows; the task's JSON `handoffs` column is a
//! write-through view maintained for prompt assembly.

use rusqlite::Row;
use tracing::debug;

use crate::domain::{AgentLogEntry, Handoff, HandoffStatus};

use super::{parse_ts, Result, Store, StoreError};

fn handoff_from_row(row: &Row<'_>) -> rusqlite::Result<Handoff> {
    let status: String = row.get("status")?;
    let timestamp: String = row.get("timestamp")?;
    Ok(Handoff {
        stage: row.get("stage")?,
        agent: row.get("agent")?,
        model: row.get("model")?,
        timestamp: parse_ts(&timestamp),
        status: HandoffStatus::parse(&status).unwrap_or(HandoffStatus::Completed),
        summary: row.get("summary")?,
        key_decisions: row.get("key_decisions")?,
        open_questions: row.get("open_questions")?,
        files_modified: row.get("files_modified")?,
        next_stage_needs: row.get("next_stage_needs")?,
        warnings: row.get("warnings")?,
    })
}

impl Store {
    /// Append a handoff row and refresh the task's JSON view in the same
    /// transaction.
    pub fn append_handoff(&mut self, task_id: i64, handoff: &Handoff) -> Result<()> {
        debug!(task_id, stage = %handoff.stage, "append_handoff: called");
        self.get_task(task_id)?;

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO handoffs (task_id, stage, agent, model, timestamp, status, summary,
                                   key_decisions, open_questions, files_modified, next_stage_needs, warnings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                task_id,
                handoff.stage,
                handoff.agent,
                handoff.model,
                super::ts(handoff.timestamp),
                handoff.status.as_str(),
                handoff.summary,
                handoff.key_decisions,
                handoff.open_questions,
                handoff.files_modified,
                handoff.next_stage_needs,
                handoff.warnings,
            ],
        )?;

        // Refresh the view column from the authoritative rows
        let view: Vec<Handoff> = {
            let mut stmt =
                tx.prepare("SELECT * FROM handoffs WHERE task_id = ?1 ORDER BY id")?;
            let rows = stmt
                .query_map([task_id], handoff_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tx.execute(
            "UPDATE tasks SET handoffs = ?1 WHERE id = ?2",
            rusqlite::params![serde_json::to_string(&view)?, task_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Handoff history for a task, oldest first
    pub fn handoffs_for_task(&self, task_id: i64) -> Result<Vec<Handoff>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT * FROM handoffs WHERE task_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([task_id], handoff_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete every handoff row for a task and clear the view column
    pub fn clear_handoffs(&mut self, task_id: i64) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM handoffs WHERE task_id = ?1", [task_id])?;
        tx.execute("UPDATE tasks SET handoffs = '[]' WHERE id = ?1", [task_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Append an immutable audit record
    pub fn append_agent_log(&mut self, task_id: i64, entry: &AgentLogEntry) -> Result<()> {
        debug!(task_id, action = %entry.action, "append_agent_log: called");
        if self.get_task(task_id).is_err() {
            return Err(StoreError::not_found("Task", task_id));
        }
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO agent_logs (task_id, timestamp, agent, model, action, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                task_id,
                super::ts(entry.timestamp),
                entry.agent,
                entry.model,
                entry.action,
                entry.details,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Audit log for a task, oldest first
    pub fn agent_logs_for_task(&self, task_id: i64) -> Result<Vec<AgentLogEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT timestamp, agent, model, action, details FROM agent_logs WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([task_id], |row| {
                let timestamp: String = row.get(0)?;
                Ok(AgentLogEntry {
                    timestamp: parse_ts(&timestamp),
                    agent: row.get(1)?,
                    model: row.get(2)?,
                    action: row.get(3)?,
                    details: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskTier;
    use crate::store::testutil::project_store;
    use crate::store::NewTask;

    #[test]
    fn test_append_and_read_back() {
        let (mut store, _dir) = project_store();
        let task = store.create_task(NewTask::new("t", TaskTier::L2)).unwrap();

        let mut h = Handoff::completed("brainstorm", "brainstorm", "sonnet");
        h.summary = "Explored three approaches".to_string();
        store.append_handoff(task.id, &h).unwrap();

        let handoffs = store.handoffs_for_task(task.id).unwrap();
        assert_eq!(handoffs.len(), 1);
        assert_eq!(handoffs[0].summary, "Explored three approaches");

        // The JSON view column tracks the rows
        let loaded = store.get_task(task.id).unwrap();
        assert_eq!(loaded.handoffs.len(), 1);
        assert_eq!(loaded.handoffs[0].stage, "brainstorm");
    }

    #[test]
    fn test_handoffs_are_ordered() {
        let (mut store, _dir) = project_store();
        let task = store.create_task(NewTask::new("t", TaskTier::L2)).unwrap();
        for stage in ["brainstorm", "plan", "implement"] {
            store
                .append_handoff(task.id, &Handoff::completed(stage, stage, "m"))
                .unwrap();
        }
        let stages: Vec<String> = store
            .handoffs_for_task(task.id)
            .unwrap()
            .into_iter()
            .map(|h| h.stage)
            .collect();
        assert_eq!(stages, vec!["brainstorm", "plan", "implement"]);
    }

    #[test]
    fn test_clear_handoffs() {
        let (mut store, _dir) = project_store();
        let task = store.create_task(NewTask::new("t", TaskTier::L2)).unwrap();
        store
            .append_handoff(task.id, &Handoff::completed("plan", "plan", "m"))
            .unwrap();
        store.clear_handoffs(task.id).unwrap();
        assert!(store.handoffs_for_task(task.id).unwrap().is_empty());
        assert!(store.get_task(task.id).unwrap().handoffs.is_empty());
    }

    #[test]
    fn test_agent_log_roundtrip() {
        let (mut store, _dir) = project_store();
        let task = store.create_task(NewTask::new("t", TaskTier::L2)).unwrap();
        let entry = AgentLogEntry {
            timestamp: chrono::Utc::now(),
            agent: "plan".to_string(),
            model: "sonnet".to_string(),
            action: "stage_start".to_string(),
            details: "starting plan".to_string(),
        };
        store.append_agent_log(task.id, &entry).unwrap();

        let logs = store.agent_logs_for_task(task.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "stage_start");
    }

    #[test]
    fn test_append_to_missing_task_fails() {
        let (mut store, _dir) = project_store();
        let h = Handoff::completed("plan", "plan", "m");
        assert!(store.append_handoff(42, &h).is_err());
    }
}
