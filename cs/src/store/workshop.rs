//! Thin CRUD over workshop sessions, messages, artifacts, and task links
//!
//! The conversational surface itself lives outside the core; these tables
//! exist as link targets for groups and tasks.

use tracing::debug;

use super::{Result, Store};

impl Store {
    pub fn create_workshop_session(&mut self, title: &str) -> Result<i64> {
        debug!(%title, "create_workshop_session: called");
        let tx = self.conn_mut().transaction()?;
        tx.execute("INSERT INTO workshop_sessions (title) VALUES (?1)", [title])?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn append_workshop_message(&mut self, session_id: i64, role: &str, content: &str) -> Result<i64> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO workshop_messages (session_id, role, content) VALUES (?1, ?2, ?3)",
            rusqlite::params![session_id, role, content],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn save_workshop_artifact(
        &mut self,
        session_id: Option<i64>,
        name: &str,
        kind: &str,
        content: &str,
    ) -> Result<i64> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO workshop_artifacts (session_id, name, kind, content) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session_id, name, kind, content],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn link_workshop_task(&mut self, session_id: i64, task_id: i64) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO workshop_task_links (session_id, task_id) VALUES (?1, ?2)",
            [session_id, task_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::TaskTier;
    use crate::store::testutil::project_store;
    use crate::store::NewTask;

    #[test]
    fn test_session_message_artifact_link() {
        let (mut store, _dir) = project_store();
        let session = store.create_workshop_session("Kickoff").unwrap();
        store.append_workshop_message(session, "user", "Let's plan").unwrap();
        let artifact = store
            .save_workshop_artifact(Some(session), "design", "md", "# Design")
            .unwrap();
        assert!(artifact > 0);

        let task = store.create_task(NewTask::new("t", TaskTier::L1)).unwrap();
        store.link_workshop_task(session, task.id).unwrap();
        // Deleting the task removes the link
        store.delete_task(task.id).unwrap();
    }
}
