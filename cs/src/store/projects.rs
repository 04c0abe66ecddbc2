//! Project registry (global scope)

use chrono::Utc;
use rusqlite::Row;
use tracing::{debug, info};

use crate::domain::project::{Project, ProjectMarker};
use crate::paths;

use super::{opt_ts, parse_ts, Result, Store, StoreError};

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    let registered_at: String = row.get("registered_at")?;
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        path: row.get("path")?,
        registered_at: parse_ts(&registered_at),
        last_opened_at: opt_ts(row.get("last_opened_at")?),
    })
}

impl Store {
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn().prepare("SELECT * FROM projects ORDER BY name")?;
        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    pub fn get_project(&self, name: &str) -> Result<Project> {
        self.conn()
            .query_row("SELECT * FROM projects WHERE name = ?1", [name], project_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("Project", name),
                other => StoreError::Sqlite(other),
            })
    }

    /// Register a project and drop the `.clawflow/project.json` marker in it
    pub fn register_project(&mut self, name: &str, path: &str) -> Result<Project> {
        debug!(%name, %path, "register_project: called");
        if self.get_project(name).is_ok() {
            return Err(StoreError::Validation(format!("Project {name} already registered")));
        }

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO projects (name, path) VALUES (?1, ?2)",
            rusqlite::params![name, path],
        )?;
        tx.commit()?;

        let project = self.get_project(name)?;
        let marker = ProjectMarker {
            name: project.name.clone(),
            registered_at: project.registered_at,
        };
        let marker_path = paths::project_marker_path(std::path::Path::new(path));
        if let Some(parent) = marker_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&marker_path, serde_json::to_string_pretty(&marker)?)?;
        info!(%name, "Registered project");
        Ok(project)
    }

    /// Touch `last_opened_at` and return the project
    pub fn open_project_entry(&mut self, name: &str) -> Result<Project> {
        self.get_project(name)?;
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "UPDATE projects SET last_opened_at = ?1 WHERE name = ?2",
            rusqlite::params![super::ts(Utc::now()), name],
        )?;
        tx.commit()?;
        self.get_project(name)
    }

    /// Unregister a project and delete its project-scoped store file
    pub fn delete_project(&mut self, name: &str) -> Result<()> {
        debug!(%name, "delete_project: called");
        self.get_project(name)?;
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM projects WHERE name = ?1", [name])?;
        tx.commit()?;

        let db_path = paths::project_db_path(name);
        if db_path.exists() {
            std::fs::remove_file(&db_path)?;
        }
        info!(%name, "Deleted project");
        Ok(())
    }
}
