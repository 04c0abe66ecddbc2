//! Schema creation and forward-only migrations
//!
//! The base schema is created with `CREATE TABLE IF NOT EXISTS`. Columns
//! added after a release ship as entries in `REQUIRED_COLUMNS`: at startup
//! each is added with its default when `PRAGMA table_info` does not list it.
//! Columns are never dropped, so the migration is idempotent and older
//! databases upgrade in place.

use rusqlite::Connection;
use tracing::{debug, info};

use super::Result;

/// Base schema shared by both scopes. `{knowledge}` is substituted with the
/// scope's knowledge table name.
const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    path            TEXT NOT NULL,
    registered_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    last_opened_at  TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    title               TEXT NOT NULL,
    description         TEXT NOT NULL DEFAULT '',
    tier                TEXT NOT NULL DEFAULT 'L2',
    priority            TEXT NOT NULL DEFAULT 'medium',
    status              TEXT NOT NULL DEFAULT 'backlog',
    current_agent       TEXT,
    auto_mode           INTEGER NOT NULL DEFAULT 0,
    auto_merge          INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    started_at          TEXT,
    completed_at        TEXT,
    archived_at         TEXT,
    brainstorm_output   TEXT,
    design_review       TEXT,
    plan                TEXT,
    implementation_notes TEXT,
    review_comments     TEXT,
    review_score        REAL,
    test_results        TEXT,
    verify_result       TEXT,
    commit_hash         TEXT,
    plan_review_count   INTEGER NOT NULL DEFAULT 0,
    impl_review_count   INTEGER NOT NULL DEFAULT 0,
    paused_from_status  TEXT,
    pause_reason        TEXT,
    branch_name         TEXT,
    worktree_path       TEXT,
    group_id            INTEGER,
    work_order          TEXT,
    assigned_skill      TEXT,
    active_session_id   TEXT,
    rich_handoff        TEXT,
    todos               TEXT,
    handoffs            TEXT
);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id     INTEGER NOT NULL,
    depends_on  INTEGER NOT NULL,
    PRIMARY KEY (task_id, depends_on)
);

CREATE TABLE IF NOT EXISTS task_groups (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    title               TEXT NOT NULL,
    session_id          INTEGER,
    status              TEXT NOT NULL DEFAULT 'planning',
    shared_context      TEXT,
    design_artifact_id  INTEGER,
    created_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    completed_at        TEXT
);

CREATE TABLE IF NOT EXISTS handoffs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL,
    stage       TEXT NOT NULL,
    agent       TEXT NOT NULL DEFAULT '',
    model       TEXT NOT NULL DEFAULT '',
    timestamp   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    status      TEXT NOT NULL DEFAULT 'completed',
    summary     TEXT NOT NULL DEFAULT '',
    key_decisions TEXT NOT NULL DEFAULT '',
    open_questions TEXT NOT NULL DEFAULT '',
    files_modified TEXT NOT NULL DEFAULT '',
    next_stage_needs TEXT NOT NULL DEFAULT '',
    warnings    TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS agent_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     INTEGER NOT NULL,
    timestamp   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    agent       TEXT NOT NULL DEFAULT '',
    model       TEXT NOT NULL DEFAULT '',
    action      TEXT NOT NULL,
    details     TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS workshop_sessions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    title       TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE TABLE IF NOT EXISTS workshop_messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  INTEGER NOT NULL,
    role        TEXT NOT NULL DEFAULT 'user',
    content     TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE TABLE IF NOT EXISTS workshop_artifacts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  INTEGER,
    name        TEXT NOT NULL,
    kind        TEXT NOT NULL DEFAULT 'md',
    content     TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE TABLE IF NOT EXISTS workshop_task_links (
    session_id  INTEGER NOT NULL,
    task_id     INTEGER NOT NULL,
    PRIMARY KEY (session_id, task_id)
);

CREATE TABLE IF NOT EXISTS settings (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS {knowledge} (
    id              TEXT PRIMARY KEY,
    key             TEXT NOT NULL,
    summary         TEXT NOT NULL DEFAULT '',
    content         TEXT NOT NULL DEFAULT '',
    category        TEXT NOT NULL DEFAULT 'convention',
    tags            TEXT NOT NULL DEFAULT '[]',
    source          TEXT NOT NULL DEFAULT 'manual',
    source_id       TEXT,
    status          TEXT NOT NULL DEFAULT 'candidate',
    token_estimate  INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS idx_tasks_group ON tasks (group_id);
CREATE INDEX IF NOT EXISTS idx_handoffs_task ON handoffs (task_id);
CREATE INDEX IF NOT EXISTS idx_agent_logs_task ON agent_logs (task_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_{knowledge}_key_status ON {knowledge} (key, status);
"#;

/// Columns added after the base schema shipped. Each entry is
/// `(table, column, declaration-with-default)`.
const REQUIRED_COLUMNS: &[(&str, &str, &str)] = &[
    ("tasks", "context_tokens", "INTEGER"),
    ("tasks", "context_max", "INTEGER"),
];

/// Create the schema and add any missing columns. Idempotent; never drops.
pub fn migrate(conn: &Connection, knowledge_table: &str) -> Result<()> {
    debug!(knowledge_table, "migrate: called");
    let schema = BASE_SCHEMA.replace("{knowledge}", knowledge_table);
    conn.execute_batch(&schema)?;

    for (table, column, decl) in REQUIRED_COLUMNS {
        if !has_column(conn, table, column)? {
            info!(table, column, "migrate: adding missing column");
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
        }
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrate_creates_schema() {
        let conn = mem_conn();
        migrate(&conn, "domain_knowledge").unwrap();
        assert!(has_column(&conn, "tasks", "status").unwrap());
        assert!(has_column(&conn, "domain_knowledge", "key").unwrap());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = mem_conn();
        migrate(&conn, "domain_knowledge").unwrap();
        migrate(&conn, "domain_knowledge").unwrap();
        migrate(&conn, "domain_knowledge").unwrap();
    }

    #[test]
    fn test_migrate_adds_missing_columns() {
        let conn = mem_conn();
        // Simulate an older database that predates the context columns
        conn.execute_batch("CREATE TABLE tasks (id INTEGER PRIMARY KEY, title TEXT NOT NULL)")
            .unwrap();
        migrate(&conn, "domain_knowledge").unwrap();
        assert!(has_column(&conn, "tasks", "context_tokens").unwrap());
        assert!(has_column(&conn, "tasks", "context_max").unwrap());
    }

    #[test]
    fn test_global_scope_uses_global_table() {
        let conn = mem_conn();
        migrate(&conn, "global_knowledge").unwrap();
        assert!(has_column(&conn, "global_knowledge", "key").unwrap());
    }
}
