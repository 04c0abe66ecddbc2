//! Project registry entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered project in the global store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub registered_at: DateTime<Utc>,
    pub last_opened_at: Option<DateTime<Utc>>,
}

/// Contents of `{projectPath}/.clawflow/project.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMarker {
    pub name: String,
    pub registered_at: DateTime<Utc>,
}
