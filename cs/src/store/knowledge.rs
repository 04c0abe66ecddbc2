//! Knowledge entries with `(key, status)` dedup and promotion

use chrono::Utc;
use rusqlite::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{lenient_json, KnowledgeCategory, KnowledgeEntry, KnowledgeSource, KnowledgeStatus};

use super::{parse_ts, Result, Store, StoreError};

/// Fields accepted when creating or upserting a knowledge entry
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NewKnowledge {
    pub key: String,
    pub summary: String,
    pub content: String,
    pub category: KnowledgeCategory,
    pub tags: Vec<String>,
    pub source: KnowledgeSource,
    pub source_id: Option<String>,
    pub status: KnowledgeStatus,
}

impl Default for NewKnowledge {
    fn default() -> Self {
        Self::new("", KnowledgeCategory::Convention)
    }
}

impl NewKnowledge {
    pub fn new(key: impl Into<String>, category: KnowledgeCategory) -> Self {
        Self {
            key: key.into(),
            summary: String::new(),
            content: String::new(),
            category,
            tags: Vec::new(),
            source: KnowledgeSource::Manual,
            source_id: None,
            status: KnowledgeStatus::Candidate,
        }
    }
}

/// Rough token estimate used for prompt budgeting (4 chars per token)
fn estimate_tokens(content: &str, summary: &str) -> i64 {
    ((content.len() + summary.len()) / 4) as i64
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
    let category: String = row.get("category")?;
    let source: String = row.get("source")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(KnowledgeEntry {
        id: row.get("id")?,
        key: row.get("key")?,
        summary: row.get("summary")?,
        content: row.get("content")?,
        category: KnowledgeCategory::parse(&category).unwrap_or(KnowledgeCategory::Convention),
        tags: lenient_json(row.get("tags")?),
        source: KnowledgeSource::parse(&source).unwrap_or(KnowledgeSource::Manual),
        source_id: row.get("source_id")?,
        status: KnowledgeStatus::parse(&status).unwrap_or(KnowledgeStatus::Candidate),
        token_estimate: row.get("token_estimate")?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

impl Store {
    /// Create a new entry unconditionally (fails on `(key, status)` clash)
    pub fn create_knowledge(&mut self, new: NewKnowledge) -> Result<KnowledgeEntry> {
        debug!(key = %new.key, status = new.status.as_str(), "create_knowledge: called");
        let id = Uuid::now_v7().to_string();
        let table = self.knowledge_table();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO {table} (id, key, summary, content, category, tags, source, source_id, status, token_estimate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            rusqlite::params![
                id,
                new.key,
                new.summary,
                new.content,
                new.category.as_str(),
                serde_json::to_string(&new.tags)?,
                new.source.as_str(),
                new.source_id,
                new.status.as_str(),
                estimate_tokens(&new.content, &new.summary),
            ],
        )?;
        tx.commit()?;
        self.get_knowledge(&id)
    }

    pub fn get_knowledge(&self, id: &str) -> Result<KnowledgeEntry> {
        let table = self.knowledge_table();
        self.conn()
            .query_row(&format!("SELECT * FROM {table} WHERE id = ?1"), [id], entry_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::not_found("KnowledgeEntry", id),
                other => StoreError::Sqlite(other),
            })
    }

    /// Active entry for a key, if any
    pub fn get_knowledge_by_key(&self, key: &str) -> Result<Option<KnowledgeEntry>> {
        self.get_knowledge_by_key_status(key, KnowledgeStatus::Active)
    }

    pub fn get_knowledge_by_key_status(&self, key: &str, status: KnowledgeStatus) -> Result<Option<KnowledgeEntry>> {
        let table = self.knowledge_table();
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT * FROM {table} WHERE key = ?1 AND status = ?2"))?;
        let mut rows = stmt.query_map(rusqlite::params![key, status.as_str()], entry_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Upsert keyed by `(key, status)`: an existing row is updated in place
    /// (stable id), otherwise a new row is created. This is the dedup
    /// boundary for agent-produced knowledge.
    pub fn create_or_update_knowledge(&mut self, new: NewKnowledge) -> Result<KnowledgeEntry> {
        debug!(key = %new.key, status = new.status.as_str(), "create_or_update_knowledge: called");
        if let Some(existing) = self.get_knowledge_by_key_status(&new.key, new.status)? {
            let table = self.knowledge_table();
            let tx = self.conn_mut().transaction()?;
            tx.execute(
                &format!(
                    "UPDATE {table} SET summary = ?1, content = ?2, category = ?3, tags = ?4,
                                        source = ?5, source_id = ?6, token_estimate = ?7, updated_at = ?8
                     WHERE id = ?9"
                ),
                rusqlite::params![
                    new.summary,
                    new.content,
                    new.category.as_str(),
                    serde_json::to_string(&new.tags)?,
                    new.source.as_str(),
                    new.source_id,
                    estimate_tokens(&new.content, &new.summary),
                    super::ts(Utc::now()),
                    existing.id,
                ],
            )?;
            tx.commit()?;
            return self.get_knowledge(&existing.id);
        }
        self.create_knowledge(new)
    }

    /// List entries with optional category and status filters
    pub fn list_knowledge(
        &self,
        category: Option<KnowledgeCategory>,
        status: Option<KnowledgeStatus>,
    ) -> Result<Vec<KnowledgeEntry>> {
        let table = self.knowledge_table();
        let mut sql = format!("SELECT * FROM {table} WHERE 1=1");
        let mut params: Vec<String> = Vec::new();
        if let Some(c) = category {
            params.push(c.as_str().to_string());
            sql.push_str(&format!(" AND category = ?{}", params.len()));
        }
        if let Some(s) = status {
            params.push(s.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY key");

        let mut stmt = self.conn().prepare(&sql)?;
        let entries = stmt
            .query_map(rusqlite::params_from_iter(params), entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Entries awaiting promotion
    pub fn list_knowledge_candidates(&self) -> Result<Vec<KnowledgeEntry>> {
        self.list_knowledge(None, Some(KnowledgeStatus::Candidate))
    }

    /// Update mutable fields of an entry; the id is stable
    pub fn update_knowledge(&mut self, id: &str, new: &NewKnowledge) -> Result<KnowledgeEntry> {
        self.get_knowledge(id)?;
        let table = self.knowledge_table();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            &format!(
                "UPDATE {table} SET key = ?1, summary = ?2, content = ?3, category = ?4, tags = ?5,
                                    status = ?6, token_estimate = ?7, updated_at = ?8
                 WHERE id = ?9"
            ),
            rusqlite::params![
                new.key,
                new.summary,
                new.content,
                new.category.as_str(),
                serde_json::to_string(&new.tags)?,
                new.status.as_str(),
                estimate_tokens(&new.content, &new.summary),
                super::ts(Utc::now()),
                id,
            ],
        )?;
        tx.commit()?;
        self.get_knowledge(id)
    }

    pub fn delete_knowledge(&mut self, id: &str) -> Result<()> {
        let table = self.knowledge_table();
        let tx = self.conn_mut().transaction()?;
        let deleted = tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [id])?;
        tx.commit()?;
        if deleted == 0 {
            return Err(StoreError::not_found("KnowledgeEntry", id));
        }
        Ok(())
    }

    /// Flip a candidate to active. When a global store is supplied, the
    /// entry is mirrored there, but only if no entry with the same key is
    /// already active globally.
    pub fn promote_candidate(&mut self, id: &str, global: Option<&mut Store>) -> Result<KnowledgeEntry> {
        debug!(%id, mirror_global = global.is_some(), "promote_candidate: called");
        let entry = self.get_knowledge(id)?;
        if entry.status != KnowledgeStatus::Candidate {
            return Err(StoreError::Validation(format!(
                "Knowledge entry {id} is {}, not a candidate",
                entry.status.as_str()
            )));
        }

        let table = self.knowledge_table();
        let tx = self.conn_mut().transaction()?;
        // A previously active row with the same key is superseded
        tx.execute(
            &format!("DELETE FROM {table} WHERE key = ?1 AND status = 'active' AND id != ?2"),
            rusqlite::params![entry.key, id],
        )?;
        tx.execute(
            &format!("UPDATE {table} SET status = 'active', updated_at = ?1 WHERE id = ?2"),
            rusqlite::params![super::ts(Utc::now()), id],
        )?;
        tx.commit()?;
        let promoted = self.get_knowledge(id)?;

        if let Some(global_store) = global {
            let already_active = global_store.get_knowledge_by_key(&promoted.key)?.is_some();
            if already_active {
                info!(key = %promoted.key, "promote_candidate: key already active globally, skipping mirror");
            } else {
                global_store.create_knowledge(NewKnowledge {
                    key: promoted.key.clone(),
                    summary: promoted.summary.clone(),
                    content: promoted.content.clone(),
                    category: promoted.category,
                    tags: promoted.tags.clone(),
                    source: promoted.source,
                    source_id: promoted.source_id.clone(),
                    status: KnowledgeStatus::Active,
                })?;
            }
        }

        Ok(promoted)
    }

    /// Archive a candidate without promoting it
    pub fn discard_candidate(&mut self, id: &str) -> Result<KnowledgeEntry> {
        let entry = self.get_knowledge(id)?;
        if entry.status != KnowledgeStatus::Candidate {
            return Err(StoreError::Validation(format!(
                "Knowledge entry {id} is {}, not a candidate",
                entry.status.as_str()
            )));
        }
        let table = self.knowledge_table();
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            &format!("UPDATE {table} SET status = 'archived', updated_at = ?1 WHERE id = ?2"),
            rusqlite::params![super::ts(Utc::now()), id],
        )?;
        tx.commit()?;
        self.get_knowledge(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::{global_store, project_store};

    fn candidate(key: &str) -> NewKnowledge {
        let mut new = NewKnowledge::new(key, KnowledgeCategory::ApiQuirk);
        new.summary = format!("summary of {key}");
        new.content = format!("content of {key}");
        new.source = KnowledgeSource::Pipeline;
        new
    }

    #[test]
    fn test_create_and_get_by_key_status() {
        let (mut store, _dir) = project_store();
        let entry = store.create_knowledge(candidate("retry-cap")).unwrap();
        assert_eq!(entry.status, KnowledgeStatus::Candidate);

        let found = store
            .get_knowledge_by_key_status("retry-cap", KnowledgeStatus::Candidate)
            .unwrap();
        assert_eq!(found.unwrap().id, entry.id);

        // Not active yet
        assert!(store.get_knowledge_by_key("retry-cap").unwrap().is_none());
    }

    #[test]
    fn test_create_or_update_dedups() {
        let (mut store, _dir) = project_store();
        let first = store.create_or_update_knowledge(candidate("dup")).unwrap();
        let mut updated = candidate("dup");
        updated.content = "fresher content".to_string();
        let second = store.create_or_update_knowledge(updated).unwrap();

        // Exactly one row, stable id, latest content
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "fresher content");
        assert_eq!(
            store
                .list_knowledge(None, Some(KnowledgeStatus::Candidate))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_create_or_update_repeated_n_times_single_row() {
        let (mut store, _dir) = project_store();
        for i in 0..5 {
            let mut new = candidate("same-key");
            new.content = format!("version {i}");
            store.create_or_update_knowledge(new).unwrap();
        }
        let all = store.list_knowledge(None, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "version 4");
    }

    #[test]
    fn test_promote_flips_to_active() {
        let (mut store, _dir) = project_store();
        let entry = store.create_knowledge(candidate("promote-me")).unwrap();
        let promoted = store.promote_candidate(&entry.id, None).unwrap();
        assert_eq!(promoted.status, KnowledgeStatus::Active);
        assert!(store.get_knowledge_by_key("promote-me").unwrap().is_some());
        assert!(store.list_knowledge_candidates().unwrap().is_empty());
    }

    #[test]
    fn test_promote_mirrors_global_once() {
        let (mut store, _dir) = project_store();
        let (mut global, _gdir) = global_store();

        let a = store.create_knowledge(candidate("shared-key")).unwrap();
        store.promote_candidate(&a.id, Some(&mut global)).unwrap();
        assert!(global.get_knowledge_by_key("shared-key").unwrap().is_some());

        // A second promotion of the same key does not duplicate globally
        let b = store.create_knowledge(candidate("shared-key")).unwrap();
        store.promote_candidate(&b.id, Some(&mut global)).unwrap();
        let globals = global
            .list_knowledge(None, Some(KnowledgeStatus::Active))
            .unwrap();
        assert_eq!(globals.iter().filter(|e| e.key == "shared-key").count(), 1);
    }

    #[test]
    fn test_promote_non_candidate_rejected() {
        let (mut store, _dir) = project_store();
        let entry = store.create_knowledge(candidate("x")).unwrap();
        store.promote_candidate(&entry.id, None).unwrap();
        assert!(matches!(
            store.promote_candidate(&entry.id, None),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_discard_archives() {
        let (mut store, _dir) = project_store();
        let entry = store.create_knowledge(candidate("bin-me")).unwrap();
        let archived = store.discard_candidate(&entry.id).unwrap();
        assert_eq!(archived.status, KnowledgeStatus::Archived);
    }

    #[test]
    fn test_update_keeps_id_stable() {
        let (mut store, _dir) = project_store();
        let mut new = candidate("stable");
        new.status = KnowledgeStatus::Active;
        let entry = store.create_or_update_knowledge(new.clone()).unwrap();

        new.content = "rewritten".to_string();
        let updated = store.create_or_update_knowledge(new).unwrap();
        assert_eq!(updated.id, entry.id);

        let read = store.get_knowledge_by_key("stable").unwrap().unwrap();
        assert_eq!(read.content, "rewritten");
    }

    #[test]
    fn test_corrupt_tags_yield_empty_list() {
        let (mut store, _dir) = project_store();
        let entry = store.create_knowledge(candidate("bad-tags")).unwrap();
        store
            .conn()
            .execute(
                "UPDATE domain_knowledge SET tags = '{broken' WHERE id = ?1",
                [&entry.id],
            )
            .unwrap();
        let list = store.list_knowledge(None, None).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].tags.is_empty());
    }

    #[test]
    fn test_category_filter() {
        let (mut store, _dir) = project_store();
        store.create_knowledge(candidate("quirk")).unwrap();
        let mut conv = candidate("conv");
        conv.category = KnowledgeCategory::Convention;
        store.create_knowledge(conv).unwrap();

        let quirks = store
            .list_knowledge(Some(KnowledgeCategory::ApiQuirk), None)
            .unwrap();
        assert_eq!(quirks.len(), 1);
        assert_eq!(quirks[0].key, "quirk");
    }

    #[test]
    fn test_token_estimate() {
        let (mut store, _dir) = project_store();
        let mut new = candidate("est");
        new.content = "x".repeat(400);
        new.summary = String::new();
        let entry = store.create_knowledge(new).unwrap();
        assert_eq!(entry.token_estimate, 100);
    }
}
