//! Prompt assembly for stage runs

use std::path::PathBuf;

use clawstore::{Handoff, KnowledgeEntry, Task};
use eyre::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::{debug, warn};

use super::embedded;
use super::handoff::{format_handoff_chain, format_previous_handoff};

/// Context rendered into stage templates
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub task_id: i64,
    pub task_title: String,
    pub task_description: String,
    pub tier: String,
    pub stage: String,
    pub worktree_path: String,
    pub previous_handoff: String,
    pub handoff_chain: String,
    pub knowledge_index: String,
    pub skill: String,
    pub work_order: String,
    pub feedback: String,
}

/// Renders stage prompts from templates, skills, handoff history, and the
/// knowledge index.
pub struct PromptAssembler {
    handlebars: Handlebars<'static>,
    project_path: PathBuf,
}

impl PromptAssembler {
    pub fn new(project_path: impl Into<PathBuf>) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        // Missing variables render empty rather than failing the stage
        handlebars.set_strict_mode(false);
        for stage in ["brainstorm", "design_review", "plan", "implement", "code_review", "verify"] {
            let template = embedded::template_for(stage).expect("embedded template");
            handlebars
                .register_template_string(stage, template)
                .context(format!("Failed to register template for {stage}"))?;
        }
        Ok(Self {
            handlebars,
            project_path: project_path.into(),
        })
    }

    /// Compose the system and user prompts for one stage run.
    ///
    /// `feedback` is reviewer feedback from a rejection; it re-runs the
    /// stage with the feedback as a trailing section.
    pub fn compose(
        &self,
        task: &Task,
        stage: &str,
        knowledge: &[KnowledgeEntry],
        feedback: Option<&str>,
    ) -> Result<(String, String)> {
        debug!(task_id = task.id, %stage, "PromptAssembler::compose: called");

        let relevant = relevant_handoffs(&task.handoffs, stage);
        let context = PromptContext {
            task_id: task.id,
            task_title: task.title.clone(),
            task_description: task.description.clone(),
            tier: task.tier.as_str().to_string(),
            stage: stage.to_string(),
            worktree_path: task.worktree_path.clone().unwrap_or_default(),
            previous_handoff: format_previous_handoff(relevant.last().copied()),
            handoff_chain: format_handoff_chain(Some(
                &relevant.iter().map(|h| (*h).clone()).collect::<Vec<_>>(),
            )),
            knowledge_index: knowledge_index(knowledge),
            skill: self.resolve_skill(task.assigned_skill.as_deref()),
            work_order: work_order_section(task),
            feedback: feedback.unwrap_or_default().to_string(),
        };

        let mut system = self
            .handlebars
            .render(stage, &context)
            .context(format!("Failed to render template for {stage}"))?;
        if !context.skill.is_empty() {
            system.push_str("\n## Skill\n");
            system.push_str(&context.skill);
            system.push('\n');
        }
        system.push_str(embedded::HANDOFF_INSTRUCTIONS);

        let mut user = format!("# Task\n{}\n\n{}", task.title, task.description);
        if !context.work_order.is_empty() {
            user.push_str("\n\n## Work Order\n");
            user.push_str(&context.work_order);
        }
        if !context.feedback.is_empty() {
            user.push_str("\n\n## Reviewer Feedback\n");
            user.push_str(&context.feedback);
        }

        Ok((system, user))
    }

    /// Skill resolution chain: project file, then global file, then the
    /// embedded default. Unknown names resolve to empty content.
    fn resolve_skill(&self, name: Option<&str>) -> String {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return String::new();
        };

        let candidates = [
            self.project_path.join(".clawflow").join("skills").join(format!("{name}.md")),
            clawstore::paths::clawflow_home().join("skills").join(format!("{name}.md")),
        ];
        for path in &candidates {
            match std::fs::read_to_string(path) {
                Ok(content) => return content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read skill file"),
            }
        }
        embedded::default_skill(name).unwrap_or_default().to_string()
    }
}

/// Handoffs worth including in a stage's prompt: everything before it in
/// the pipeline (re-runs exclude the stage's own earlier attempt).
fn relevant_handoffs<'a>(handoffs: &'a [Handoff], stage: &str) -> Vec<&'a Handoff> {
    handoffs.iter().filter(|h| h.stage != stage).collect()
}

/// One line per active knowledge entry: `key: summary`
fn knowledge_index(entries: &[KnowledgeEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let lines = entries
        .iter()
        .map(|e| format!("- {}: {}", e.key, e.summary))
        .collect::<Vec<_>>()
        .join("\n");
    format!("## Domain Knowledge\n{lines}")
}

fn work_order_section(task: &Task) -> String {
    let Some(wo) = &task.work_order else {
        return String::new();
    };
    let mut out = format!("Objective: {}", wo.objective);
    if !wo.file_assignments.is_empty() {
        out.push_str("\nFiles:");
        for fa in &wo.file_assignments {
            let action = match fa.action {
                clawstore::FileAction::Create => "create",
                clawstore::FileAction::Modify => "modify",
            };
            out.push_str(&format!("\n- {} ({action})", fa.path));
        }
    }
    if !wo.integration_notes.is_empty() {
        out.push_str(&format!("\nIntegration: {}", wo.integration_notes));
    }
    if !wo.constraints.is_empty() {
        out.push_str(&format!("\nConstraints: {}", wo.constraints));
    }
    if !wo.tests.is_empty() {
        out.push_str(&format!("\nTests: {}", wo.tests));
    }
    out
}

/// Tolerant decode of a handoffs value arriving over the wire: a parsed
/// array, a JSON string, or anything malformed (treated as empty).
pub fn handoffs_from_value(value: &serde_json::Value) -> Vec<Handoff> {
    match value {
        serde_json::Value::Array(_) => serde_json::from_value(value.clone()).unwrap_or_default(),
        serde_json::Value::String(s) => serde_json::from_str(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawstore::{NewTask, Store, TaskTier};
    use std::path::Path;
    use tempfile::TempDir;

    fn sample_task(dir: &Path) -> Task {
        let mut store = Store::open_project(dir.join("t.db")).unwrap();
        let mut new = NewTask::new("Add retry logic", TaskTier::L2);
        new.description = "Retries with capped backoff".to_string();
        store.create_task(new).unwrap()
    }

    #[test]
    fn test_compose_renders_task_fields() {
        let dir = TempDir::new().unwrap();
        let assembler = PromptAssembler::new(dir.path()).unwrap();
        let task = sample_task(dir.path());

        let (system, user) = assembler.compose(&task, "plan", &[], None).unwrap();
        assert!(system.contains("Add retry logic"));
        assert!(system.contains("## Handoff"));
        assert!(user.contains("Retries with capped backoff"));
        assert!(!user.contains("Reviewer Feedback"));
    }

    #[test]
    fn test_compose_appends_feedback_section() {
        let dir = TempDir::new().unwrap();
        let assembler = PromptAssembler::new(dir.path()).unwrap();
        let task = sample_task(dir.path());

        let (_, user) = assembler.compose(&task, "plan", &[], Some("be specific")).unwrap();
        assert!(user.contains("## Reviewer Feedback"));
        assert!(user.contains("be specific"));
    }

    #[test]
    fn test_compose_includes_knowledge_index() {
        let dir = TempDir::new().unwrap();
        let assembler = PromptAssembler::new(dir.path()).unwrap();
        let task = sample_task(dir.path());

        let mut store = Store::open_project(dir.path().join("k.db")).unwrap();
        let mut new = clawstore::NewKnowledge::new("retry-cap", clawstore::KnowledgeCategory::ApiQuirk);
        new.summary = "delays clamp to 120s".to_string();
        new.status = clawstore::KnowledgeStatus::Active;
        let entry = store.create_knowledge(new).unwrap();

        let (system, _) = assembler.compose(&task, "brainstorm", &[entry], None).unwrap();
        assert!(system.contains("- retry-cap: delays clamp to 120s"));
    }

    #[test]
    fn test_compose_empty_history_uses_sentinels() {
        let dir = TempDir::new().unwrap();
        let assembler = PromptAssembler::new(dir.path()).unwrap();
        let task = sample_task(dir.path());

        let (system, _) = assembler.compose(&task, "brainstorm", &[], None).unwrap();
        assert!(system.contains("No handoff history."));
    }

    #[test]
    fn test_skill_resolution_project_overrides_default() {
        let dir = TempDir::new().unwrap();
        let skills = dir.path().join(".clawflow").join("skills");
        std::fs::create_dir_all(&skills).unwrap();
        std::fs::write(skills.join("tdd.md"), "project-local tdd skill").unwrap();

        let assembler = PromptAssembler::new(dir.path()).unwrap();
        assert_eq!(assembler.resolve_skill(Some("tdd")), "project-local tdd skill");
    }

    #[test]
    fn test_skill_resolution_falls_back_to_embedded() {
        let dir = TempDir::new().unwrap();
        let assembler = PromptAssembler::new(dir.path()).unwrap();
        assert!(assembler.resolve_skill(Some("tdd")).contains("failing test"));
        assert_eq!(assembler.resolve_skill(Some("no-such-skill")), "");
        assert_eq!(assembler.resolve_skill(None), "");
    }

    #[test]
    fn test_handoffs_from_value_tolerates_shapes() {
        let arr = serde_json::json!([{"status": "completed", "stage": "plan"}]);
        assert_eq!(handoffs_from_value(&arr).len(), 1);

        let as_string = serde_json::Value::String(r#"[{"status": "completed"}]"#.to_string());
        assert_eq!(handoffs_from_value(&as_string).len(), 1);

        let malformed = serde_json::Value::String("{{not json".to_string());
        assert!(handoffs_from_value(&malformed).is_empty());

        assert!(handoffs_from_value(&serde_json::Value::Null).is_empty());
    }
}
