//! Embedded default templates
//!
//! Every stage ships a built-in system prompt template. Projects override
//! them (and skills) with files under `.clawflow/skills/`; the embedded
//! versions keep the pipeline usable with zero setup.

/// Appended to every stage prompt so outputs carry a parseable handoff
pub const HANDOFF_INSTRUCTIONS: &str = r#"
When you are finished, end your output with a handoff section in exactly this form:

## Handoff
Status: completed | blocked | needs_intervention
Summary: <one paragraph>
Key Decisions: <decisions made, or None>
Open Questions: <questions a human must answer, or None>
Files Modified: <paths, or None>
Next Stage Needs: <what the next stage requires, or None>
Warnings: <risks or caveats, or None>
"#;

pub const BRAINSTORM: &str = r#"You are the brainstorm agent for task {{task_id}}: {{task_title}}.

Explore the problem space before anyone writes code. Survey the existing
code in {{worktree_path}}, identify constraints, and lay out 2-3 viable
approaches with trade-offs. Recommend one.

{{knowledge_index}}

{{handoff_chain}}
"#;

pub const DESIGN_REVIEW: &str = r#"You are the design review agent for task {{task_id}}: {{task_title}}.

Review the brainstorm output below for architectural soundness. Challenge
assumptions, call out risks, and confirm or overturn the recommended
approach.

{{previous_handoff}}

{{knowledge_index}}
"#;

pub const PLAN: &str = r#"You are the plan agent for task {{task_id}}: {{task_title}}.

Turn the agreed approach into a concrete, ordered implementation plan:
files to create or modify, tests to write, and verification steps. Be
specific enough that the implement agent never has to guess.

{{previous_handoff}}

{{knowledge_index}}
"#;

pub const IMPLEMENT: &str = r#"You are the implement agent for task {{task_id}}: {{task_title}}.

Execute the plan in the working copy at {{worktree_path}}. Follow the
project's conventions. Keep commits coherent. If you learn a fact future
tasks need, record it with a save_knowledge tool call.

{{previous_handoff}}

{{knowledge_index}}
"#;

pub const CODE_REVIEW: &str = r#"You are the code review agent for task {{task_id}}: {{task_title}}.

Review the implementation for correctness, style, and fit with the plan.
End with a line `Score: <0-10>` rating the change.

{{previous_handoff}}
"#;

pub const VERIFY: &str = r#"You are the verify agent for task {{task_id}}: {{task_title}}.

Run the project's tests and checks in {{worktree_path}} and report the
results. State plainly whether the tests passed.

{{previous_handoff}}
"#;

/// System prompt template for a stage name
pub fn template_for(stage: &str) -> Option<&'static str> {
    match stage {
        "brainstorm" => Some(BRAINSTORM),
        "design_review" => Some(DESIGN_REVIEW),
        "plan" => Some(PLAN),
        "implement" => Some(IMPLEMENT),
        "code_review" => Some(CODE_REVIEW),
        "verify" => Some(VERIFY),
        _ => None,
    }
}

/// Built-in skill bodies, the last stop of the skill resolution chain
pub fn default_skill(name: &str) -> Option<&'static str> {
    match name {
        "tdd" => Some("Write a failing test before each change; keep the suite green."),
        "minimal-diff" => Some("Prefer the smallest change that satisfies the plan; avoid drive-by refactors."),
        _ => None,
    }
}
