//! Structured handoff parsing and formatting

use clawstore::{Handoff, HandoffStatus};
use tracing::debug;

/// Field labels recognized inside a handoff section
const FIELDS: [(&str, usize); 7] = [
    ("status", 0),
    ("summary", 1),
    ("key decisions", 2),
    ("open questions", 3),
    ("files modified", 4),
    ("next stage needs", 5),
    ("warnings", 6),
];

/// Extract the structured handoff from a stage's output. A missing or
/// unrecognizable section synthesizes a `completed` handoff with empty
/// fields rather than failing the stage.
pub fn parse_handoff(output: &str, stage: &str, agent: &str, model: &str) -> Handoff {
    let mut handoff = Handoff::completed(stage, agent, model);

    let Some(section) = locate_section(output) else {
        debug!(%stage, "parse_handoff: no handoff section, synthesizing completed");
        return handoff;
    };

    let mut values: [String; 7] = Default::default();
    let mut current: Option<usize> = None;
    for line in section.lines() {
        let trimmed = line.trim().trim_start_matches(['-', '*', ' ']);
        match match_field(trimmed) {
            Some((idx, value)) => {
                values[idx] = value;
                current = Some(idx);
            }
            None => {
                // Continuation of the previous field
                if let Some(idx) = current {
                    if !trimmed.is_empty() {
                        if !values[idx].is_empty() {
                            values[idx].push('\n');
                        }
                        values[idx].push_str(trimmed);
                    }
                }
            }
        }
    }

    let [status, summary, key_decisions, open_questions, files_modified, next_stage_needs, warnings] = values;
    handoff.status = HandoffStatus::parse(&status.to_lowercase()).unwrap_or(HandoffStatus::Completed);
    handoff.summary = summary;
    handoff.key_decisions = key_decisions;
    handoff.open_questions = none_filtered(open_questions);
    handoff.files_modified = files_modified;
    handoff.next_stage_needs = next_stage_needs;
    handoff.warnings = none_filtered(warnings);
    handoff
}

/// Match a `Label: value` line against the known field labels
fn match_field(line: &str) -> Option<(usize, String)> {
    for (label, idx) in FIELDS {
        if line.len() >= label.len()
            && line.is_char_boundary(label.len())
            && line[..label.len()].eq_ignore_ascii_case(label)
        {
            let rest = line[label.len()..].trim_start();
            if let Some(value) = rest.strip_prefix(':') {
                return Some((idx, value.trim().to_string()));
            }
        }
    }
    None
}

/// "None"-ish answers count as empty
fn none_filtered(value: String) -> String {
    match value.trim().to_lowercase().as_str() {
        "none" | "none." | "n/a" | "-" => String::new(),
        _ => value,
    }
}

/// The text from the last "Handoff" heading to the end of the output
fn locate_section(output: &str) -> Option<&str> {
    let mut start = None;
    for (offset, line) in line_offsets(output) {
        let trimmed = line.trim().trim_start_matches('#').trim();
        if trimmed.eq_ignore_ascii_case("handoff") {
            start = Some(offset + line.len());
        }
    }
    start.map(|s| &output[s..])
}

fn line_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_inclusive('\n').scan(0usize, |offset, line| {
        let start = *offset;
        *offset += line.len();
        Some((start, line))
    })
}

/// One-paragraph rendering of the most recent handoff for prompts
pub fn format_previous_handoff(handoff: Option<&Handoff>) -> String {
    let Some(h) = handoff else {
        return "No previous stages.".to_string();
    };
    let mut out = format!("Previous stage: {} ({})\nSummary: {}", h.stage, h.status.as_str(), h.summary);
    if !h.key_decisions.is_empty() {
        out.push_str(&format!("\nKey decisions: {}", h.key_decisions));
    }
    if !h.next_stage_needs.is_empty() {
        out.push_str(&format!("\nNeeds: {}", h.next_stage_needs));
    }
    if !h.warnings.is_empty() {
        out.push_str(&format!("\nWarnings: {}", h.warnings));
    }
    out
}

/// Compact rendering of the whole handoff history for prompts
pub fn format_handoff_chain(handoffs: Option<&[Handoff]>) -> String {
    let Some(handoffs) = handoffs.filter(|h| !h.is_empty()) else {
        return "No handoff history.".to_string();
    };
    handoffs
        .iter()
        .map(|h| format!("- {} [{}]: {}", h.stage, h.status.as_str(), h.summary))
        .collect::<Vec<_>>()
        .join("\n")
}
