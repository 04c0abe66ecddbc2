//! Prompt assembly and handoff parsing
//!
//! Stage prompts are handlebars templates ({{variable}} substitution) fed
//! with the task, its handoff history, skill content, and the knowledge
//! index. Stage outputs end with a structured "Handoff" section parsed
//! back into a [`clawstore::Handoff`].

mod assembler;
mod embedded;
mod handoff;

pub use assembler::{handoffs_from_value, PromptAssembler, PromptContext};
pub use handoff::{format_handoff_chain, format_previous_handoff, parse_handoff};
