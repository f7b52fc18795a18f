//! Prompt templates
//!
//! A template has exactly two insertion points, `{target}` and `{options}`.
//! Rendering is a single concatenation pass, so braces inside the inserted
//! texts are never expanded again.

use anyhow::{bail, Result};

/// Placeholder for the target story (or sentence)
pub const TARGET_PLACEHOLDER: &str = "{target}";
/// Placeholder for the serialized options
pub const OPTIONS_PLACEHOLDER: &str = "{options}";

/// System instruction sent along with every prompt
pub const SYSTEM_INSTRUCTION: &str = "Reasoning: low. Keep your reasoning analysis short and concise in the task. The length of the intermediate reasoning should not exceed 200 words.";

/// AnaloBench story-matching prompt
pub const ANALOBENCH_TEMPLATE: &str = concat!(
    "\n",
    "Which of the following is the most analogous story to the target story?\n",
    "Note: Only generate the index without any additional text. \n",
    "\n",
    "Target Story:\n",
    "{target}\n",
    "\n",
    "Options: \n",
    "{options}\n",
    "\n",
    "Answer:\n",
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Target,
    Options,
}

/// A validated two-slot prompt template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    /// Literal text before each slot, in order
    pieces: Vec<(String, Slot)>,
    tail: String,
}

impl PromptTemplate {
    /// Parse a template; each placeholder must appear exactly once
    pub fn new(template: &str) -> Result<Self> {
        for placeholder in [TARGET_PLACEHOLDER, OPTIONS_PLACEHOLDER] {
            let count = template.matches(placeholder).count();
            if count != 1 {
                bail!("Template must contain {placeholder} exactly once (found {count})");
            }
        }

        let mut pieces = Vec::with_capacity(2);
        let mut rest = template;
        while let Some((pos, slot, len)) = next_slot(rest) {
            pieces.push((rest[..pos].to_string(), slot));
            rest = &rest[pos + len..];
        }

        Ok(Self {
            pieces,
            tail: rest.to_string(),
        })
    }

    /// Built-in AnaloBench template
    pub fn analobench() -> Self {
        Self::new(ANALOBENCH_TEMPLATE).expect("built-in template has both placeholders")
    }

    /// Fill in the target text and options
    pub fn render(&self, target: &str, options: &str) -> String {
        let mut out = String::with_capacity(
            self.pieces.iter().map(|(s, _)| s.len()).sum::<usize>()
                + self.tail.len()
                + target.len()
                + options.len(),
        );
        for (literal, slot) in &self.pieces {
            out.push_str(literal);
            out.push_str(match slot {
                Slot::Target => target,
                Slot::Options => options,
            });
        }
        out.push_str(&self.tail);
        out
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::analobench()
    }
}

fn next_slot(text: &str) -> Option<(usize, Slot, usize)> {
    let target = text
        .find(TARGET_PLACEHOLDER)
        .map(|p| (p, Slot::Target, TARGET_PLACEHOLDER.len()));
    let options = text
        .find(OPTIONS_PLACEHOLDER)
        .map(|p| (p, Slot::Options, OPTIONS_PLACEHOLDER.len()));
    match (target, options) {
        (Some(t), Some(o)) => Some(if t.0 < o.0 { t } else { o }),
        (t, o) => t.or(o),
    }
}
