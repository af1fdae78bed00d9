//! Built-in completion templates.
//!
//! Each template carries a prompt body with a `{text}` placeholder that is
//! filled with the user's input before the plain-completion call.  These are
//! hardcoded for now; a later server endpoint may serve them instead.

use serde::{Deserialize, Serialize};

/// Marker substituted with the user's input when rendering.
pub const PLACEHOLDER: &str = "{text}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionTemplate {
    pub id: String,
    pub title: String,
    /// Interaction style this template targets.  Only `"completion"` today.
    pub style: String,
    pub template: String,
    /// Per-template knob overrides; `None` falls back to the session's
    /// generation parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl CompletionTemplate {
    /// Substitute the user's text into the template.
    ///
    /// Only the first placeholder occurrence is replaced.  A template without
    /// a placeholder renders unchanged.
    pub fn render(&self, text: &str) -> String {
        self.template.replacen(PLACEHOLDER, text, 1)
    }
}

fn template(
    id: &str,
    title: &str,
    body: &str,
    knobs: Option<(f32, u32, f32)>,
) -> CompletionTemplate {
    let (temperature, max_tokens, top_p) = match knobs {
        Some((t, m, p)) => (Some(t), Some(m), Some(p)),
        None => (None, None, None),
    };
    CompletionTemplate {
        id: id.to_string(),
        title: title.to_string(),
        style: "completion".to_string(),
        template: body.to_string(),
        temperature,
        max_tokens,
        top_p,
    }
}

/// The built-in template set, in display order.
pub fn builtin_templates() -> Vec<CompletionTemplate> {
    vec![
        template(
            "a",
            "Convert to Standard English",
            "You will be provided with a statement, and your task is to convert it to standard English.\n\nStatement:\n\n{text}\n\nStandard English:\n",
            Some((0.7, 64, 1.0)),
        ),
        template(
            "b",
            "Summarize for Second-Grade Student",
            "Summarize content you are provided with for a second-grade student.\n\nContent:\n{text}\n\nSummary:\n",
            None,
        ),
        template(
            "c",
            "Convert CSV to Markdown Table",
            "You are an expert in data formatting. For the following csv data, output it as a markdown table.\nOutput the table only.\n```{text}```",
            None,
        ),
        template(
            "d",
            "Parse Unstructured Data",
            "You are a data scientist tasked with parsing unstructured data. Given the following text, output the structured data.\n\n{text}\n\nStructured Data:\n",
            None,
        ),
        template(
            "e",
            "Write a Summary",
            "You are a journalist tasked with writing a summary of the following text.\n\n{text}\n\nSummary:\n",
            None,
        ),
    ]
}

/// Look up a built-in template by id.
pub fn find_template(id: &str) -> Option<CompletionTemplate> {
    builtin_templates().into_iter().find(|t| t.id == id)
}

// ── Tests ────────────────────────────────────────────────────────────────────
