//! History compression: block selection, summarization and the
//! deterministic fallback used when the summarizer fails.

use crate::types::{Message, Role};
use async_trait::async_trait;
use std::ops::Range;
use thiserror::Error;

const TOOL_OUTPUT_LIMIT: usize = 2000;
const ASSISTANT_TEXT_LIMIT: usize = 3000;
const USER_TEXT_LIMIT: usize = 1500;
const ARGUMENTS_LIMIT: usize = 500;
const EXTRACT_LINE_LIMIT: usize = 160;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("Summarizer failed: {0}")]
    Failed(String),
    #[error("Summarizer returned an empty summary")]
    Empty,
}

/// Produces a summary of a block of older messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummaryError>;
}

/// What one compression pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionOutcome {
    pub replaced: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub used_fallback: bool,
}

/// Index range eligible for compression, if any.
///
/// The block starts after the leading system message and after the newest
/// existing summary, ends before the last `preserve_recent` messages, and
/// never ends between an assistant tool-call message and its results.
pub(crate) fn select_block(messages: &[Message], preserve_recent: usize) -> Option<Range<usize>> {
    let mut end = messages.len().saturating_sub(preserve_recent);
    while end > 0 && end < messages.len() && messages[end].role == Role::Tool {
        end -= 1;
    }

    let mut start = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
    if let Some(last_summary) = messages[..end].iter().rposition(Message::is_summary) {
        start = start.max(last_summary + 1);
    }

    (end >= start + 2).then_some(start..end)
}

/// Deterministic summary built from the messages themselves.
pub fn extractive_summary(messages: &[Message]) -> String {
    let mut summary = format!("Summary of {} earlier messages:\n", messages.len());
    for message in messages {
        let label = match message.role {
            Role::Tool => match message.tool_status {
                Some(status) => format!("tool ({:?})", status).to_lowercase(),
                None => "tool".to_string(),
            },
            Role::User => "user".to_string(),
            Role::Assistant => "assistant".to_string(),
            Role::System => "system".to_string(),
            Role::Compressed => "summary".to_string(),
        };
        let first_line = message.content.lines().next().unwrap_or_default();
        let mut line = format!("- {}:", label);
        if !first_line.is_empty() {
            line.push(' ');
            line.push_str(&truncate(first_line, EXTRACT_LINE_LIMIT));
        }
        for call in &message.tool_calls {
            line.push_str(&format!(
                " [called {}({})]",
                call.name,
                truncate(&call.arguments.to_string(), EXTRACT_LINE_LIMIT)
            ));
        }
        summary.push_str(line.trim_end());
        summary.push('\n');
    }
    summary
}

/// Transcript handed to a model-backed summarizer.
pub fn format_transcript(messages: &[Message]) -> String {
    let mut sections = vec!["Here is the conversation that needs to be continued:".to_string()];

    for message in messages {
        match message.role {
            Role::System => {}
            Role::Tool => {
                let id = message.tool_result_ref.as_deref().unwrap_or("unknown");
                sections.push(format!(
                    "[Tool Result ({})]:\n{}",
                    id,
                    truncate_marked(&message.content, TOOL_OUTPUT_LIMIT, "tool output")
                ));
            }
            Role::Assistant => {
                if !message.content.is_empty() {
                    sections.push(format!(
                        "Assistant:\n{}",
                        truncate_marked(&message.content, ASSISTANT_TEXT_LIMIT, "response")
                    ));
                }
                if message.has_tool_calls() {
                    let calls: Vec<String> = message
                        .tool_calls
                        .iter()
                        .map(|c| {
                            format!("  - {}({})", c.name, truncate(&c.arguments.to_string(), ARGUMENTS_LIMIT))
                        })
                        .collect();
                    sections.push(format!("Assistant called tools:\n{}", calls.join("\n")));
                }
            }
            Role::Compressed => {
                sections.push(format!("Earlier summary:\n{}", message.content));
            }
            Role::User => {
                sections.push(format!(
                    "User:\n{}",
                    truncate_marked(&message.content, USER_TEXT_LIMIT, "message")
                ));
            }
        }
    }

    sections.join("\n\n---\n\n")
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(limit).collect();
    cut.push_str("...");
    cut
}

fn truncate_marked(text: &str, limit: usize, what: &str) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}\n... [{} truncated]", cut, what)
}
