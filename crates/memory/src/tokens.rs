//! Length-based token estimates.

use crate::types::Message;

pub const CHARS_PER_TOKEN: usize = 4;

/// Fixed cost of role markers and framing per message.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

pub fn estimate_text(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub fn estimate_message(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|call| estimate_text(&call.name) + estimate_text(&call.arguments.to_string()))
        .sum();
    MESSAGE_OVERHEAD_TOKENS + estimate_text(&message.content) + calls
}

pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message).sum()
}
