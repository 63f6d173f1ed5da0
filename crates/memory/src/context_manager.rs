use crate::compactor::{extractive_summary, select_block, CompressionOutcome, Summarizer};
use crate::tokens::{estimate_message, estimate_messages};
use crate::types::{Message, MessageDraft, MessageId, Role};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CLEARED_TOOL_OUTPUT: &str = "[Old tool result content cleared]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Model context window in tokens.
    pub context_window: usize,
    /// Fraction of the window at which compression kicks in.
    pub compression_threshold: f64,
    /// Most recent messages never touched by compression.
    pub preserve_recent: usize,
    /// Hard cap on live messages.
    pub max_messages: usize,
    /// Recent tool output kept verbatim when old outputs are cleared.
    pub prune_protect_tokens: usize,
    /// Clearing only happens when it frees at least this much.
    pub prune_minimum_tokens: usize,
    /// Summarizer calls running longer than this use the extractive summary.
    pub summary_timeout_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            compression_threshold: 0.8,
            preserve_recent: 6,
            max_messages: 400,
            prune_protect_tokens: 40_000,
            prune_minimum_tokens: 20_000,
            summary_timeout_ms: 60_000,
        }
    }
}

impl ContextConfig {
    pub fn compression_trigger(&self) -> usize {
        (self.context_window as f64 * self.compression_threshold) as usize
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_millis(self.summary_timeout_ms)
    }
}

/// Model-bound view of history produced by [`ContextManager::snapshot_for_model`].
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub messages: Vec<Message>,
    pub compression: Option<CompressionOutcome>,
}

/// Owns the ordered message history of one session.
#[derive(Debug, Clone)]
pub struct ContextManager {
    config: ContextConfig,
    messages: Vec<Message>,
    next_id: MessageId,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            messages: Vec::new(),
            next_id: 1,
        }
    }

    /// Rebuild from persisted messages. `next_id` is raised past any id in use.
    pub fn restore(config: ContextConfig, messages: Vec<Message>, next_id: MessageId) -> Self {
        let floor = messages.last().map_or(1, |m| m.id + 1);
        Self {
            config,
            messages,
            next_id: next_id.max(floor),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn next_id(&self) -> MessageId {
        self.next_id
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn append(&mut self, draft: MessageDraft) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(draft.into_message(id));
        id
    }

    /// Set or replace the leading system message.
    pub fn set_system_prompt(&mut self, prompt: &str) {
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = prompt.to_string(),
            _ => {
                let id = self.next_id;
                self.next_id += 1;
                self.messages.insert(0, MessageDraft::system(prompt).into_message(id));
                // Ids must stay increasing in history order.
                self.renumber();
            }
        }
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_messages(&self.messages)
    }

    pub fn needs_compression(&self) -> bool {
        self.estimated_tokens() > self.config.compression_trigger()
    }

    /// History as it should be sent to the model, at most `budget` tokens.
    ///
    /// Compresses and enforces the message cap first when needed, then keeps
    /// the system message plus the longest suffix of history that fits.
    pub async fn snapshot_for_model(
        &mut self,
        budget: usize,
        summarizer: &dyn Summarizer,
    ) -> Snapshot {
        let mut compression = None;
        if self.needs_compression() {
            let cleared = self.prune_tool_outputs(
                self.config.prune_protect_tokens,
                self.config.prune_minimum_tokens,
            );
            if cleared > 0 {
                debug!("Cleared {} old tool outputs", cleared);
            }
            if self.needs_compression() {
                compression = self.compress(summarizer).await;
            }
        }
        self.enforce_max_messages();
        Snapshot {
            messages: self.fit_to_budget(budget),
            compression,
        }
    }

    pub(crate) fn fit_to_budget(&self, budget: usize) -> Vec<Message> {
        let (head, rest) = match self.messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(first), rest),
            _ => (None, self.messages.as_slice()),
        };

        let mut used = 0;
        let mut snapshot = Vec::new();
        if let Some(system) = head {
            let cost = estimate_message(system);
            if cost <= budget {
                used = cost;
                snapshot.push(system.clone());
            } else {
                warn!("System message alone exceeds budget of {} tokens", budget);
            }
        }

        let mut start = rest.len();
        for (idx, message) in rest.iter().enumerate().rev() {
            let cost = estimate_message(message);
            if used + cost > budget {
                break;
            }
            used += cost;
            start = idx;
        }
        // A tool result whose call fell outside the window is useless to the model.
        while start < rest.len() && rest[start].role == Role::Tool {
            start += 1;
        }

        snapshot.extend_from_slice(&rest[start..]);
        snapshot
    }

    /// Replace the oldest eligible block with a single summary message.
    /// Returns `None` when nothing is eligible, which makes repeated calls no-ops.
    pub async fn compress(&mut self, summarizer: &dyn Summarizer) -> Option<CompressionOutcome> {
        let range = select_block(&self.messages, self.config.preserve_recent)?;
        let tokens_before = self.estimated_tokens();
        let block = &self.messages[range.clone()];

        let limit = self.config.summary_timeout();
        let (summary, used_fallback) =
            match tokio::time::timeout(limit, summarizer.summarize(block)).await {
                Ok(Ok(text)) if !text.trim().is_empty() => (text, false),
                Ok(Ok(_)) => {
                    warn!("Summarizer returned empty text, using extractive summary");
                    (extractive_summary(block), true)
                }
                Ok(Err(e)) => {
                    warn!("Summarizer failed ({}), using extractive summary", e);
                    (extractive_summary(block), true)
                }
                Err(_) => {
                    warn!("Summarizer timed out after {:?}, using extractive summary", limit);
                    (extractive_summary(block), true)
                }
            };

        let replaced = block.len();
        // The summary takes the id of the first message it replaces so ids stay ordered.
        let summary_message = MessageDraft::new(Role::Compressed, summary)
            .with_metadata(json!({
                "compacted": true,
                "original_count": replaced,
                "fallback": used_fallback
            }))
            .into_message(block[0].id);

        self.messages.splice(range, std::iter::once(summary_message));

        let outcome = CompressionOutcome {
            replaced,
            tokens_before,
            tokens_after: self.estimated_tokens(),
            used_fallback,
        };
        info!(
            "Compressed {} messages ({} -> {} tokens)",
            outcome.replaced, outcome.tokens_before, outcome.tokens_after
        );
        Some(outcome)
    }

    /// Drop the oldest non-system messages until the cap holds. A tool-call
    /// message and its results always leave together.
    pub fn enforce_max_messages(&mut self) -> usize {
        let len = self.messages.len();
        if len <= self.config.max_messages {
            return 0;
        }

        let start = usize::from(self.messages[0].role == Role::System);
        let mut cut = (start + (len - self.config.max_messages)).min(len);
        while cut < len && self.messages[cut].role == Role::Tool {
            cut += 1;
        }

        self.messages.drain(start..cut);
        let removed = cut - start;
        info!("Pruned {} messages to respect cap of {}", removed, self.config.max_messages);
        removed
    }

    /// Blank out old tool outputs beyond the most recent `protect_tokens`
    /// worth, if that frees at least `minimum_tokens`. Returns how many
    /// messages were cleared.
    pub fn prune_tool_outputs(&mut self, protect_tokens: usize, minimum_tokens: usize) -> usize {
        let mut seen = 0;
        let mut candidates = Vec::new();
        let mut reclaimable = 0;

        for (idx, message) in self.messages.iter().enumerate().rev() {
            if message.role != Role::Tool || message.content == CLEARED_TOOL_OUTPUT {
                continue;
            }
            let cost = estimate_message(message);
            if seen + cost <= protect_tokens {
                seen += cost;
                continue;
            }
            seen = protect_tokens;
            reclaimable += cost;
            candidates.push(idx);
        }

        if candidates.is_empty() || reclaimable < minimum_tokens {
            return 0;
        }

        for idx in &candidates {
            let old = &self.messages[*idx];
            let mut metadata = old.metadata.clone().unwrap_or_else(|| json!({}));
            if let Some(obj) = metadata.as_object_mut() {
                obj.insert("pruned".to_string(), json!(true));
            }
            let replacement = Message {
                content: CLEARED_TOOL_OUTPUT.to_string(),
                metadata: Some(metadata),
                ..old.clone()
            };
            self.messages[*idx] = replacement;
        }
        candidates.len()
    }

    fn renumber(&mut self) {
        for (i, message) in self.messages.iter_mut().enumerate() {
            message.id = i as MessageId + 1;
        }
        self.next_id = self.messages.len() as MessageId + 1;
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}
