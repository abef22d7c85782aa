//! History budgeting for prompts.
//!
//! Thread history is bounded twice before it reaches the backend: by
//! message count and by an estimated token total. The estimate is the
//! usual chars/4 heuristic; it only has to keep us comfortably inside the
//! model's window, not match the provider's tokenizer.
//!
//! The system prompt is charged against the token budget up front, so a
//! long prompt leaves less room for history. Oldest messages go first,
//! and the newest message is always kept even when it alone is over
//! budget; the backend rejects that case with a clearer error than an
//! empty prompt would.

use crate::bot::threads::ThreadMessage;

/// Per-message structural overhead (role tag, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Approximate token count using the chars/4 heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars / 4).max(1)
    }
}

pub fn estimate_message_tokens(message: &ThreadMessage) -> usize {
    MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&message.text)
}

/// Limits applied when a thread is turned into prompt history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryBudget {
    pub max_messages: usize,
    pub max_tokens: usize,
    /// Tokens already spent before any history, normally the system prompt.
    pub reserved_tokens: usize,
}

impl HistoryBudget {
    pub fn new(max_messages: usize, max_tokens: usize) -> Self {
        Self {
            max_messages,
            max_tokens,
            reserved_tokens: 0,
        }
    }

    /// Charge `text` (typically the system prompt) against the budget.
    pub fn with_reserved(mut self, text: &str) -> Self {
        self.reserved_tokens = estimate_tokens(text) + MESSAGE_OVERHEAD_TOKENS;
        self
    }

    /// Tokens left for history after the reservation.
    pub fn available_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserved_tokens)
    }

    /// Return the newest suffix of `messages` that fits the budget.
    ///
    /// Order is preserved. A non-empty input always yields at least its
    /// last message.
    pub fn truncate(&self, messages: &[ThreadMessage]) -> Vec<ThreadMessage> {
        let Some(last) = messages.last() else {
            return Vec::new();
        };

        let available = self.available_tokens();
        let max_messages = self.max_messages.max(1);
        let mut used = estimate_message_tokens(last);
        let mut start = messages.len() - 1;

        while start > 0 && messages.len() - start < max_messages {
            let cost = estimate_message_tokens(&messages[start - 1]);
            if used + cost > available {
                break;
            }
            used += cost;
            start -= 1;
        }

        messages[start..].to_vec()
    }
}
