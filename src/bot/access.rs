//! Chat allow-list.
//!
//! Fail-closed: an empty list admits nobody.

use crate::bot::error::BotError;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: BTreeSet<i64>,
}

impl AccessPolicy {
    pub fn new(allowed_chat_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            allowed: allowed_chat_ids.into_iter().collect(),
        }
    }

    pub fn is_allowed(&self, chat_id: i64) -> bool {
        self.allowed.contains(&chat_id)
    }

    pub fn check(&self, chat_id: i64) -> Result<(), BotError> {
        if self.is_allowed(chat_id) {
            Ok(())
        } else {
            Err(BotError::ChatNotAllowed(chat_id))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn allowed_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.allowed.iter().copied()
    }
}
