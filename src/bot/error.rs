//! Error taxonomy for the bot.
//!
//! | Variant              | Where it comes from          | Handling                          |
//! |----------------------|------------------------------|-----------------------------------|
//! | `ConfigInvalid`      | config load / validation     | fatal at startup                  |
//! | `ChatNotAllowed`     | allow-list check             | logged, update dropped            |
//! | `BackendUnavailable` | network, 5xx, auth failures  | fallback text (auth not retried)  |
//! | `RateLimited`        | HTTP 429                     | bounded retry, then fallback text |
//! | `InvalidResponse`    | unparseable / empty replies  | fallback text, no retry           |
//! | `StoreCorrupt`       | one bad known-users entry    | entry skipped, rest still loads   |
//!
//! Transport and filesystem glue use `anyhow` instead; this enum only
//! names the failures callers branch on.

use thiserror::Error;

/// Message sent to the chat when a reply could not be generated.
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't get a response from the AI right now. Please try again later.";

#[derive(Debug, Error)]
pub enum BotError {
    /// Configuration is missing or out of range. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The chat is not on the allow-list.
    #[error("chat {0} is not on the allow-list")]
    ChatNotAllowed(i64),

    /// The backend could not be reached or refused to serve the request.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend asked us to slow down.
    #[error("backend rate limited{}", retry_hint(*.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    /// The backend answered but the answer was unusable.
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    /// A single persisted record could not be parsed.
    #[error("corrupt store entry {entry}: {reason}")]
    StoreCorrupt { entry: String, reason: String },
}

fn retry_hint(secs: Option<u64>) -> String {
    match secs {
        Some(s) => format!(" (retry after {s}s)"),
        None => String::new(),
    }
}

impl BotError {
    /// Short label for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            BotError::ConfigInvalid(_) => "config_invalid",
            BotError::ChatNotAllowed(_) => "chat_not_allowed",
            BotError::BackendUnavailable(_) => "backend_unavailable",
            BotError::RateLimited { .. } => "rate_limited",
            BotError::InvalidResponse(_) => "invalid_response",
            BotError::StoreCorrupt { .. } => "store_corrupt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display_includes_hint() {
        let err = BotError::RateLimited { retry_after_secs: Some(7) };
        assert_eq!(err.to_string(), "backend rate limited (retry after 7s)");

        let err = BotError::RateLimited { retry_after_secs: None };
        assert_eq!(err.to_string(), "backend rate limited");
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(BotError::ChatNotAllowed(5).kind(), "chat_not_allowed");
        assert_eq!(
            BotError::StoreCorrupt { entry: "x".into(), reason: "y".into() }.kind(),
            "store_corrupt"
        );
    }
}
