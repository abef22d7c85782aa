//! Telegram Bot API transport.
//!
//! Long polling, not webhooks: no public address or certificate needed.
//!
//! ```text
//! ┌─── poller task ─────────────────────┐
//! │ GET /getUpdates?offset=N&timeout=T  │
//! │         ↓                           │
//! │ one IncomingMessage per text update │──→ mpsc ──→ dispatcher
//! └─────────────────────────────────────┘
//!
//! replies:  POST /sendMessage  (reply_to_message_id, 4096-char chunks)
//! typing:   POST /sendChatAction
//! ```
//!
//! Only `getUpdates`, `getMe`, `sendMessage` and `sendChatAction` are used.
//! Everything the controller needs for sending sits behind `ChatTransport`,
//! and the poller reads through `UpdateSource`, so both sides can be tested
//! without the network.

use crate::bot::config::TelegramSection;
use crate::bot::structured_log::{EventType, LogLevel, StructuredLogger};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Telegram's per-message text limit.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Pause after a failed getUpdates before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(10);

// ── Telegram API types ──────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub text: Option<String>,
    /// Unix timestamp.
    pub date: i64,
    #[serde(default)]
    pub reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl TelegramUser {
    /// "First Last", or just the first name.
    pub fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {last}", self.first_name),
            _ => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

/// Envelope shared by every Bot API response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SentMessage {
    pub message_id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_sending_without_reply: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ChatActionRequest<'a> {
    chat_id: i64,
    action: &'a str,
}

// ── Incoming message ────────────────────────────────────────────

/// A text message flattened for the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    pub text: String,
    pub date: DateTime<Utc>,
    /// Id of the message this one replies to, if any.
    pub reply_to_message_id: Option<i64>,
}

impl IncomingMessage {
    /// `None` for non-text messages and messages sent by bots.
    pub fn from_telegram(msg: TelegramMessage) -> Option<Self> {
        if msg.from.as_ref().is_some_and(|u| u.is_bot) {
            return None;
        }
        let text = msg.text?;
        Some(Self {
            chat_id: msg.chat.id,
            message_id: msg.message_id,
            sender_id: msg.from.as_ref().map(|u| u.id),
            sender_name: msg.from.as_ref().map(TelegramUser::display_name),
            text,
            date: DateTime::from_timestamp(msg.date, 0).unwrap_or_else(Utc::now),
            reply_to_message_id: msg.reply_to_message.map(|r| r.message_id),
        })
    }
}

// ── Commands ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// `/mint <text>`, the text may be empty.
    Mint(String),
    ReloadUsers,
    Id,
}

/// Parse a bot command.
///
/// Accepts `/cmd` and `/cmd@bot_username`. A command addressed to a
/// different bot is not ours and yields `None`.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<BotCommand> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix('/')?;
    let (head, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };

    let name = match head.split_once('@') {
        Some((name, target)) => {
            let ours = bot_username
                .map(|u| u.trim_start_matches('@').eq_ignore_ascii_case(target))
                .unwrap_or(false);
            if !ours {
                return None;
            }
            name
        }
        None => head,
    };

    match name.to_ascii_lowercase().as_str() {
        "mint" => Some(BotCommand::Mint(args.to_string())),
        "reloadusers" => Some(BotCommand::ReloadUsers),
        "id" => Some(BotCommand::Id),
        _ => None,
    }
}

// ── Transport trait ─────────────────────────────────────────────

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send `text`, split as needed, optionally as a reply. Returns the
    /// id of every message sent, in order.
    async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i64>)
        -> Result<Vec<i64>>;

    /// Show the "typing…" indicator.
    async fn send_typing(&self, chat_id: i64) -> Result<()>;
}

/// Where the poller gets updates from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// `offset` acknowledges every update below it.
    async fn get_updates(&self, offset: Option<i64>, timeout: u64) -> Result<Vec<TelegramUpdate>>;
}

// ── Telegram API client ─────────────────────────────────────────

pub struct TelegramApi {
    client: Client,
    base_url: String,
}

impl TelegramApi {
    pub fn new(config: &TelegramSection) -> Result<Self> {
        // Long polls must not hit the client timeout.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.long_poll_timeout_secs + 15))
            .build()
            .context("Failed to build HTTP client for Telegram API")?;

        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{}", config.bot_token),
        })
    }

    async fn call<B: Serialize + ?Sized, T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send {method} request"))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read {method} response"))?;

        let parsed: ApiResponse<T> = serde_json::from_str(&text).with_context(|| {
            format!("Telegram {method} returned HTTP {status} with unparseable body: {text}")
        })?;

        if !parsed.ok {
            anyhow::bail!(
                "Telegram {method} returned ok=false (HTTP {status}): {}",
                parsed.description.unwrap_or_default()
            );
        }
        parsed
            .result
            .with_context(|| format!("Telegram {method} returned no result"))
    }

    /// The bot's own username, used to recognise `/cmd@username`.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        self.call("getMe", &serde_json::json!({})).await
    }

}

#[async_trait]
impl UpdateSource for TelegramApi {
    async fn get_updates(&self, offset: Option<i64>, timeout: u64) -> Result<Vec<TelegramUpdate>> {
        let mut body = serde_json::json!({
            "timeout": timeout,
            "allowed_updates": ["message"],
        });
        if let Some(off) = offset {
            body["offset"] = off.into();
        }
        self.call("getUpdates", &body).await
    }
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        for (i, chunk) in split_message(text, MAX_MESSAGE_LEN).iter().enumerate() {
            // Only the first chunk is a reply; the rest follow it.
            let reply = if i == 0 { reply_to } else { None };
            let body = SendMessageRequest {
                chat_id,
                text: chunk,
                reply_to_message_id: reply,
                allow_sending_without_reply: reply.map(|_| true),
            };
            let sent: SentMessage = self.call("sendMessage", &body).await?;
            ids.push(sent.message_id);
        }
        Ok(ids)
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let body = ChatActionRequest {
            chat_id,
            action: "typing",
        };
        let _: bool = self.call("sendChatAction", &body).await?;
        Ok(())
    }
}

// ── Poller ──────────────────────────────────────────────────────

/// Poll getUpdates until shutdown, forwarding text messages to `tx`.
pub async fn run_poller(
    api: Arc<dyn UpdateSource>,
    config: TelegramSection,
    tx: mpsc::Sender<IncomingMessage>,
    mut shutdown: watch::Receiver<bool>,
    logger: StructuredLogger,
) {
    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let mut offset: Option<i64> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let result = tokio::select! {
            r = api.get_updates(offset, config.long_poll_timeout_secs) => r,
            _ = shutdown.changed() => break,
        };

        match result {
            Ok(updates) => {
                for update in updates {
                    offset = Some(update.update_id + 1);
                    let Some(msg) = update.message.and_then(IncomingMessage::from_telegram) else {
                        continue;
                    };
                    logger.log(
                        &logger
                            .event(EventType::Update, LogLevel::Debug)
                            .with_chat(msg.chat_id)
                            .with_detail(&format!("message {}", msg.message_id)),
                    );
                    if tx.send(msg).await.is_err() {
                        logger.warn(EventType::Lifecycle, "update channel closed, stopping poller");
                        return;
                    }
                }
            }
            Err(e) => {
                logger.warn(EventType::Update, &format!("getUpdates error: {e:#}"));
                tokio::select! {
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    logger.debug(EventType::Lifecycle, "poller stopped");
}

// ── Utility functions ───────────────────────────────────────────

/// Split text into chunks of at most `max_len` characters.
///
/// Prefers the last newline before the limit; otherwise cuts at the
/// limit. Never splits inside a UTF-8 character.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        let limit = match remaining.char_indices().nth(max_len) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };

        let split_at = remaining[..limit]
            .rfind('\n')
            .map(|pos| pos + 1)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
        if remaining.is_empty() {
            break;
        }
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────
