//! Configuration loading.
//!
//! Everything lives in one TOML file, found via `APP_CONFIG_PATH`, the
//! first command-line argument, or `./config.toml`:
//!
//! ```toml
//! [telegram]
//! bot_token = "123456:ABC-DEF..."   # or TELEGRAM_BOT_TOKEN
//! poll_interval_secs = 1
//! long_poll_timeout_secs = 30
//!
//! [backend]
//! api_url = "https://api.openai.com/v1"
//! api_key = "sk-..."                # or OPENAI_API_KEY
//! model = "gpt-4o-mini"
//! temperature = 0.7
//! max_response_tokens = 1000
//! max_attempts = 3
//!
//! [conversation]
//! context_window_tokens = 8192
//! max_history_messages = 40
//! expiry_days = 3
//!
//! [users]
//! known_users_path = "known_users.yaml"
//!
//! [bot]
//! allowed_chat_ids = [-1001234567890]
//! enable_console_interface = false
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Any failure here is `ConfigInvalid` and stops startup.

use crate::bot::error::BotError;
use crate::bot::structured_log::LoggingConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "APP_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

// ── Sections ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramSection {
    #[serde(default)]
    pub bot_token: String,
    /// Pause between getUpdates calls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// `timeout` passed to getUpdates.
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    1
}

fn default_long_poll_timeout() -> u64 {
    30
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            poll_interval_secs: default_poll_interval(),
            long_poll_timeout_secs: default_long_poll_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Passed through as `reasoning_effort` when set.
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Total attempts per completion, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_response_tokens() -> u32 {
    1000
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            reasoning_effort: None,
            max_response_tokens: default_max_response_tokens(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSection {
    /// Token budget for system prompt plus history.
    #[serde(default = "default_context_window")]
    pub context_window_tokens: usize,
    /// Message cap applied on top of the token budget.
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    /// Inactivity window after which a thread is forgotten.
    #[serde(default = "default_expiry_days")]
    pub expiry_days: u64,
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_secs: u64,
    /// Where thread snapshots are kept across restarts.
    #[serde(default = "default_history_path")]
    pub history_path: String,
}

fn default_context_window() -> usize {
    8192
}

fn default_max_history_messages() -> usize {
    40
}

fn default_expiry_days() -> u64 {
    3
}

fn default_eviction_interval() -> u64 {
    3600
}

fn default_history_path() -> String {
    "chat_histories.json".to_string()
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            context_window_tokens: default_context_window(),
            max_history_messages: default_max_history_messages(),
            expiry_days: default_expiry_days(),
            eviction_interval_secs: default_eviction_interval(),
            history_path: default_history_path(),
        }
    }
}

/// Upper bound for `expiry_days` (100 years).
pub const MAX_EXPIRY_DAYS: u64 = 36_500;

impl ConversationSection {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.expiry_days.min(MAX_EXPIRY_DAYS) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsersSection {
    #[serde(default = "default_known_users_path")]
    pub known_users_path: String,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

fn default_known_users_path() -> String {
    "known_users.yaml".to_string()
}

fn default_flush_interval() -> u64 {
    300
}

impl Default for UsersSection {
    fn default() -> Self {
        Self {
            known_users_path: default_known_users_path(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotSection {
    /// Chats the bot answers in. Empty means none.
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(default)]
    pub enable_console_interface: bool,
    #[serde(default = "default_system_prompt_path")]
    pub system_prompt_path: String,
    /// How long in-flight handlers may run after shutdown is requested.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_system_prompt_path() -> String {
    "system_prompt.txt".to_string()
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            allowed_chat_ids: Vec::new(),
            enable_console_interface: false,
            system_prompt_path: default_system_prompt_path(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

// ── BotConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub telegram: TelegramSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub users: UsersSection,
    #[serde(default)]
    pub bot: BotSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BotConfig {
    /// Fill empty secrets from `TELEGRAM_BOT_TOKEN` / `OPENAI_API_KEY`,
    /// read through `lookup`.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.telegram.bot_token.is_empty() {
            if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
                self.telegram.bot_token = token;
            }
        }
        if self.backend.api_key.is_empty() {
            if let Some(key) = lookup("OPENAI_API_KEY") {
                self.backend.api_key = key;
            }
        }
    }

    /// Reject values the bot cannot run with.
    pub fn validate(&self) -> Result<(), BotError> {
        let invalid = |msg: &str| Err(BotError::ConfigInvalid(msg.to_string()));

        if self.telegram.bot_token.trim().is_empty() {
            return invalid("telegram.bot_token is missing (or set TELEGRAM_BOT_TOKEN)");
        }
        if self.backend.api_url.trim().is_empty() {
            return invalid("backend.api_url must not be empty");
        }
        if self.backend.model.trim().is_empty() {
            return invalid("backend.model must not be empty");
        }
        if !(0.0..=2.0).contains(&self.backend.temperature) {
            return invalid("backend.temperature must be between 0.0 and 2.0");
        }
        if self.backend.max_attempts == 0 {
            return invalid("backend.max_attempts must be at least 1");
        }
        if self.backend.request_timeout_secs == 0 {
            return invalid("backend.request_timeout_secs must be positive");
        }
        if self.conversation.context_window_tokens == 0 {
            return invalid("conversation.context_window_tokens must be positive");
        }
        if self.conversation.max_history_messages == 0 {
            return invalid("conversation.max_history_messages must be positive");
        }
        if !(1..=MAX_EXPIRY_DAYS).contains(&self.conversation.expiry_days) {
            return invalid("conversation.expiry_days must be between 1 and 36500");
        }
        if self.conversation.eviction_interval_secs == 0 {
            return invalid("conversation.eviction_interval_secs must be positive");
        }
        if self.users.flush_interval_secs == 0 {
            return invalid("users.flush_interval_secs must be positive");
        }
        if self.backend.api_key.is_empty() {
            // Local backends often run without a key.
            eprintln!("[mintbot] Warning: backend.api_key is empty");
        }
        if self.bot.allowed_chat_ids.is_empty() {
            eprintln!(
                "[mintbot] Warning: bot.allowed_chat_ids is empty, every chat will be rejected"
            );
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.bot.shutdown_grace_secs)
    }
}

/// Parse and validate a config from TOML text. Environment fallbacks
/// are applied before validation.
pub fn parse_config(toml_str: &str) -> Result<BotConfig, BotError> {
    parse_config_with_env(toml_str, |name| std::env::var(name).ok())
}

pub fn parse_config_with_env(
    toml_str: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<BotConfig, BotError> {
    let mut config: BotConfig = toml::from_str(toml_str)
        .map_err(|e| BotError::ConfigInvalid(format!("failed to parse TOML: {e}")))?;
    config.apply_overrides_from(lookup);
    config.validate()?;
    Ok(config)
}

/// Resolve the config path: env var, then the first CLI argument, then
/// the default.
pub fn resolve_config_path(cli_arg: Option<String>) -> PathBuf {
    choose_config_path(std::env::var(CONFIG_ENV_VAR).ok(), cli_arg)
}

fn choose_config_path(env_value: Option<String>, cli_arg: Option<String>) -> PathBuf {
    env_value
        .filter(|p| !p.is_empty())
        .or(cli_arg)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub async fn load_config(path: &Path) -> Result<BotConfig, BotError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        BotError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_config(&content)
}

/// Read the system prompt, falling back to a generic one when the file
/// is missing or empty.
pub async fn load_system_prompt(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => DEFAULT_SYSTEM_PROMPT.to_string(),
        Err(e) => {
            eprintln!(
                "[mintbot] Warning: system prompt {} not readable ({e}), using default",
                path.display()
            );
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
