//! OpenAI-compatible chat-completion client.
//!
//! `CompletionBackend` is the seam the generator talks to; `OpenAiBackend`
//! implements it over `POST {api_url}/chat/completions` with a bearer key.
//! Any server speaking that dialect works (OpenAI, OpenRouter, llama.cpp,
//! vLLM, Ollama's compatibility endpoint).
//!
//! ## Error classification
//!
//! | Failure            | Class         | Becomes                          |
//! |--------------------|---------------|----------------------------------|
//! | 429                | RateLimited   | `RateLimited`, retried           |
//! | 500, 502, 503, 529 | Transient     | `BackendUnavailable`, retried    |
//! | Connection/timeout | Transient     | `BackendUnavailable`, retried    |
//! | 401, 403           | AuthFailure   | `BackendUnavailable`, not retried|
//! | Other 4xx          | Rejected      | `InvalidResponse`, not retried   |
//! | Unparseable body   | Malformed     | `InvalidResponse`, not retried   |

use crate::bot::config::BackendSection;
use crate::bot::error::BotError;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_tool_type() -> String {
    "function".to_string()
}

/// One entry of the `messages` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Serialised as `null` for assistant tool-call messages, which the
    /// API requires to be present.
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: Option<String>) -> Self {
        Self {
            role: role.to_string(),
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", Some(content.into()))
    }

    /// The assistant turn that requested `calls`.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::with_role("assistant", content)
        }
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            name: Some(call.function.name.clone()),
            ..Self::with_role("tool", Some(content.into()))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl CompletionRequest {
    /// Request carrying the configured model parameters and no tools.
    pub fn new(config: &BackendSection, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: config.model.clone(),
            messages,
            temperature: config.temperature,
            max_tokens: config.max_response_tokens,
            reasoning_effort: config.reasoning_effort.clone(),
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        if !tools.is_empty() {
            self.tool_choice = Some("auto".to_string());
        }
        self.tools = tools;
        self
    }
}

/// The first choice of a completion response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    /// Trimmed content, or `None` when there is nothing to show.
    pub fn visible_text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

/// Parse a `/chat/completions` response body.
pub fn parse_completion(body: &str) -> Result<Completion, ApiError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ApiError::malformed(format!("unparseable completion: {e}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::malformed("completion has no choices"))?;
    Ok(Completion {
        content: choice.message.content,
        tool_calls: choice.message.tool_calls,
        finish_reason: choice.finish_reason,
    })
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Transient,
    AuthFailure,
    Rejected,
    Malformed,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::RateLimited | ErrorClass::Transient)
    }
}

/// A failed backend call with enough detail to decide on a retry.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status_code: Option<u16>,
    pub message: String,
    /// No HTTP response at all (DNS, connect, timeout).
    pub is_connection_error: bool,
    /// Body arrived but could not be understood.
    pub is_malformed: bool,
    /// Seconds from a `Retry-After` header.
    pub retry_after_secs: Option<u64>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.status_code {
            write!(f, "HTTP {code}: {}", self.message)
        } else if self.is_connection_error {
            write!(f, "connection error: {}", self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl ApiError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(code),
            message: message.into(),
            is_connection_error: false,
            is_malformed: false,
            retry_after_secs: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: message.into(),
            is_connection_error: true,
            is_malformed: false,
            retry_after_secs: None,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            message: message.into(),
            is_connection_error: false,
            is_malformed: true,
            retry_after_secs: None,
        }
    }

    pub fn with_retry_after(mut self, secs: Option<u64>) -> Self {
        self.retry_after_secs = secs;
        self
    }

    pub fn classify(&self) -> ErrorClass {
        if self.is_malformed {
            return ErrorClass::Malformed;
        }
        match self.status_code {
            Some(429) => ErrorClass::RateLimited,
            Some(401 | 403) => ErrorClass::AuthFailure,
            Some(500 | 502 | 503 | 504 | 529) => ErrorClass::Transient,
            Some(code) if code >= 500 => ErrorClass::Transient,
            Some(_) => ErrorClass::Rejected,
            None if self.is_connection_error => ErrorClass::Transient,
            None => ErrorClass::Malformed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify().is_retryable()
    }

    /// Short label for log lines.
    pub fn short_reason(&self) -> String {
        match self.status_code {
            Some(code) => {
                let label = match code {
                    429 => "Rate Limited",
                    500 => "Internal Server Error",
                    502 => "Bad Gateway",
                    503 => "Service Unavailable",
                    504 => "Gateway Timeout",
                    529 => "Overloaded",
                    401 => "Unauthorized",
                    403 => "Forbidden",
                    _ => "HTTP Error",
                };
                format!("{code} {label}")
            }
            None if self.is_connection_error => "Connection Error".to_string(),
            None => "Malformed Response".to_string(),
        }
    }
}

impl From<ApiError> for BotError {
    fn from(err: ApiError) -> Self {
        match err.classify() {
            ErrorClass::RateLimited => BotError::RateLimited {
                retry_after_secs: err.retry_after_secs,
            },
            ErrorClass::Transient | ErrorClass::AuthFailure => {
                BotError::BackendUnavailable(err.to_string())
            }
            ErrorClass::Rejected | ErrorClass::Malformed => {
                BotError::InvalidResponse(err.to_string())
            }
        }
    }
}

// ── Backend trait ────────────────────────────────────────────────

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// One request, no retries.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ApiError>;
}

pub struct OpenAiBackend {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(config: &BackendSection) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client for completion backend")?;

        Ok(Self {
            client,
            endpoint: completions_url(&config.api_url),
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn completions_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ApiError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::connection(e.to_string()))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::connection(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(ApiError::status(status.as_u16(), error_message(&body))
                .with_retry_after(retry_after));
        }

        parse_completion(&body)
    }
}

/// Pull `error.message` out of an error body, or fall back to the body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect())
}

// ── Retry policy ─────────────────────────────────────────────────

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BackendSection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            ..Default::default()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based). A server-provided delay wins over the exponential one;
    /// both are capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let delay = match retry_after_secs {
            Some(secs) => Duration::from_secs(secs),
            None => {
                let exp = attempt.saturating_sub(1).min(16);
                self.base_delay.saturating_mul(1u32 << exp)
            }
        };
        delay.min(self.max_delay)
    }
}

// ── Tests ────────────────────────────────────────────────────────
