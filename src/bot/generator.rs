//! Prompt assembly and the completion round trip.
//!
//! The system message is the operator's prompt followed by a
//! `<known_users>` block, a line about the current sender and a short
//! note on how user ids appear in messages. History follows in thread
//! order; the newest user message is prefixed with `[User ID: N]` and,
//! for replies, with a quote of the message being replied to.
//!
//! Backend failures are retried with bounded backoff. When the model
//! asks for tools they are executed, their results appended, and, if the
//! model produced no text alongside, one more completion is requested
//! without tools to get the actual reply.

use crate::bot::backend::{
    ApiError, ChatMessage, Completion, CompletionBackend, CompletionRequest, RetryPolicy,
};
use crate::bot::config::BackendSection;
use crate::bot::error::BotError;
use crate::bot::structured_log::{
    truncate_chars, EventType, LogEvent, LogLevel, StructuredLogger,
};
use crate::bot::threads::{Role, ThreadKey, ThreadMessage};
use crate::bot::users::UserProfile;
use crate::tools::ToolRegistry;
use std::sync::Arc;
use std::time::Instant;

/// Characters of the replied-to message quoted in the prompt.
pub const REPLY_QUOTE_CHARS: usize = 150;

const ID_INSTRUCTIONS: &str = "When a user messages, their ID might be prepended to their \
message like '[User ID: 12345]'. Use this to identify them.\n\
You can use tools to update user profiles.\n\n\
If a user is replying to a specific previous message, that context will also be provided.";

/// Everything the generator needs for one reply. Built by the controller
/// from snapshots taken under the registry and store locks.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    pub chat_id: i64,
    pub thread: Option<ThreadKey>,
    /// Bounded history, oldest first, ending with the message to answer.
    pub history: Vec<ThreadMessage>,
    pub sender_id: Option<i64>,
    pub sender_profile: Option<UserProfile>,
    /// Output of `UserStore::prompt_section`.
    pub known_users: String,
    pub replied_to: Option<ThreadMessage>,
}

pub struct ResponseGenerator {
    backend: Arc<dyn CompletionBackend>,
    tools: Arc<ToolRegistry>,
    config: BackendSection,
    retry: RetryPolicy,
    logger: StructuredLogger,
}

impl ResponseGenerator {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        tools: Arc<ToolRegistry>,
        config: BackendSection,
        logger: StructuredLogger,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            backend,
            tools,
            config,
            retry,
            logger,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Produce the reply text for `ctx`.
    pub async fn generate(
        &self,
        ctx: &GenerationContext,
        system_prompt: &str,
    ) -> Result<String, BotError> {
        let mut messages = build_messages(ctx, system_prompt);

        let request = CompletionRequest::new(&self.config, messages.clone())
            .with_tools(self.tools.definitions());
        let first = self.complete_with_retry(ctx, &request).await?;

        let completion = if first.tool_calls.is_empty() {
            first
        } else {
            messages.push(ChatMessage::assistant_tool_calls(
                first.content.clone(),
                first.tool_calls.clone(),
            ));
            for call in &first.tool_calls {
                let result = self
                    .tools
                    .dispatch(&call.function.name, &call.function.arguments)
                    .await;
                let mut event = self
                    .event(ctx, EventType::ToolCall, LogLevel::Info)
                    .with_detail(&format!(
                        "{} success={}{}",
                        call.function.name,
                        result.success,
                        result
                            .error
                            .as_deref()
                            .map(|e| format!(" error={e}"))
                            .unwrap_or_default()
                    ));
                if !result.success {
                    event.level = LogLevel::Warn;
                }
                self.logger.log(&event);
                messages.push(ChatMessage::tool_result(call, result.to_content()));
            }

            if first.visible_text().is_some() {
                first
            } else {
                let follow_up = CompletionRequest::new(&self.config, messages);
                self.complete_with_retry(ctx, &follow_up).await?
            }
        };

        completion
            .visible_text()
            .map(str::to_string)
            .ok_or_else(|| BotError::InvalidResponse("backend returned an empty reply".into()))
    }

    async fn complete_with_retry(
        &self,
        ctx: &GenerationContext,
        request: &CompletionRequest,
    ) -> Result<Completion, BotError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.logger.log(
                &self
                    .event(ctx, EventType::ApiRequest, LogLevel::Debug)
                    .with_attempt(attempt)
                    .with_detail(&format!(
                        "{} messages, {} tools",
                        request.messages.len(),
                        request.tools.len()
                    )),
            );

            let started = Instant::now();
            let outcome = self.backend.complete(request).await;
            let elapsed = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(completion) => {
                    self.logger.log(
                        &self
                            .event(ctx, EventType::ApiResponse, LogLevel::Info)
                            .with_attempt(attempt)
                            .with_duration_ms(elapsed)
                            .with_detail(&format!(
                                "finish={} tool_calls={}",
                                completion.finish_reason.as_deref().unwrap_or("-"),
                                completion.tool_calls.len()
                            )),
                    );
                    return Ok(completion);
                }
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.retry.max_attempts {
                        self.log_failure(ctx, &err, attempt, elapsed);
                        return Err(err.into());
                    }
                    let delay = self.retry.delay_after(attempt, err.retry_after_secs);
                    self.logger.log_and_stderr(
                        &self
                            .event(ctx, EventType::Retry, LogLevel::Warn)
                            .with_attempt(attempt)
                            .with_duration_ms(elapsed)
                            .with_detail(&format!("{} ({err})", err.short_reason())),
                        &format!(
                            "Warning: backend {} on attempt {attempt}/{}, retrying in {}ms",
                            err.short_reason(),
                            self.retry.max_attempts,
                            delay.as_millis()
                        ),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn log_failure(&self, ctx: &GenerationContext, err: &ApiError, attempt: u32, elapsed: u64) {
        self.logger.log_and_stderr(
            &self
                .event(ctx, EventType::ApiResponse, LogLevel::Error)
                .with_attempt(attempt)
                .with_duration_ms(elapsed)
                .with_detail(&err.to_string()),
            &format!("Error: backend request failed after {attempt} attempt(s): {err}"),
        );
    }

    fn event(&self, ctx: &GenerationContext, event_type: EventType, level: LogLevel) -> LogEvent {
        let mut event = self
            .logger
            .event(event_type, level)
            .with_chat(ctx.chat_id)
            .with_model(&self.config.model);
        if let Some(thread) = ctx.thread {
            event = event.with_thread(thread);
        }
        if let Some(user) = ctx.sender_id {
            event = event.with_user(user);
        }
        event
    }
}

/// Full system message for `ctx`.
pub fn build_system_prompt(ctx: &GenerationContext, system_prompt: &str) -> String {
    let mut prompt = system_prompt.to_string();
    prompt.push_str(&format!("\n\n<known_users>{}\n</known_users>", ctx.known_users));

    if let Some(sender_id) = ctx.sender_id {
        prompt.push_str(&format!("\n\nThe current message is from User ID {sender_id}"));
        if let Some(profile) = &ctx.sender_profile {
            if let Some(name) = profile.name.as_deref().filter(|n| !n.is_empty()) {
                prompt.push_str(&format!(" ({name})"));
            }
            if !profile.description.is_empty() {
                prompt.push_str(&format!(". What you know about them: {}", profile.description));
            }
        }
        prompt.push('.');
    }

    prompt.push_str("\n\n");
    prompt.push_str(ID_INSTRUCTIONS);
    prompt
}

/// The `messages` array for the first request.
pub fn build_messages(ctx: &GenerationContext, system_prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(ctx.history.len() + 1);
    messages.push(ChatMessage::system(build_system_prompt(ctx, system_prompt)));

    let last = ctx.history.len().saturating_sub(1);
    for (i, message) in ctx.history.iter().enumerate() {
        match message.role {
            Role::Assistant => messages.push(ChatMessage::assistant(message.text.clone())),
            Role::User if i == last => messages.push(ChatMessage::user(annotate_current(
                ctx,
                &message.text,
            ))),
            Role::User => messages.push(ChatMessage::user(message.text.clone())),
        }
    }
    messages
}

fn annotate_current(ctx: &GenerationContext, text: &str) -> String {
    let prefix = match ctx.sender_id {
        Some(id) => format!("[User ID: {id}]"),
        None => "[User]".to_string(),
    };
    match &ctx.replied_to {
        Some(replied) => format!(
            "{prefix} [Replying to {}'s message: \"{}\"] {text}",
            replied.role,
            truncate_chars(&replied.text, REPLY_QUOTE_CHARS)
        ),
        None => format!("{prefix} {text}"),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::backend::{FunctionCall, ToolCall};
    use crate::tools::{Tool, ToolExecutionResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Replays scripted outcomes and records every request.
    struct ScriptedBackend {
        script: StdMutex<VecDeque<Result<Completion, ApiError>>>,
        requests: StdMutex<Vec<CompletionRequest>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<Completion, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                requests: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn request(&self, i: usize) -> CompletionRequest {
            self.requests.lock().unwrap()[i].clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::malformed("script exhausted")))
        }
    }

    struct CountingTool {
        calls: Arc<StdMutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "update_user_profile"
        }
        fn description(&self) -> &str {
            "test"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value) -> anyhow::Result<ToolExecutionResult> {
            self.calls.lock().unwrap().push(args);
            Ok(ToolExecutionResult::ok("saved"))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn generator(backend: Arc<ScriptedBackend>, tools: ToolRegistry) -> ResponseGenerator {
        ResponseGenerator::new(
            backend,
            Arc::new(tools),
            BackendSection::default(),
            StructuredLogger::disabled(),
        )
        .with_retry_policy(fast_retry())
    }

    fn ctx(text: &str) -> GenerationContext {
        GenerationContext {
            chat_id: -100,
            history: vec![ThreadMessage::new(Role::User, text, Utc::now()).from_sender(42)],
            sender_id: Some(42),
            known_users: "No specific user information is currently known.".into(),
            ..Default::default()
        }
    }

    fn tool_call(args: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "update_user_profile".into(),
                arguments: args.into(),
            },
        }
    }

    #[test]
    fn system_prompt_includes_users_and_sender() {
        let mut c = ctx("hi");
        c.known_users = "Known users in this chat:\n- User ID 42 (Ann): likes tea\n".into();
        c.sender_profile = Some(UserProfile {
            user_id: 42,
            name: Some("Ann".into()),
            description: "likes tea".into(),
            last_updated: None,
        });
        let prompt = build_system_prompt(&c, "You are Mint.");
        assert!(prompt.starts_with("You are Mint.\n\n<known_users>Known users in this chat:"));
        assert!(prompt.contains("</known_users>"));
        assert!(prompt.contains("The current message is from User ID 42 (Ann). What you know about them: likes tea."));
        assert!(prompt.contains("[User ID: 12345]"));
    }

    #[test]
    fn last_user_message_is_annotated() {
        let now = Utc::now();
        let mut c = ctx("unused");
        c.history = vec![
            ThreadMessage::new(Role::User, "first question", now).from_sender(42),
            ThreadMessage::new(Role::Assistant, "first answer", now),
            ThreadMessage::new(Role::User, "follow up", now).from_sender(42),
        ];
        c.replied_to = Some(ThreadMessage::new(Role::Assistant, "x".repeat(200), now));

        let messages = build_messages(&c, "sys");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content.as_deref(), Some("first question"));
        assert_eq!(messages[2].role, "assistant");
        let last = messages[3].content.as_deref().unwrap();
        let quote = format!("{}...", "x".repeat(150));
        assert_eq!(
            last,
            format!("[User ID: 42] [Replying to assistant's message: \"{quote}\"] follow up")
        );
    }

    #[test]
    fn unknown_sender_gets_generic_prefix() {
        let mut c = ctx("hello");
        c.sender_id = None;
        let messages = build_messages(&c, "sys");
        assert_eq!(messages[1].content.as_deref(), Some("[User] hello"));
    }

    #[tokio::test]
    async fn returns_trimmed_text() {
        let backend = ScriptedBackend::new(vec![Ok(Completion::text("  Hi there \n"))]);
        let gen = generator(backend.clone(), ToolRegistry::new());
        assert_eq!(gen.generate(&ctx("hello"), "sys").await.unwrap(), "Hi there");
        assert_eq!(backend.calls(), 1);
        assert!(backend.request(0).tools.is_empty());
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::status(503, "down")),
            Err(ApiError::connection("reset")),
            Ok(Completion::text("finally")),
        ]);
        let gen = generator(backend.clone(), ToolRegistry::new());
        assert_eq!(gen.generate(&ctx("hello"), "sys").await.unwrap(), "finally");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::status(429, "slow")),
            Err(ApiError::status(429, "slow")),
            Err(ApiError::status(429, "slow").with_retry_after(Some(0))),
            Ok(Completion::text("too late")),
        ]);
        let gen = generator(backend.clone(), ToolRegistry::new());
        let err = gen.generate(&ctx("hello"), "sys").await.unwrap_err();
        assert!(matches!(err, BotError::RateLimited { retry_after_secs: Some(0) }));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn non_retryable_failures_stop_immediately() {
        let backend = ScriptedBackend::new(vec![
            Err(ApiError::status(401, "bad key")),
            Ok(Completion::text("unreachable")),
        ]);
        let gen = generator(backend.clone(), ToolRegistry::new());
        let err = gen.generate(&ctx("hello"), "sys").await.unwrap_err();
        assert!(matches!(err, BotError::BackendUnavailable(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn empty_reply_is_invalid() {
        let backend = ScriptedBackend::new(vec![Ok(Completion::text("   "))]);
        let gen = generator(backend, ToolRegistry::new());
        let err = gen.generate(&ctx("hello"), "sys").await.unwrap_err();
        assert!(matches!(err, BotError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn tool_call_then_follow_up_completion() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(CountingTool { calls: calls.clone() }));

        let backend = ScriptedBackend::new(vec![
            Ok(Completion {
                content: None,
                tool_calls: vec![tool_call(r#"{"user_id": 42, "description": "likes tea"}"#)],
                finish_reason: Some("tool_calls".into()),
            }),
            Ok(Completion::text("Noted, Ann!")),
        ]);
        let gen = generator(backend.clone(), tools);

        let reply = gen.generate(&ctx("I like tea"), "sys").await.unwrap();
        assert_eq!(reply, "Noted, Ann!");
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(backend.calls(), 2);

        assert!(!backend.request(0).tools.is_empty());
        let second = backend.request(1);
        assert!(second.tools.is_empty());
        let roles: Vec<_> = second.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool"]);
        assert_eq!(second.messages[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn tool_call_with_text_skips_follow_up() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(CountingTool { calls: calls.clone() }));

        let backend = ScriptedBackend::new(vec![Ok(Completion {
            content: Some("Got it.".into()),
            tool_calls: vec![tool_call(r#"{"user_id": 1, "description": "x"}"#)],
            finish_reason: None,
        })]);
        let gen = generator(backend.clone(), tools);
        assert_eq!(gen.generate(&ctx("hi"), "sys").await.unwrap(), "Got it.");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn bad_tool_arguments_do_not_fail_the_turn() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(CountingTool { calls: calls.clone() }));

        let backend = ScriptedBackend::new(vec![
            Ok(Completion {
                content: None,
                tool_calls: vec![tool_call("{not json")],
                finish_reason: None,
            }),
            Ok(Completion::text("Sorry, could not save that.")),
        ]);
        let gen = generator(backend.clone(), tools);
        let reply = gen.generate(&ctx("hi"), "sys").await.unwrap();
        assert_eq!(reply, "Sorry, could not save that.");
        assert!(calls.lock().unwrap().is_empty());

        let tool_msg = backend.request(1).messages[3].content.clone().unwrap();
        assert!(tool_msg.contains("Invalid JSON arguments"));
    }
}
