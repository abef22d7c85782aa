//! Update routing.
//!
//! | Inbound                         | Allow-list miss     | Action                              |
//! |---------------------------------|---------------------|-------------------------------------|
//! | `/mint [text]`                  | notice              | new thread, reply to the command    |
//! | `/reloadusers`                  | notice              | re-read known users, confirm        |
//! | `/id`                           | notice              | reply with the chat id              |
//! | reply to a thread message       | silent drop         | continue thread, reply to the reply |
//! | anything else                   | ignored             | ignored                             |
//!
//! Registry and store locks are only held to copy state in or out, never
//! across a backend or Telegram call.

use crate::bot::access::AccessPolicy;
use crate::bot::config::BotConfig;
use crate::bot::error::{BotError, FALLBACK_REPLY};
use crate::bot::generator::{GenerationContext, ResponseGenerator};
use crate::bot::structured_log::{truncate_chars, EventType, LogLevel, StructuredLogger};
use crate::bot::telegram::{parse_command, BotCommand, ChatTransport, IncomingMessage};
use crate::bot::threads::{Role, ThreadKey, ThreadMessage, ThreadRegistry};
use crate::bot::users::{LoadReport, UserStore};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

const NOT_CONFIGURED_NOTICE: &str =
    "I am not configured to operate in any chat at the moment. Please contact the administrator.";
const NOT_AUTHORIZED_NOTICE: &str =
    "Sorry, I am not authorized to operate in this chat. Please contact the administrator.";
const USERS_RELOADED: &str = "Known users data reloaded from file.";

/// Shared state for every handler, console and maintenance task.
pub struct BotContext {
    pub config: BotConfig,
    pub system_prompt: String,
    pub access: AccessPolicy,
    pub threads: Arc<Mutex<ThreadRegistry>>,
    pub users: Arc<Mutex<UserStore>>,
    pub generator: ResponseGenerator,
    pub transport: Arc<dyn ChatTransport>,
    pub logger: StructuredLogger,
    /// Our own username, for `/cmd@username`.
    pub bot_username: Option<String>,
}

/// What a handler did with an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A generated reply went out in this thread.
    Replied(ThreadKey),
    /// A command answered with a fixed message.
    Answered,
    /// The chat is not allowed.
    Rejected,
    /// Not for us.
    Ignored,
    /// Generation failed and the fallback message was sent.
    Fallback,
}

#[derive(Clone)]
pub struct BotController {
    ctx: Arc<BotContext>,
}

impl BotController {
    pub fn new(ctx: Arc<BotContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<BotContext> {
        &self.ctx
    }

    /// Route one inbound message.
    pub async fn handle_update(&self, msg: IncomingMessage) -> Outcome {
        let command = parse_command(&msg.text, self.ctx.bot_username.as_deref());
        let outcome = match command {
            Some(BotCommand::Mint(text)) => self.handle_mint(&msg, text).await,
            Some(BotCommand::ReloadUsers) => self.handle_reload(&msg).await,
            Some(BotCommand::Id) => self.handle_id(&msg).await,
            None if msg.text.trim_start().starts_with('/') => Outcome::Ignored,
            None => match msg.reply_to_message_id {
                Some(replied_id) => self.handle_reply(&msg, replied_id).await,
                None => Outcome::Ignored,
            },
        };

        self.ctx.logger.log(
            &self
                .ctx
                .logger
                .event(EventType::Update, LogLevel::Debug)
                .with_chat(msg.chat_id)
                .with_detail(&format!("message {} -> {outcome:?}", msg.message_id)),
        );
        outcome
    }

    /// Allow-list gate for commands: rejected chats get a notice.
    async fn admit_command(&self, msg: &IncomingMessage, command: &str) -> bool {
        if let Err(err) = self.ctx.access.check(msg.chat_id) {
            self.log_rejection(msg, command, &err);
            let notice = if self.ctx.access.is_empty() {
                NOT_CONFIGURED_NOTICE
            } else {
                NOT_AUTHORIZED_NOTICE
            };
            self.send(msg.chat_id, notice, Some(msg.message_id)).await;
            return false;
        }
        true
    }

    fn log_rejection(&self, msg: &IncomingMessage, what: &str, err: &BotError) {
        let mut event = self
            .ctx
            .logger
            .event(EventType::AccessDenied, LogLevel::Info)
            .with_chat(msg.chat_id)
            .with_detail(&format!("{what}: {err}"));
        if let Some(user) = msg.sender_id {
            event = event.with_user(user);
        }
        self.ctx.logger.log_and_stderr(
            &event,
            &format!("Rejected {what} in chat {} ({})", msg.chat_id, err.kind()),
        );
    }

    /// `/mint [text]`: answer, then open a thread rooted at the command.
    pub async fn handle_mint(&self, msg: &IncomingMessage, text: String) -> Outcome {
        if !self.admit_command(msg, "/mint").await {
            return Outcome::Rejected;
        }

        self.ctx.logger.info(
            EventType::Update,
            &format!(
                "/mint (msg {}) from {} in chat {}: '{}'",
                msg.message_id,
                msg.sender_id.map(|id| id.to_string()).unwrap_or_else(|| "?".into()),
                msg.chat_id,
                truncate_chars(&text, 80)
            ),
        );

        self.observe_sender(msg).await;
        self.typing(msg.chat_id).await;

        let key = ThreadKey::new(msg.chat_id, msg.message_id);
        let user_message = self.user_message(msg, text);
        let mut ctx = self
            .generation_context(msg, vec![user_message.clone()], None)
            .await;
        ctx.thread = Some(key);

        let reply = match self
            .ctx
            .generator
            .generate(&ctx, &self.ctx.system_prompt)
            .await
        {
            Ok(reply) => reply,
            Err(err) => return self.fallback(msg, Some(key), err).await,
        };

        let Some(ids) = self.send(msg.chat_id, &reply, Some(msg.message_id)).await else {
            return Outcome::Fallback;
        };

        let mut threads = self.ctx.threads.lock().await;
        threads.append(key, user_message);
        threads.append(key, self.bot_message(reply, ids));
        drop(threads);

        self.ctx.logger.log(
            &self
                .ctx
                .logger
                .event(EventType::Thread, LogLevel::Info)
                .with_chat(msg.chat_id)
                .with_thread(key)
                .with_detail("thread started"),
        );
        Outcome::Replied(key)
    }

    /// A reply to some message: continue its thread if we know it.
    pub async fn handle_reply(&self, msg: &IncomingMessage, replied_id: i64) -> Outcome {
        if let Err(err) = self.ctx.access.check(msg.chat_id) {
            // No notice: replies are ordinary chat traffic.
            self.log_rejection(msg, "reply", &err);
            return Outcome::Rejected;
        }

        let (key, replied_to) = {
            let threads = self.ctx.threads.lock().await;
            let Some(key) = threads.find_by_reply(msg.chat_id, replied_id) else {
                return Outcome::Ignored;
            };
            (key, threads.message_by_telegram_id(&key, replied_id))
        };

        if replied_to.is_none() {
            self.ctx.logger.warn(
                EventType::Thread,
                &format!("thread {key} has no message {replied_id}, replying without quote"),
            );
        }

        self.observe_sender(msg).await;

        let user_message = self.user_message(msg, msg.text.clone());
        let known_users = self.ctx.users.lock().await.prompt_section();
        let history = {
            let mut threads = self.ctx.threads.lock().await;
            threads.append(key, user_message);
            let budget = threads
                .budget()
                .with_reserved(&format!("{}\n{known_users}", self.ctx.system_prompt));
            threads.lookup_within(&key, &budget)
        };
        // Evicted between the two locks.
        let Some(history) = history else {
            return Outcome::Ignored;
        };

        self.typing(msg.chat_id).await;

        let mut ctx = self.generation_context(msg, history, replied_to).await;
        ctx.thread = Some(key);

        let reply = match self
            .ctx
            .generator
            .generate(&ctx, &self.ctx.system_prompt)
            .await
        {
            Ok(reply) => reply,
            Err(err) => return self.fallback(msg, Some(key), err).await,
        };

        let Some(ids) = self.send(msg.chat_id, &reply, Some(msg.message_id)).await else {
            return Outcome::Fallback;
        };

        self.ctx
            .threads
            .lock()
            .await
            .append(key, self.bot_message(reply, ids));
        Outcome::Replied(key)
    }

    /// `/reloadusers`
    pub async fn handle_reload(&self, msg: &IncomingMessage) -> Outcome {
        if !self.admit_command(msg, "/reloadusers").await {
            return Outcome::Rejected;
        }
        let result = self.ctx.users.lock().await.reload().await;
        let text = match result {
            Ok(report) => {
                self.report_store_load(&report);
                USERS_RELOADED.to_string()
            }
            Err(e) => {
                self.ctx
                    .logger
                    .error(EventType::UserStore, &format!("reload failed: {e:#}"));
                "Could not reload known users, see the bot log.".to_string()
            }
        };
        self.send(msg.chat_id, &text, Some(msg.message_id)).await;
        Outcome::Answered
    }

    /// Log what a known-users load produced.
    pub fn report_store_load(&self, report: &LoadReport) {
        for err in &report.skipped {
            self.ctx.logger.warn(EventType::UserStore, &err.to_string());
        }
        if let Some(backup) = &report.backup {
            self.ctx.logger.warn(
                EventType::UserStore,
                &format!("unreadable known users preserved in {}", backup.display()),
            );
        }
        self.ctx.logger.info(
            EventType::UserStore,
            &format!(
                "known users loaded: {} ({} skipped)",
                report.loaded,
                report.skipped.len()
            ),
        );
    }

    /// `/id`
    pub async fn handle_id(&self, msg: &IncomingMessage) -> Outcome {
        if !self.admit_command(msg, "/id").await {
            return Outcome::Rejected;
        }
        let text = format!("This chat's ID is: {}", msg.chat_id);
        self.send(msg.chat_id, &text, Some(msg.message_id)).await;
        Outcome::Answered
    }

    /// Operator message from the console. Same transport and allow-list
    /// as generated replies.
    pub async fn send_manual(&self, chat_id: i64, text: &str) -> Result<Vec<i64>, BotError> {
        self.ctx.access.check(chat_id)?;
        let ids = self
            .ctx
            .transport
            .send_message(chat_id, text, None)
            .await
            .map_err(|e| BotError::BackendUnavailable(format!("Telegram send failed: {e:#}")))?;
        self.ctx.logger.log(
            &self
                .ctx
                .logger
                .event(EventType::Console, LogLevel::Info)
                .with_chat(chat_id)
                .with_detail(&format!("manual message sent ({} part(s))", ids.len())),
        );
        Ok(ids)
    }

    // ── helpers ──────────────────────────────────────────────────

    fn user_message(&self, msg: &IncomingMessage, text: String) -> ThreadMessage {
        let mut message =
            ThreadMessage::new(Role::User, text, msg.date).with_telegram_ids(vec![msg.message_id]);
        if let Some(sender) = msg.sender_id {
            message = message.from_sender(sender);
        }
        message
    }

    fn bot_message(&self, text: String, ids: Vec<i64>) -> ThreadMessage {
        ThreadMessage::new(Role::Assistant, text, Utc::now()).with_telegram_ids(ids)
    }

    async fn observe_sender(&self, msg: &IncomingMessage) {
        let Some(sender) = msg.sender_id else {
            return;
        };
        let created = self
            .ctx
            .users
            .lock()
            .await
            .observe(sender, msg.sender_name.as_deref());
        if created {
            self.ctx.logger.log(
                &self
                    .ctx
                    .logger
                    .event(EventType::UserStore, LogLevel::Info)
                    .with_user(sender)
                    .with_chat(msg.chat_id)
                    .with_detail("new user observed"),
            );
        }
    }

    async fn generation_context(
        &self,
        msg: &IncomingMessage,
        history: Vec<ThreadMessage>,
        replied_to: Option<ThreadMessage>,
    ) -> GenerationContext {
        let users = self.ctx.users.lock().await;
        GenerationContext {
            chat_id: msg.chat_id,
            thread: None,
            history,
            sender_id: msg.sender_id,
            sender_profile: msg.sender_id.and_then(|id| users.get(id).cloned()),
            known_users: users.prompt_section(),
            replied_to,
        }
    }

    async fn typing(&self, chat_id: i64) {
        if let Err(e) = self.ctx.transport.send_typing(chat_id).await {
            self.ctx
                .logger
                .debug(EventType::Update, &format!("sendChatAction failed: {e:#}"));
        }
    }

    /// Send and log failures. `None` when nothing went out.
    async fn send(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Option<Vec<i64>> {
        match self.ctx.transport.send_message(chat_id, text, reply_to).await {
            Ok(ids) => Some(ids),
            Err(e) => {
                self.ctx.logger.log_and_stderr(
                    &self
                        .ctx
                        .logger
                        .event(EventType::Error, LogLevel::Error)
                        .with_chat(chat_id)
                        .with_detail(&format!("sendMessage failed: {e:#}")),
                    &format!("Error: failed to send to chat {chat_id}: {e:#}"),
                );
                None
            }
        }
    }

    async fn fallback(&self, msg: &IncomingMessage, key: Option<ThreadKey>, err: BotError) -> Outcome {
        let mut event = self
            .ctx
            .logger
            .event(EventType::Error, LogLevel::Error)
            .with_chat(msg.chat_id)
            .with_detail(&format!("{}: {err}", err.kind()));
        if let Some(key) = key {
            event = event.with_thread(key);
        }
        self.ctx.logger.log_and_stderr(
            &event,
            &format!("Error: no reply for chat {}: {err}", msg.chat_id),
        );
        self.send(msg.chat_id, FALLBACK_REPLY, Some(msg.message_id)).await;
        Outcome::Fallback
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bot::backend::{ApiError, Completion, CompletionBackend, CompletionRequest, RetryPolicy};
    use crate::bot::context::HistoryBudget;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Records every send; hands out increasing message ids from 1000.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub sent: StdMutex<Vec<(i64, String, Option<i64>)>>,
        pub typing: StdMutex<Vec<i64>>,
    }

    impl MockTransport {
        pub fn sent(&self) -> Vec<(i64, String, Option<i64>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send_message(
            &self,
            chat_id: i64,
            text: &str,
            reply_to: Option<i64>,
        ) -> anyhow::Result<Vec<i64>> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((chat_id, text.to_string(), reply_to));
            Ok(vec![1000 + sent.len() as i64])
        }

        async fn send_typing(&self, chat_id: i64) -> anyhow::Result<()> {
            self.typing.lock().unwrap().push(chat_id);
            Ok(())
        }
    }

    pub(crate) struct QueueBackend {
        replies: StdMutex<VecDeque<Result<Completion, ApiError>>>,
        pub requests: StdMutex<Vec<CompletionRequest>>,
    }

    impl QueueBackend {
        pub fn new(replies: Vec<Result<Completion, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies.into()),
                requests: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for QueueBackend {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Completion::text("default reply")))
        }
    }

    pub(crate) const CHAT: i64 = -100123;

    pub(crate) struct Harness {
        pub controller: BotController,
        pub transport: Arc<MockTransport>,
        pub backend: Arc<QueueBackend>,
        pub dir: TempDir,
    }

    pub(crate) fn harness(allowed: Vec<i64>, replies: Vec<Result<Completion, ApiError>>) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = BotConfig::default();
        config.bot.allowed_chat_ids = allowed.clone();

        let transport = Arc::new(MockTransport::default());
        let backend = QueueBackend::new(replies);
        let logger = StructuredLogger::disabled();
        let generator = ResponseGenerator::new(
            backend.clone(),
            Arc::new(ToolRegistry::new()),
            config.backend.clone(),
            logger.clone(),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        });

        let ctx = BotContext {
            system_prompt: "You are Mint.".into(),
            access: AccessPolicy::new(allowed),
            threads: Arc::new(Mutex::new(ThreadRegistry::new(HistoryBudget::new(40, 8192)))),
            users: Arc::new(Mutex::new(UserStore::new(dir.path().join("users.yaml")))),
            generator,
            transport: transport.clone(),
            logger,
            bot_username: Some("mintbot".into()),
            config,
        };

        Harness {
            controller: BotController::new(Arc::new(ctx)),
            transport,
            backend,
            dir,
        }
    }

    pub(crate) fn incoming(chat_id: i64, message_id: i64, text: &str, reply_to: Option<i64>) -> IncomingMessage {
        IncomingMessage {
            chat_id,
            message_id,
            sender_id: Some(42),
            sender_name: Some("Ann Lee".into()),
            text: text.into(),
            date: DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap(),
            reply_to_message_id: reply_to,
        }
    }

    #[tokio::test]
    async fn mint_replies_and_opens_thread() {
        let h = harness(vec![CHAT], vec![Ok(Completion::text("Rust is a language."))]);
        let outcome = h
            .controller
            .handle_update(incoming(CHAT, 10, "/mint what is rust?", None))
            .await;

        let key = ThreadKey::new(CHAT, 10);
        assert_eq!(outcome, Outcome::Replied(key));
        assert_eq!(
            h.transport.sent(),
            vec![(CHAT, "Rust is a language.".to_string(), Some(10))]
        );
        assert_eq!(*h.transport.typing.lock().unwrap(), vec![CHAT]);

        let ctx = h.controller.context();
        let history = ctx.threads.lock().await.lookup(&key).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "what is rust?");
        assert_eq!(history[0].telegram_ids, vec![10]);
        assert_eq!(history[1].telegram_ids, vec![1001]);

        let users = ctx.users.lock().await;
        assert_eq!(users.get(42).unwrap().name.as_deref(), Some("Ann Lee"));

        let request = &h.backend.requests.lock().unwrap()[0];
        assert_eq!(request.messages.len(), 2);
        assert_eq!(
            request.messages[1].content.as_deref(),
            Some("[User ID: 42] what is rust?")
        );
    }

    #[tokio::test]
    async fn reply_continues_thread() {
        let h = harness(
            vec![CHAT],
            vec![
                Ok(Completion::text("First answer")),
                Ok(Completion::text("Second answer")),
            ],
        );
        h.controller
            .handle_update(incoming(CHAT, 10, "/mint hello", None))
            .await;
        // Bot reply got id 1001.
        let outcome = h
            .controller
            .handle_update(incoming(CHAT, 11, "tell me more", Some(1001)))
            .await;
        let key = ThreadKey::new(CHAT, 10);
        assert_eq!(outcome, Outcome::Replied(key));

        let sent = h.transport.sent();
        assert_eq!(sent[1], (CHAT, "Second answer".to_string(), Some(11)));

        let history = h.controller.context().threads.lock().await.lookup(&key).unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "First answer", "tell me more", "Second answer"]);

        let requests = h.backend.requests.lock().unwrap();
        let last = requests[1].messages.last().unwrap().content.clone().unwrap();
        assert_eq!(
            last,
            "[User ID: 42] [Replying to assistant's message: \"First answer\"] tell me more"
        );
        assert_eq!(requests[1].messages.len(), 4);
    }

    #[tokio::test]
    async fn reply_to_unknown_message_is_ignored() {
        let h = harness(vec![CHAT], vec![]);
        let outcome = h
            .controller
            .handle_update(incoming(CHAT, 5, "hm?", Some(4)))
            .await;
        assert_eq!(outcome, Outcome::Ignored);
        assert!(h.transport.sent().is_empty());
        assert!(h.backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disallowed_command_gets_notice() {
        let h = harness(vec![CHAT], vec![]);
        let outcome = h
            .controller
            .handle_update(incoming(777, 1, "/mint hi", None))
            .await;
        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(
            h.transport.sent(),
            vec![(777, NOT_AUTHORIZED_NOTICE.to_string(), Some(1))]
        );
        assert!(h.backend.requests.lock().unwrap().is_empty());
        assert!(h.controller.context().users.lock().await.is_empty());
    }

    #[tokio::test]
    async fn empty_allow_list_rejects_every_chat() {
        let h = harness(vec![], vec![]);
        for (i, chat) in [CHAT, 1, -5].into_iter().enumerate() {
            let outcome = h
                .controller
                .handle_update(incoming(chat, i as i64, "/id", None))
                .await;
            assert_eq!(outcome, Outcome::Rejected);
        }
        assert!(h
            .transport
            .sent()
            .iter()
            .all(|(_, text, _)| text == NOT_CONFIGURED_NOTICE));
    }

    #[tokio::test]
    async fn disallowed_reply_is_silently_dropped() {
        let h = harness(vec![CHAT], vec![]);
        let outcome = h
            .controller
            .handle_update(incoming(999, 3, "some reply", Some(2)))
            .await;
        assert_eq!(outcome, Outcome::Rejected);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_sends_fallback() {
        let h = harness(
            vec![CHAT],
            vec![
                Err(ApiError::status(503, "down")),
                Err(ApiError::status(503, "still down")),
            ],
        );
        let outcome = h
            .controller
            .handle_update(incoming(CHAT, 10, "/mint hi", None))
            .await;
        assert_eq!(outcome, Outcome::Fallback);
        assert_eq!(
            h.transport.sent(),
            vec![(CHAT, FALLBACK_REPLY.to_string(), Some(10))]
        );
        assert!(h.controller.context().threads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn id_and_foreign_commands() {
        let h = harness(vec![CHAT], vec![]);
        assert_eq!(
            h.controller.handle_update(incoming(CHAT, 1, "/id", None)).await,
            Outcome::Answered
        );
        assert_eq!(h.transport.sent()[0].1, format!("This chat's ID is: {CHAT}"));

        assert_eq!(
            h.controller
                .handle_update(incoming(CHAT, 2, "/mint@otherbot hi", None))
                .await,
            Outcome::Ignored
        );
        assert_eq!(
            h.controller.handle_update(incoming(CHAT, 3, "just chatting", None)).await,
            Outcome::Ignored
        );
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn reload_users_reads_file() {
        let h = harness(vec![CHAT], vec![]);
        let path = h.dir.path().join("users.yaml");
        tokio::fs::write(&path, "5:\n  name: Eve\n  description: tester\n")
            .await
            .unwrap();

        let outcome = h
            .controller
            .handle_update(incoming(CHAT, 1, "/reloadusers", None))
            .await;
        assert_eq!(outcome, Outcome::Answered);
        assert_eq!(h.transport.sent()[0].1, USERS_RELOADED);
        let users = h.controller.context().users.lock().await;
        assert_eq!(users.get(5).unwrap().description, "tester");
    }

    #[tokio::test]
    async fn manual_send_respects_allow_list() {
        let h = harness(vec![CHAT], vec![]);
        let ids = h.controller.send_manual(CHAT, "maintenance at 5").await.unwrap();
        assert_eq!(ids, vec![1001]);
        assert_eq!(h.transport.sent()[0], (CHAT, "maintenance at 5".to_string(), None));

        let err = h.controller.send_manual(1, "nope").await.unwrap_err();
        assert!(matches!(err, BotError::ChatNotAllowed(1)));
        assert_eq!(h.transport.sent().len(), 1);
    }
}
