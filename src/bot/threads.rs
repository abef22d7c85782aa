//! Per-thread conversation context.
//!
//! A thread starts with a `/mint` command and grows every time someone
//! replies to one of its messages. Threads live in memory, keyed by
//! `(chat_id, root_message_id)`, and are forgotten after a period of
//! inactivity. At shutdown the whole registry is written as one JSON
//! snapshot and restored on the next start:
//!
//! ```text
//! {"saved_at": "...", "threads": [{"key": {...}, "messages": [...], "last_activity": "..."}]}
//! ```

use crate::bot::context::HistoryBudget;
use crate::bot::persist::atomic_write;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

// ── Types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub chat_id: i64,
    /// Telegram message id of the `/mint` command that opened the thread.
    pub root_message_id: i64,
}

impl ThreadKey {
    pub fn new(chat_id: i64, root_message_id: i64) -> Self {
        Self {
            chat_id,
            root_message_id,
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.root_message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    /// Telegram ids carrying this message. Long bot replies are split
    /// into several chunks, each with its own id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub telegram_ids: Vec<i64>,
}

impl ThreadMessage {
    pub fn new(role: Role, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp,
            sender_id: None,
            telegram_ids: Vec::new(),
        }
    }

    pub fn from_sender(mut self, user_id: i64) -> Self {
        self.sender_id = Some(user_id);
        self
    }

    pub fn with_telegram_ids(mut self, ids: Vec<i64>) -> Self {
        self.telegram_ids = ids;
        self
    }

    pub fn carries(&self, telegram_id: i64) -> bool {
        self.telegram_ids.contains(&telegram_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub key: ThreadKey,
    pub messages: Vec<ThreadMessage>,
    pub last_activity: DateTime<Utc>,
}

impl ConversationThread {
    fn new(key: ThreadKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            messages: Vec::new(),
            last_activity: now,
        }
    }

    /// Append, clamping a timestamp older than `last_activity` so the
    /// message sequence stays non-decreasing.
    fn push(&mut self, mut message: ThreadMessage) {
        if !self.messages.is_empty() && message.timestamp < self.last_activity {
            message.timestamp = self.last_activity;
        }
        self.last_activity = self.last_activity.max(message.timestamp);
        self.messages.push(message);
    }
}

// ── Snapshot ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct SnapshotOut<'a> {
    saved_at: DateTime<Utc>,
    threads: Vec<&'a ConversationThread>,
}

#[derive(Deserialize)]
struct SnapshotIn {
    #[serde(default)]
    threads: Vec<serde_json::Value>,
}

/// What happened while restoring a snapshot.
#[derive(Debug, Default)]
pub struct SnapshotLoad {
    pub restored: usize,
    pub evicted: usize,
    /// One line per skipped entry.
    pub warnings: Vec<String>,
}

// ── ThreadRegistry ───────────────────────────────────────────────

/// All live threads. Callers wrap it in one `tokio::sync::Mutex`.
pub struct ThreadRegistry {
    threads: HashMap<ThreadKey, ConversationThread>,
    budget: HistoryBudget,
}

impl ThreadRegistry {
    pub fn new(budget: HistoryBudget) -> Self {
        Self {
            threads: HashMap::new(),
            budget,
        }
    }

    pub fn budget(&self) -> HistoryBudget {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn contains(&self, key: &ThreadKey) -> bool {
        self.threads.contains_key(key)
    }

    /// Add a message, creating the thread if needed.
    pub fn append(&mut self, key: ThreadKey, message: ThreadMessage) {
        let now = message.timestamp;
        self.threads
            .entry(key)
            .or_insert_with(|| ConversationThread::new(key, now))
            .push(message);
    }

    /// History for `key` bounded by the registry's budget.
    pub fn lookup(&self, key: &ThreadKey) -> Option<Vec<ThreadMessage>> {
        self.lookup_within(key, &self.budget)
    }

    /// History for `key` bounded by an explicit budget.
    pub fn lookup_within(
        &self,
        key: &ThreadKey,
        budget: &HistoryBudget,
    ) -> Option<Vec<ThreadMessage>> {
        self.threads
            .get(key)
            .map(|thread| budget.truncate(&thread.messages))
    }

    /// Drop threads idle since before `now - max_age`. Returns how many.
    pub fn evict_inactive(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;
        let before = self.threads.len();
        self.threads.retain(|_, thread| thread.last_activity >= cutoff);
        before - self.threads.len()
    }

    /// Which thread in `chat_id` a reply to `telegram_message_id` belongs to.
    pub fn find_by_reply(&self, chat_id: i64, telegram_message_id: i64) -> Option<ThreadKey> {
        self.threads
            .values()
            .filter(|t| t.key.chat_id == chat_id)
            .find(|t| {
                t.key.root_message_id == telegram_message_id
                    || t.messages.iter().any(|m| m.carries(telegram_message_id))
            })
            .map(|t| t.key)
    }

    pub fn message_by_telegram_id(
        &self,
        key: &ThreadKey,
        telegram_message_id: i64,
    ) -> Option<ThreadMessage> {
        self.threads
            .get(key)?
            .messages
            .iter()
            .find(|m| m.carries(telegram_message_id))
            .cloned()
    }

    /// One display line per thread, most recently active first.
    pub fn summaries(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut threads: Vec<&ConversationThread> = self.threads.values().collect();
        threads.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        threads
            .into_iter()
            .map(|t| {
                format!(
                    "{}: {} message{}, last active {} ago",
                    t.key,
                    t.messages.len(),
                    if t.messages.len() == 1 { "" } else { "s" },
                    format_age(now - t.last_activity),
                )
            })
            .collect()
    }

    /// Write every thread to `path` atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut threads: Vec<&ConversationThread> = self.threads.values().collect();
        threads.sort_by_key(|t| (t.key.chat_id, t.key.root_message_id));
        let snapshot = SnapshotOut {
            saved_at: Utc::now(),
            threads,
        };
        let json = serde_json::to_vec_pretty(&snapshot).context("Failed to serialize threads")?;
        atomic_write(path, &json).await
    }

    /// Replace the registry contents with the snapshot at `path`.
    ///
    /// A missing file restores nothing. Entries that do not parse are
    /// skipped; threads already past `max_age` are evicted immediately.
    pub async fn load(
        &mut self,
        path: &Path,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<SnapshotLoad> {
        let mut report = SnapshotLoad::default();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read thread snapshot: {}", path.display()))
            }
        };

        let snapshot: SnapshotIn = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                report
                    .warnings
                    .push(format!("thread snapshot {} unreadable: {e}", path.display()));
                return Ok(report);
            }
        };

        self.threads.clear();
        for (index, value) in snapshot.threads.into_iter().enumerate() {
            match serde_json::from_value::<ConversationThread>(value) {
                Ok(thread) if !thread.messages.is_empty() => {
                    self.threads.insert(thread.key, thread);
                }
                Ok(thread) => report
                    .warnings
                    .push(format!("thread {} has no messages, skipped", thread.key)),
                Err(e) => report
                    .warnings
                    .push(format!("thread entry #{index} skipped: {e}")),
            }
        }

        report.evicted = self.evict_inactive(now, max_age);
        report.restored = self.threads.len();
        Ok(report)
    }
}

fn format_age(age: Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d{}h", secs / 86_400, (secs % 86_400) / 3600)
    }
}

// ── Tests ────────────────────────────────────────────────────────
