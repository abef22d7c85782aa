//! Structured JSON logging for mintbot.
//!
//! Emits one JSON object per line to a daily-rotating log file at
//! `{log_dir}/YYYY-MM-DD.jsonl`, alongside human-readable `[mintbot]`
//! lines on stderr.
//!
//! ## Configuration
//!
//! ```toml
//! [logging]
//! structured = true
//! log_dir = "logs"
//! retain_days = 14
//! level = "info"
//! ```
//!
//! Writes are buffered and flushed every 16 events, on any warning or
//! error, and on drop. Disk errors are reported on stderr and swallowed;
//! the bot never stops because a log line could not be written.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ── LogLevel ─────────────────────────────────────────────────────

/// Severity level for a log event. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

// ── EventType ────────────────────────────────────────────────────

/// Classification of a structured log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Lifecycle,
    Update,
    AccessDenied,
    Thread,
    Eviction,
    ApiRequest,
    ApiResponse,
    Retry,
    ToolCall,
    UserStore,
    Console,
    Error,
}

impl EventType {
    const ALL: [EventType; 12] = [
        EventType::Lifecycle,
        EventType::Update,
        EventType::AccessDenied,
        EventType::Thread,
        EventType::Eviction,
        EventType::ApiRequest,
        EventType::ApiResponse,
        EventType::Retry,
        EventType::ToolCall,
        EventType::UserStore,
        EventType::Console,
        EventType::Error,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            EventType::Lifecycle => "lifecycle",
            EventType::Update => "update",
            EventType::AccessDenied => "access_denied",
            EventType::Thread => "thread",
            EventType::Eviction => "eviction",
            EventType::ApiRequest => "api_request",
            EventType::ApiResponse => "api_response",
            EventType::Retry => "retry",
            EventType::ToolCall => "tool_call",
            EventType::UserStore => "user_store",
            EventType::Console => "console",
            EventType::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_lowercase();
        EventType::ALL
            .iter()
            .copied()
            .find(|et| et.as_str() == wanted)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

// ── LogEvent ─────────────────────────────────────────────────────

/// A single structured log event written as one JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// Identifier of this process run.
    pub run_id: String,
    pub event_type: EventType,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// Thread key rendered as `chat:root`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Backend attempt number (1-based) for request/retry events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LogEvent {
    pub fn new(run_id: &str, event_type: EventType, level: LogLevel) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type,
            level,
            chat_id: None,
            user_id: None,
            thread: None,
            model: None,
            duration_ms: None,
            attempt: None,
            detail: None,
        }
    }

    pub fn with_chat(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_thread(mut self, thread: impl std::fmt::Display) -> Self {
        self.thread = Some(thread.to_string());
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── LoggingConfig ────────────────────────────────────────────────

/// The `[logging]` section of config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_structured")]
    pub structured: bool,
    /// Directory for log files. Supports `~` expansion.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,
    /// Minimum level written to stderr and to the log file.
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_structured() -> bool {
    true
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_retain_days() -> u32 {
    14
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            structured: default_structured(),
            log_dir: default_log_dir(),
            retain_days: default_retain_days(),
            level: default_level(),
        }
    }
}

impl LoggingConfig {
    pub fn resolved_log_dir(&self) -> PathBuf {
        expand_tilde(&self.log_dir)
    }

    /// Parsed minimum level; unknown strings fall back to `Info`.
    pub fn min_level(&self) -> LogLevel {
        self.level.parse().unwrap_or(LogLevel::Info)
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(path.get(2..).unwrap_or(""));
        }
    }
    PathBuf::from(path)
}

// ── StructuredLogger ─────────────────────────────────────────────

struct LoggerInner {
    buffer: Vec<String>,
    /// Date string of the currently-open log file.
    current_date: String,
    log_dir: PathBuf,
    enabled: bool,
}

/// Thread-safe structured logger with buffered writes and daily rotation.
///
/// Cheap to clone; every clone shares one buffer.
#[derive(Clone)]
pub struct StructuredLogger {
    inner: Arc<Mutex<LoggerInner>>,
    config: LoggingConfig,
    run_id: String,
    min_level: LogLevel,
}

impl StructuredLogger {
    /// Create a new logger. Directory creation failures are reported on
    /// stderr; later writes then fail quietly.
    pub fn new(config: LoggingConfig, run_id: &str) -> Self {
        let log_dir = config.resolved_log_dir();
        let enabled = config.structured;

        if enabled {
            if let Err(e) = std::fs::create_dir_all(&log_dir) {
                eprintln!(
                    "[mintbot] Warning: could not create log directory {}: {e}",
                    log_dir.display()
                );
            }
        }

        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        let min_level = config.min_level();

        Self {
            inner: Arc::new(Mutex::new(LoggerInner {
                buffer: Vec::new(),
                current_date: today,
                log_dir,
                enabled,
            })),
            config,
            run_id: run_id.to_string(),
            min_level,
        }
    }

    /// A logger that writes nothing to disk. Used by tests.
    pub fn disabled() -> Self {
        Self::new(
            LoggingConfig {
                structured: false,
                level: "error".to_string(),
                ..Default::default()
            },
            "test",
        )
    }

    /// Start an event stamped with this logger's run id.
    pub fn event(&self, event_type: EventType, level: LogLevel) -> LogEvent {
        LogEvent::new(&self.run_id, event_type, level)
    }

    /// Buffer an event for the log file.
    pub fn log(&self, event: &LogEvent) {
        if event.level < self.min_level {
            return;
        }

        let json = match event.to_json_line() {
            Ok(j) => j,
            Err(e) => {
                eprintln!("[mintbot] Warning: failed to serialize log event: {e}");
                return;
            }
        };

        let should_flush;
        {
            let mut inner = match self.inner.lock() {
                Ok(g) => g,
                Err(_) => return,
            };

            if !inner.enabled {
                return;
            }

            let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
            if today != inner.current_date {
                let _ = Self::flush_locked(&mut inner);
                inner.current_date = today;
            }

            inner.buffer.push(json);
            should_flush = inner.buffer.len() >= 16 || event.level >= LogLevel::Warn;
        }

        if should_flush {
            self.flush();
        }
    }

    /// Log an event and print a human-readable line to stderr.
    pub fn log_and_stderr(&self, event: &LogEvent, stderr_msg: &str) {
        if event.level >= self.min_level {
            eprintln!("[mintbot] {stderr_msg}");
        }
        self.log(event);
    }

    /// Shorthand: one event whose detail is the stderr message.
    pub fn info(&self, event_type: EventType, msg: &str) {
        let event = self.event(event_type, LogLevel::Info).with_detail(msg);
        self.log_and_stderr(&event, msg);
    }

    pub fn warn(&self, event_type: EventType, msg: &str) {
        let event = self.event(event_type, LogLevel::Warn).with_detail(msg);
        self.log_and_stderr(&event, &format!("Warning: {msg}"));
    }

    pub fn error(&self, event_type: EventType, msg: &str) {
        let event = self.event(event_type, LogLevel::Error).with_detail(msg);
        self.log_and_stderr(&event, &format!("Error: {msg}"));
    }

    pub fn debug(&self, event_type: EventType, msg: &str) {
        let event = self.event(event_type, LogLevel::Debug).with_detail(msg);
        self.log_and_stderr(&event, msg);
    }

    /// Flush all buffered events to disk.
    pub fn flush(&self) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let _ = Self::flush_locked(&mut inner);
    }

    fn flush_locked(inner: &mut LoggerInner) -> std::io::Result<()> {
        if inner.buffer.is_empty() || !inner.enabled {
            return Ok(());
        }

        let path = inner.log_dir.join(format!("{}.jsonl", inner.current_date));

        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => {
                let mut write_err = None;
                for line in &inner.buffer {
                    if let Err(e) = writeln!(file, "{line}") {
                        eprintln!(
                            "[mintbot] Warning: log write failed ({}): {e}",
                            path.display()
                        );
                        write_err = Some(e);
                        break;
                    }
                }
                inner.buffer.clear();
                match write_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            Err(e) => {
                eprintln!(
                    "[mintbot] Warning: could not open log file {}: {e}",
                    path.display()
                );
                inner.buffer.clear();
                Err(e)
            }
        }
    }

    /// Delete log files older than `retain_days`. Best-effort.
    pub fn cleanup_old_logs(&self) {
        if !self.config.structured {
            return;
        }

        let log_dir = self.config.resolved_log_dir();
        let cutoff =
            Local::now().date_naive() - chrono::Duration::days(self.config.retain_days as i64);

        let files = match Self::list_log_files(&log_dir) {
            Ok(f) => f,
            Err(_) => return,
        };

        for path in files {
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            if let Ok(file_date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                if file_date < cutoff {
                    if let Err(e) = std::fs::remove_file(&path) {
                        eprintln!(
                            "[mintbot] Warning: failed to delete old log {}: {e}",
                            path.display()
                        );
                    }
                }
            }
        }
    }

    /// The last `count` events across the log files, oldest first,
    /// optionally filtered by event type.
    pub fn tail_entries(&self, count: usize, filter: Option<EventType>) -> Vec<LogEvent> {
        self.flush();

        let mut log_files = match Self::list_log_files(&self.config.resolved_log_dir()) {
            Ok(files) => files,
            Err(_) => return Vec::new(),
        };
        log_files.sort_by(|a, b| b.cmp(a));

        let mut results = Vec::new();
        for file_path in log_files {
            let content = match std::fs::read_to_string(&file_path) {
                Ok(c) => c,
                Err(_) => continue,
            };

            let mut file_events: Vec<LogEvent> = content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|line| serde_json::from_str::<LogEvent>(line).ok())
                .filter(|evt| filter.map(|f| evt.event_type == f).unwrap_or(true))
                .collect();

            file_events.append(&mut results);
            results = file_events;

            if results.len() >= count {
                break;
            }
        }

        let start = results.len().saturating_sub(count);
        results.split_off(start)
    }

    fn list_log_files(log_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(log_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Render events for the console.
    pub fn format_entries_for_display(entries: &[LogEvent]) -> String {
        if entries.is_empty() {
            return "No log entries found.".to_string();
        }

        let mut output = String::new();
        for event in entries {
            let ts = event.timestamp.get(..19).unwrap_or(&event.timestamp);
            output.push_str(&format!(
                "{ts}  {:<5}  {:<14}",
                event.level.to_string().to_uppercase(),
                event.event_type.to_string()
            ));
            if let Some(chat) = event.chat_id {
                output.push_str(&format!("  chat={chat}"));
            }
            if let Some(user) = event.user_id {
                output.push_str(&format!("  user={user}"));
            }
            if let Some(ref thread) = event.thread {
                output.push_str(&format!("  thread={thread}"));
            }
            if let Some(ms) = event.duration_ms {
                output.push_str(&format!("  {ms}ms"));
            }
            if let Some(ref detail) = event.detail {
                output.push_str(&format!("  \"{}\"", truncate_chars(detail, 80)));
            }
            output.push('\n');
        }
        output
    }
}

impl Drop for StructuredLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Truncate to `max` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// ── Console `logs` command ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogsCommand {
    pub count: usize,
    pub event_type_filter: Option<EventType>,
}

/// Parse the arguments of the console `logs [N] [event_type]` command.
pub fn parse_logs_args(args: &[&str]) -> LogsCommand {
    let mut count = 20usize;
    let mut event_type_filter = None;

    for part in args {
        if let Ok(n) = part.parse::<usize>() {
            count = n.min(1000);
        } else if let Ok(et) = part.parse::<EventType>() {
            event_type_filter = Some(et);
        }
    }

    LogsCommand {
        count,
        event_type_filter,
    }
}

pub fn execute_logs_command(cmd: &LogsCommand, logger: &StructuredLogger) -> String {
    let entries = logger.tail_entries(cmd.count, cmd.event_type_filter);
    let filter_desc = cmd
        .event_type_filter
        .map(|et| format!(" [{et}]"))
        .unwrap_or_default();

    if entries.is_empty() {
        return format!("No log entries found{filter_desc}.");
    }

    format!(
        "Last {} log entries{filter_desc}:\n\n{}",
        entries.len(),
        StructuredLogger::format_entries_for_display(&entries)
    )
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn logger_in(dir: &TempDir, level: &str) -> StructuredLogger {
        StructuredLogger::new(
            LoggingConfig {
                structured: true,
                log_dir: dir.path().to_string_lossy().to_string(),
                retain_days: 14,
                level: level.to_string(),
            },
            "run1",
        )
    }

    #[test]
    fn level_ordering_and_parsing() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn event_type_round_trips_through_str() {
        for et in EventType::ALL {
            assert_eq!(et.to_string().parse::<EventType>().unwrap(), et);
        }
    }

    #[test]
    fn event_json_skips_empty_fields() {
        let event = LogEvent::new("r", EventType::Thread, LogLevel::Info)
            .with_chat(-100)
            .with_thread("-100:7");
        let json: serde_json::Value =
            serde_json::from_str(&event.to_json_line().unwrap()).unwrap();
        assert_eq!(json["event_type"], "thread");
        assert_eq!(json["chat_id"], -100);
        assert_eq!(json["thread"], "-100:7");
        assert!(json.get("model").is_none());
    }

    #[test]
    fn writes_and_tails_entries() {
        let dir = TempDir::new().unwrap();
        let logger = logger_in(&dir, "info");

        logger.log(&logger.event(EventType::Update, LogLevel::Info).with_detail("one"));
        logger.log(&logger.event(EventType::Eviction, LogLevel::Info).with_detail("two"));
        logger.log(&logger.event(EventType::Update, LogLevel::Info).with_detail("three"));

        let all = logger.tail_entries(10, None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].detail.as_deref(), Some("one"));

        let updates = logger.tail_entries(10, Some(EventType::Update));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].detail.as_deref(), Some("three"));

        let last = logger.tail_entries(1, None);
        assert_eq!(last[0].detail.as_deref(), Some("three"));
    }

    #[test]
    fn min_level_filters_events() {
        let dir = TempDir::new().unwrap();
        let logger = logger_in(&dir, "warn");
        logger.log(&logger.event(EventType::Update, LogLevel::Info));
        logger.log(&logger.event(EventType::Error, LogLevel::Error));
        let entries = logger.tail_entries(10, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, EventType::Error);
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let logger = StructuredLogger::disabled();
        logger.log(&logger.event(EventType::Error, LogLevel::Error));
        logger.flush();
    }

    #[test]
    fn cleanup_removes_only_old_dated_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("2000-01-01.jsonl"), "{}\n").unwrap();
        std::fs::write(dir.path().join("notes.jsonl"), "{}\n").unwrap();
        let logger = logger_in(&dir, "info");
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        std::fs::write(dir.path().join(format!("{today}.jsonl")), "").unwrap();

        logger.cleanup_old_logs();

        assert!(!dir.path().join("2000-01-01.jsonl").exists());
        assert!(dir.path().join("notes.jsonl").exists());
        assert!(dir.path().join(format!("{today}.jsonl")).exists());
    }

    #[test]
    fn parse_logs_args_variants() {
        assert_eq!(
            parse_logs_args(&[]),
            LogsCommand { count: 20, event_type_filter: None }
        );
        assert_eq!(
            parse_logs_args(&["50", "retry"]),
            LogsCommand { count: 50, event_type_filter: Some(EventType::Retry) }
        );
        assert_eq!(parse_logs_args(&["99999"]).count, 1000);
        assert_eq!(parse_logs_args(&["bogus"]).event_type_filter, None);
    }

    #[test]
    fn truncate_chars_respects_utf8() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("ääääää", 3), "äää...");
    }

    #[test]
    fn display_formatting_contains_fields() {
        let event = LogEvent::new("r", EventType::AccessDenied, LogLevel::Warn)
            .with_chat(42)
            .with_detail("rejected");
        let out = StructuredLogger::format_entries_for_display(&[event]);
        assert!(out.contains("WARN"));
        assert!(out.contains("access_denied"));
        assert!(out.contains("chat=42"));
        assert!(out.contains("\"rejected\""));
        assert_eq!(
            StructuredLogger::format_entries_for_display(&[]),
            "No log entries found."
        );
    }
}
