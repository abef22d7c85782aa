//! Operator console on stdin.
//!
//! ```text
//! help               list commands
//! set_chat <id>      choose the chat `send` writes to
//! state              threads, users, settings
//! send <text>        post a message to the chosen chat
//! logs [N] [type]    tail the structured log
//! quit               shut the bot down
//! ```
//!
//! Lines are read on a dedicated OS thread (stdin is blocking) and
//! handed to an async loop over a channel.

use crate::bot::controller::BotController;
use crate::bot::structured_log::{execute_logs_command, parse_logs_args, EventType, LogsCommand};
use chrono::Utc;
use std::io::BufRead;
use tokio::sync::{mpsc, watch};

pub const HELP: &str = "Available commands:\n\
  help               - show this help\n\
  set_chat <chat_id> - set the chat used by 'send'\n\
  state              - show bot state and active threads\n\
  send <message>     - send a message to the chosen chat\n\
  logs [N] [type]    - show the last N log entries, optionally of one type\n\
  quit               - stop the bot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    SetChat(Option<i64>),
    State,
    Send(String),
    Logs(LogsCommand),
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse_console_line(line: &str) -> ConsoleCommand {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleCommand::Empty;
    }
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    match name.to_lowercase().as_str() {
        "help" => ConsoleCommand::Help,
        "set_chat" => {
            ConsoleCommand::SetChat(rest.split_whitespace().next().and_then(|s| s.parse().ok()))
        }
        "state" => ConsoleCommand::State,
        "send" => ConsoleCommand::Send(rest.to_string()),
        "logs" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            ConsoleCommand::Logs(parse_logs_args(&args))
        }
        "quit" | "exit" => ConsoleCommand::Quit,
        other => ConsoleCommand::Unknown(other.to_string()),
    }
}

pub struct Console {
    controller: BotController,
    manual_chat: Option<i64>,
}

impl Console {
    pub fn new(controller: BotController) -> Self {
        Self {
            controller,
            manual_chat: None,
        }
    }

    /// Run one command and return the text to print.
    pub async fn execute(&mut self, command: ConsoleCommand) -> String {
        match command {
            ConsoleCommand::Empty => String::new(),
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::SetChat(None) => {
                "Usage: set_chat <chat_id> (chat_id must be an integer)".to_string()
            }
            ConsoleCommand::SetChat(Some(chat_id)) => {
                self.manual_chat = Some(chat_id);
                let warning = if self.controller.context().access.is_allowed(chat_id) {
                    ""
                } else {
                    " (not on the allow-list, 'send' will be refused)"
                };
                format!("Manual control chat ID set to: {chat_id}{warning}")
            }
            ConsoleCommand::State => self.state().await,
            ConsoleCommand::Send(text) if text.is_empty() => "Usage: send <message text>".to_string(),
            ConsoleCommand::Send(text) => {
                let Some(chat_id) = self.manual_chat else {
                    return "Manual control chat ID not set. Use 'set_chat <chat_id>'.".to_string();
                };
                match self.controller.send_manual(chat_id, &text).await {
                    Ok(_) => format!("Message sent to chat ID {chat_id}: {text}"),
                    Err(e) => format!("Error sending message: {e}"),
                }
            }
            ConsoleCommand::Logs(cmd) => {
                execute_logs_command(&cmd, &self.controller.context().logger)
            }
            ConsoleCommand::Quit => "Shutting down...".to_string(),
            ConsoleCommand::Unknown(name) => format!("Unknown command: {name}. Type 'help'."),
        }
    }

    async fn state(&self) -> String {
        let ctx = self.controller.context();
        let summaries = ctx.threads.lock().await.summaries(Utc::now());
        let user_count = ctx.users.lock().await.len();
        let allowed: Vec<String> = ctx.access.allowed_ids().map(|id| id.to_string()).collect();

        let mut out = String::from("--- Bot State ---\n");
        out.push_str(&format!("Log level: {}\n", ctx.config.logging.min_level()));
        out.push_str(&format!("Model: {}\n", ctx.generator.model()));
        out.push_str(&format!(
            "Manual control chat ID: {}\n",
            self.manual_chat
                .map(|id| id.to_string())
                .unwrap_or_else(|| "Not Set".to_string())
        ));
        out.push_str(&format!(
            "Allowed chats: {}\n",
            if allowed.is_empty() {
                "none".to_string()
            } else {
                allowed.join(", ")
            }
        ));
        out.push_str(&format!("Known users: {user_count}\n"));
        out.push_str(&format!("Active threads: {}\n", summaries.len()));
        for line in summaries {
            out.push_str(&format!("  - {line}\n"));
        }
        out.push_str("-----------------");
        out
    }
}

/// Read stdin lines on a blocking thread.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// Console loop. `quit` triggers shutdown; EOF just ends the console.
pub async fn run_console(
    controller: BotController,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let logger = controller.context().logger.clone();
    let mut console = Console::new(controller);
    let mut lines = spawn_stdin_reader();

    eprintln!("Console interface started. Type 'help' for commands.");

    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = shutdown_rx.changed() => break,
        };
        let Some(line) = line else {
            logger.debug(EventType::Console, "stdin closed, console stopped");
            break;
        };

        let command = parse_console_line(&line);
        let quit = command == ConsoleCommand::Quit;
        if !matches!(command, ConsoleCommand::Empty) {
            logger.debug(EventType::Console, &format!("console: {}", line.trim()));
        }

        let output = console.execute(command).await;
        if !output.is_empty() {
            println!("{output}");
        }
        if quit {
            logger.info(EventType::Lifecycle, "shutdown requested from console");
            let _ = shutdown_tx.send(true);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::controller::tests::{harness, CHAT};

    #[test]
    fn parses_commands() {
        assert_eq!(parse_console_line("  "), ConsoleCommand::Empty);
        assert_eq!(parse_console_line("HELP"), ConsoleCommand::Help);
        assert_eq!(
            parse_console_line("set_chat -100123"),
            ConsoleCommand::SetChat(Some(-100123))
        );
        assert_eq!(parse_console_line("set_chat abc"), ConsoleCommand::SetChat(None));
        assert_eq!(
            parse_console_line("send hello   there"),
            ConsoleCommand::Send("hello   there".into())
        );
        assert_eq!(parse_console_line("quit"), ConsoleCommand::Quit);
        assert_eq!(
            parse_console_line("frobnicate"),
            ConsoleCommand::Unknown("frobnicate".into())
        );
        match parse_console_line("logs 5 retry") {
            ConsoleCommand::Logs(cmd) => {
                assert_eq!(cmd.count, 5);
                assert_eq!(cmd.event_type_filter, Some(EventType::Retry));
            }
            other => panic!("expected Logs, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_requires_chat_and_allow_list() {
        let h = harness(vec![CHAT], vec![]);
        let mut console = Console::new(h.controller.clone());

        let out = console.execute(ConsoleCommand::Send("hi".into())).await;
        assert!(out.contains("not set"));

        console.execute(ConsoleCommand::SetChat(Some(5))).await;
        let out = console.execute(ConsoleCommand::Send("hi".into())).await;
        assert!(out.starts_with("Error sending message"));
        assert!(h.transport.sent().is_empty());

        console.execute(ConsoleCommand::SetChat(Some(CHAT))).await;
        let out = console.execute(ConsoleCommand::Send("hi all".into())).await;
        assert_eq!(out, format!("Message sent to chat ID {CHAT}: hi all"));
        assert_eq!(h.transport.sent(), vec![(CHAT, "hi all".to_string(), None)]);
    }

    #[tokio::test]
    async fn state_lists_threads() {
        let h = harness(vec![CHAT], vec![]);
        h.controller
            .handle_update(crate::bot::controller::tests::incoming(CHAT, 9, "/mint hey", None))
            .await;

        let mut console = Console::new(h.controller.clone());
        let out = console.execute(ConsoleCommand::State).await;
        assert!(out.contains("Active threads: 1"));
        assert!(out.contains(&format!("{CHAT}:9: 2 messages")));
        assert!(out.contains("Known users: 1"));
        assert!(out.contains(&format!("Allowed chats: {CHAT}")));
    }
}
