//! The Telegram bot: polling, per-thread conversation context, the
//! known-user store, and the completion backend.
//!
//! ## Flow
//!
//! `telegram::run_poller` long-polls `getUpdates` and hands each text
//! message to `controller::BotController`. The controller checks the chat
//! allow-list (`access`) and dispatches on the command: `/mint` opens a
//! thread, replies to a bot message continue one, `/reloadusers` and
//! `/id` are answered directly.
//!
//! Replies come from `generator::ResponseGenerator`, which builds the
//! prompt from the system prompt, the known-users section (`users`) and
//! the thread history (`threads`, trimmed by `context`), then drives the
//! tool loop against `backend`. The model can update user profiles through
//! the `update_user_profile` tool (`profile_tool`).
//!
//! ## Background work
//!
//! `maintenance` evicts idle threads and flushes the user store on
//! timers. `console` is an optional stdin operator interface. Everything
//! is logged as JSON lines by `structured_log`.
//!
//! ## Persistence
//!
//! Thread snapshots (JSON) and known users (YAML) are written with
//! `persist::atomic_write`, so a crash never leaves a half-written file.

pub mod access;
pub mod backend;
pub mod config;
pub mod console;
pub mod context;
pub mod controller;
pub mod error;
pub mod generator;
pub mod maintenance;
pub mod persist;
pub mod profile_tool;
pub mod structured_log;
pub mod telegram;
pub mod threads;
pub mod users;
