//! mintbot: a Telegram group-chat bot in front of an OpenAI-compatible
//! completion backend.
//!
//! See [`bot`] for the module map.

pub mod bot;
pub mod tools;
