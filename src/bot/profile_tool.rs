//! `update_user_profile`: lets the model remember facts about users.
//!
//! The model passes the numeric user id it saw in a `[User ID: N]`
//! prefix, a replacement description and optionally a name. A change is
//! written to disk straight away so it survives a crash before the next
//! periodic flush.

use crate::bot::structured_log::{EventType, LogLevel, StructuredLogger};
use crate::bot::users::{ProfileUpdate, UserStore};
use crate::tools::{Tool, ToolExecutionResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const TOOL_NAME: &str = "update_user_profile";

pub struct UpdateUserProfileTool {
    store: Arc<Mutex<UserStore>>,
    logger: StructuredLogger,
}

impl UpdateUserProfileTool {
    pub fn new(store: Arc<Mutex<UserStore>>, logger: StructuredLogger) -> Self {
        Self { store, logger }
    }
}

/// Models sometimes quote numbers; accept both.
fn parse_user_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl Tool for UpdateUserProfileTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Update or add information about a known user. Use this to remember \
         details about users based on the conversation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {
                    "type": "integer",
                    "description": "The Telegram User ID of the user whose profile is to be updated."
                },
                "description": {
                    "type": "string",
                    "description": "A new or updated concise description of the user, summarizing \
                                    key characteristics or preferences learned. Replaces any old description."
                },
                "name": {
                    "type": "string",
                    "description": "The user's preferred name or nickname, if learned or confirmed."
                }
            },
            "required": ["user_id", "description"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolExecutionResult> {
        let Some(user_id) = parse_user_id(&args["user_id"]) else {
            return Ok(ToolExecutionResult::failed(
                "user_id is required and must be an integer",
            ));
        };
        let Some(description) = args["description"].as_str() else {
            return Ok(ToolExecutionResult::failed("description is required"));
        };
        let name = args["name"]
            .as_str()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        let update = ProfileUpdate {
            name,
            description: Some(description.trim().to_string()),
        };

        let mut store = self.store.lock().await;
        if !store.upsert(user_id, update) {
            return Ok(ToolExecutionResult::ok(format!(
                "User {user_id} profile already up to date."
            )));
        }

        let saved = match store.persist().await {
            Ok(()) => true,
            Err(e) => {
                self.logger.log_and_stderr(
                    &self
                        .logger
                        .event(EventType::UserStore, LogLevel::Warn)
                        .with_user(user_id)
                        .with_detail(&format!("persist after tool update failed: {e:#}")),
                    &format!("Warning: could not save known users: {e:#}"),
                );
                false
            }
        };
        drop(store);

        self.logger.log(
            &self
                .logger
                .event(EventType::ToolCall, LogLevel::Info)
                .with_user(user_id)
                .with_detail(&format!("{TOOL_NAME} saved={saved}")),
        );

        Ok(ToolExecutionResult::ok(format!(
            "User {user_id} profile updated (saved to disk: {saved})."
        )))
    }
}
