//! Tool trait and registry for model-invoked functions.
//!
//! Every tool the model may call implements `Tool`: a name, a
//! description, a JSON Schema for its parameters, and an async execute
//! method. `ToolRegistry` turns the registered tools into the
//! `tools` array of a chat-completion request and routes the model's
//! calls back to them.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Result returned by tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// JSON body sent back to the model as the tool message content.
    pub fn to_content(&self) -> String {
        let body = if self.success {
            json!({ "success": true, "result": self.output })
        } else {
            json!({
                "success": false,
                "error": self.error.as_deref().unwrap_or("unknown error"),
            })
        };
        body.to_string()
    }
}

/// Trait that all model-callable tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's unique name (used in API tool_call messages).
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value) -> Result<ToolExecutionResult>;
}

/// The set of tools offered to the model on a request.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    /// OpenAI `tools` array.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    }
                })
            })
            .collect()
    }

    /// Run the tool `name` with raw JSON `arguments` as sent by the model.
    ///
    /// Unknown tools, unparseable arguments and execution errors all
    /// come back as a failed result so the turn can continue.
    pub async fn dispatch(&self, name: &str, arguments: &str) -> ToolExecutionResult {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            return ToolExecutionResult::failed(format!("Function {name} not found."));
        };

        let args: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(arguments) {
                Ok(v) => v,
                Err(e) => return ToolExecutionResult::failed(format!("Invalid JSON arguments: {e}")),
            }
        };

        match tool.execute(args).await {
            Ok(result) => result,
            Err(e) => ToolExecutionResult::failed(format!("Failed to execute tool: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text argument."
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Value) -> Result<ToolExecutionResult> {
            match args["text"].as_str() {
                Some(text) => Ok(ToolExecutionResult::ok(text)),
                None => anyhow::bail!("missing text"),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Box::new(EchoTool));
        reg
    }

    #[test]
    fn definitions_use_function_format() {
        let defs = registry().definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["type"], "function");
        assert_eq!(defs[0]["function"]["name"], "echo");
        assert_eq!(defs[0]["function"]["parameters"]["required"][0], "text");
    }

    #[tokio::test]
    async fn dispatch_runs_known_tool() {
        let result = registry().dispatch("echo", r#"{"text": "hi"}"#).await;
        assert!(result.success);
        assert_eq!(result.output, "hi");
    }

    #[tokio::test]
    async fn dispatch_failures_become_results() {
        let reg = registry();

        let unknown = reg.dispatch("nope", "{}").await;
        assert!(!unknown.success);
        assert!(unknown.error.unwrap().contains("not found"));

        let bad_json = reg.dispatch("echo", "{text:").await;
        assert!(bad_json.error.unwrap().starts_with("Invalid JSON arguments"));

        let exec_err = reg.dispatch("echo", "{}").await;
        assert!(exec_err.error.unwrap().contains("missing text"));
    }

    #[test]
    fn content_is_json() {
        let ok: Value = serde_json::from_str(&ToolExecutionResult::ok("done").to_content()).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["result"], "done");

        let err: Value =
            serde_json::from_str(&ToolExecutionResult::failed("boom").to_content()).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "boom");
    }
}
