use std::collections::HashMap;
use std::sync::Arc;

use agent_relay_error::RelayError;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::events::{InvocationStatus, ToolInvocationData};
use crate::planner::Plan;
use crate::session::{Message, MessageRole};

/// Next move decided by the model for one loop iteration. Closed set: a
/// new kind of action is a compile-time change in the Planning Loop.
#[derive(Debug, Clone)]
pub enum Action {
    /// Emit assistant text.
    Say { text: String },
    /// Declare or replace the plan for this turn.
    Plan { steps: Vec<String> },
    /// Invoke a named tool; the loop binds the call to the current step.
    ToolCall { tool: String, arguments: Value },
    /// End the turn.
    Finish { summary: Option<String> },
}

/// Everything the provider sees when deciding the next action.
pub struct TurnContext<'a> {
    pub messages: &'a [Message],
    pub plan: Option<&'a Plan>,
    pub last_invocation: Option<&'a ToolInvocationData>,
    pub said_text: bool,
    pub round: usize,
}

impl TurnContext<'_> {
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.as_str())
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn next_action(&self, context: &TurnContext<'_>) -> Result<Action, RelayError>;
}

/// Name-keyed provider set; the chat request's `provider` field selects one.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(MockProvider));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ModelProvider>, RelayError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::Validation {
                message: format!("unknown provider `{name}`"),
            })
    }

    pub fn default_name(&self) -> &'static str {
        MOCK_PROVIDER_NAME
    }
}

pub const MOCK_PROVIDER_NAME: &str = "mock";

/// Deterministic scripted provider. Plans one step for recognizable
/// requests, runs the matching tool, then summarizes; everything else gets
/// a plain text reply. Exists so agent flows run end to end without any
/// external model.
pub struct MockProvider;

struct ToolRequest {
    description: String,
    tool: String,
    arguments: Value,
}

impl MockProvider {
    fn parse_tool_request(content: &str) -> Option<ToolRequest> {
        let lowered = content.to_lowercase();

        if let Some(rest) = lowered.strip_prefix("list files in ") {
            let path = rest.trim().trim_end_matches('.');
            return Some(ToolRequest {
                description: format!("List files in {path}"),
                tool: "run_terminal_cmd".to_string(),
                arguments: json!({ "command": format!("ls {path}") }),
            });
        }

        if lowered.starts_with("run ") {
            let command = content["run ".len()..].trim().trim_matches('`');
            if !command.is_empty() {
                return Some(ToolRequest {
                    description: format!("Run `{command}`"),
                    tool: "run_terminal_cmd".to_string(),
                    arguments: json!({ "command": command }),
                });
            }
        }

        if lowered.starts_with("read ") {
            let path = content["read ".len()..].trim();
            if path.starts_with('/') {
                return Some(ToolRequest {
                    description: format!("Read {path}"),
                    tool: "read_file".to_string(),
                    arguments: json!({ "file_path": path }),
                });
            }
        }

        // "use the <name> tool" requests the capability verbatim, letting
        // callers exercise the unknown-tool path.
        if let Some(rest) = lowered.strip_prefix("use the ") {
            if let Some(tool) = rest.strip_suffix(" tool") {
                let tool = tool.trim().replace(' ', "_");
                return Some(ToolRequest {
                    description: format!("Use the {tool} tool"),
                    tool,
                    arguments: json!({}),
                });
            }
        }

        if lowered.contains("what time") || lowered.contains("current time") {
            return Some(ToolRequest {
                description: "Check the current time".to_string(),
                tool: "current_time".to_string(),
                arguments: json!({}),
            });
        }

        None
    }

    fn summarize_result(invocation: &ToolInvocationData) -> String {
        match invocation.status {
            InvocationStatus::Completed => {
                let rendered = invocation
                    .result
                    .as_ref()
                    .map(render_result)
                    .unwrap_or_default();
                if rendered.is_empty() {
                    format!("`{}` completed.", invocation.tool)
                } else {
                    format!("`{}` returned:\n{rendered}", invocation.tool)
                }
            }
            InvocationStatus::Failed => format!(
                "`{}` failed: {}",
                invocation.tool,
                invocation.error.as_deref().unwrap_or("unknown error")
            ),
            InvocationStatus::Running => format!("`{}` is still running.", invocation.tool),
        }
    }
}

fn render_result(result: &Value) -> String {
    if let Some(text) = result.as_str() {
        return text.trim_end().to_string();
    }
    for key in ["stdout", "output", "content", "time"] {
        if let Some(text) = result.get(key).and_then(|v| v.as_str()) {
            return text.trim_end().to_string();
        }
    }
    result.to_string()
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &'static str {
        MOCK_PROVIDER_NAME
    }

    async fn next_action(&self, context: &TurnContext<'_>) -> Result<Action, RelayError> {
        let request = context
            .last_user_content()
            .and_then(Self::parse_tool_request);

        match (context.plan, request) {
            // Tool-shaped request, no plan yet: declare one.
            (None, Some(request)) => Ok(Action::Plan {
                steps: vec![request.description],
            }),
            (Some(plan), Some(request)) => {
                if plan.has_pending_step() {
                    return Ok(Action::ToolCall {
                        tool: request.tool,
                        arguments: request.arguments,
                    });
                }
                if plan.has_failed_step() {
                    // No fallback for the scripted flows: close the turn
                    // with the failure in the summary.
                    let failure = context
                        .last_invocation
                        .map(Self::summarize_result)
                        .unwrap_or_else(|| "a step failed".to_string());
                    return Ok(Action::Finish {
                        summary: Some(failure),
                    });
                }
                if !context.said_text {
                    let summary = context
                        .last_invocation
                        .map(Self::summarize_result)
                        .unwrap_or_else(|| "All steps completed.".to_string());
                    return Ok(Action::Say { text: summary });
                }
                Ok(Action::Finish {
                    summary: Some("Plan completed.".to_string()),
                })
            }
            // Plain conversation: one reply, then finish.
            (None, None) => {
                if context.said_text {
                    Ok(Action::Finish { summary: None })
                } else {
                    let reply = match context.last_user_content() {
                        Some(content) => format!("You said: {content}"),
                        None => "Hello! Tell me what to do in the sandbox.".to_string(),
                    };
                    Ok(Action::Say { text: reply })
                }
            }
            (Some(plan), None) => {
                if plan.has_failed_step() || plan.has_pending_step() {
                    Ok(Action::Finish {
                        summary: Some("Plan abandoned.".to_string()),
                    })
                } else {
                    Ok(Action::Finish {
                        summary: Some("Plan completed.".to_string()),
                    })
                }
            }
        }
    }
}
