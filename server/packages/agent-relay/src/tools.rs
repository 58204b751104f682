use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agent_relay_error::RelayError;
use agent_relay_sandbox::{ExecuteResult, SandboxRef};
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::events::{InvocationStatus, ToolInvocationData};

pub type InProcessHandler = fn(&Value) -> Result<Value, String>;

#[derive(Debug, Clone, Copy)]
pub enum ToolKind {
    /// Dispatched to the session's sandbox over the execute RPC.
    Sandboxed,
    /// Pure computation handled inside this process.
    InProcess(InProcessHandler),
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub kind: ToolKind,
}

/// Wire shape for `GET /v1/tools`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn builtin() -> Self {
        Self {
            tools: vec![
                ToolSpec {
                    name: "run_terminal_cmd",
                    description: "Run a shell command inside the session sandbox",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "command": { "type": "string", "description": "Command to execute" },
                            "cwd": { "type": "string", "description": "Working directory" }
                        },
                        "required": ["command"]
                    }),
                    kind: ToolKind::Sandboxed,
                },
                ToolSpec {
                    name: "read_file",
                    description: "Read a file from the sandbox filesystem; paths must be absolute",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "file_path": { "type": "string", "description": "Absolute path" },
                            "start_line": { "type": "integer", "description": "1-based first line" },
                            "limit": { "type": "integer", "description": "Maximum lines to return" }
                        },
                        "required": ["file_path"]
                    }),
                    kind: ToolKind::Sandboxed,
                },
                ToolSpec {
                    name: "write_file",
                    description: "Write a file in the sandbox filesystem; paths must be absolute",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "file_path": { "type": "string", "description": "Absolute path" },
                            "content": { "type": "string", "description": "Full file content" }
                        },
                        "required": ["file_path", "content"]
                    }),
                    kind: ToolKind::Sandboxed,
                },
                ToolSpec {
                    name: "current_time",
                    description: "Current server time in RFC3339",
                    parameters: json!({
                        "type": "object",
                        "properties": {}
                    }),
                    kind: ToolKind::InProcess(current_time),
                },
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name.to_string(),
                description: tool.description.to_string(),
                parameters: tool.parameters.clone(),
            })
            .collect()
    }
}

fn current_time(_arguments: &Value) -> Result<Value, String> {
    Ok(json!({ "time": Utc::now().to_rfc3339() }))
}

/// Per-session dispatch state owned by the registry: the single-flight lock
/// and the invocation sequence counter.
#[derive(Debug, Default)]
pub struct SessionToolState {
    in_flight: Mutex<()>,
    next_seq: AtomicU64,
}

impl SessionToolState {
    fn next_invocation_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, Clone)]
pub struct ToolGateway {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolGateway {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Resolves and runs one tool call. Validation happens before any
    /// sandbox traffic; the per-session lock keeps a second caller queued
    /// until the first resolves. An `Err` means the tool never produced a
    /// result (unknown, invalid, timed out, or transport down); tool-level
    /// failures come back as an `Ok` record with `status = failed`.
    pub async fn execute(
        &self,
        state: &SessionToolState,
        sandbox: &SandboxRef,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<ToolInvocationData, RelayError> {
        let spec = self
            .registry
            .get(tool_name)
            .ok_or_else(|| RelayError::UnknownTool {
                tool: tool_name.to_string(),
            })?;
        validate_arguments(spec, arguments)?;

        let _turn = state.in_flight.lock().await;
        let invocation_seq = state.next_invocation_seq();
        let started_at = Utc::now().to_rfc3339();

        let outcome = match spec.kind {
            ToolKind::InProcess(handler) => match handler(arguments) {
                Ok(result) => ExecuteResult::Success(result),
                Err(error) => ExecuteResult::Failure(error),
            },
            ToolKind::Sandboxed => {
                match tokio::time::timeout(self.timeout, sandbox.execute(tool_name, arguments))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(RelayError::Timeout {
                            seconds: self.timeout.as_secs(),
                        })
                    }
                }
            }
        };

        let completed_at = Utc::now().to_rfc3339();
        let record = match outcome {
            ExecuteResult::Success(result) => ToolInvocationData {
                invocation_seq,
                tool: tool_name.to_string(),
                arguments: arguments.clone(),
                status: InvocationStatus::Completed,
                result: Some(result),
                error: None,
                started_at,
                completed_at: Some(completed_at),
            },
            ExecuteResult::Failure(error) => ToolInvocationData {
                invocation_seq,
                tool: tool_name.to_string(),
                arguments: arguments.clone(),
                status: InvocationStatus::Failed,
                result: None,
                error: Some(error),
                started_at,
                completed_at: Some(completed_at),
            },
        };
        Ok(record)
    }
}

/// Checks the argument object against the tool's declared schema: required
/// keys must be present, declared property types must match. Extra keys
/// pass through untouched.
fn validate_arguments(spec: &ToolSpec, arguments: &Value) -> Result<(), RelayError> {
    let Some(arguments) = arguments.as_object() else {
        return Err(RelayError::Validation {
            message: format!("arguments for `{}` must be an object", spec.name),
        });
    };

    if let Some(required) = spec.parameters.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if !arguments.contains_key(key) {
                return Err(RelayError::Validation {
                    message: format!("missing required argument `{key}` for tool `{}`", spec.name),
                });
            }
        }
    }

    let Some(properties) = spec.parameters.get("properties").and_then(|v| v.as_object()) else {
        return Ok(());
    };
    for (key, value) in arguments {
        let Some(declared) = properties.get(key).and_then(|p| p.get("type")) else {
            continue;
        };
        let matches = match declared.as_str() {
            Some("string") => value.is_string(),
            Some("integer") => value.is_i64() || value.is_u64(),
            Some("number") => value.is_number(),
            Some("boolean") => value.is_boolean(),
            Some("object") => value.is_object(),
            Some("array") => value.is_array(),
            _ => true,
        };
        if !matches {
            return Err(RelayError::Validation {
                message: format!(
                    "argument `{key}` for tool `{}` must be of type {}",
                    spec.name, declared
                ),
            });
        }
    }
    Ok(())
}
