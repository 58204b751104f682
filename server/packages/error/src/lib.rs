use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UnknownTool,
    NotFound,
    Timeout,
    SandboxUnavailable,
    CapacityExceeded,
    StreamGap,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::UnknownTool => "unknown_tool",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::SandboxUnavailable => "sandbox_unavailable",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::StreamGap => "stream_gap",
            Self::Internal => "internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Validation => "Validation Failed",
            Self::UnknownTool => "Unknown Tool",
            Self::NotFound => "Not Found",
            Self::Timeout => "Timeout",
            Self::SandboxUnavailable => "Sandbox Unavailable",
            Self::CapacityExceeded => "Capacity Exceeded",
            Self::StreamGap => "Stream Gap",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::UnknownTool => 400,
            Self::NotFound => 404,
            Self::Timeout => 504,
            Self::SandboxUnavailable => 502,
            Self::CapacityExceeded => 429,
            Self::StreamGap => 410,
            Self::Internal => 500,
        }
    }
}

/// Body placed in the `data` field of an error envelope, and in the payload
/// of `error` events on the session stream.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    #[schema(value_type = Object)]
    pub details: Map<String, Value>,
}

/// Response envelope for failed API calls. `code` mirrors the HTTP status;
/// successful calls use `code = 0` (see the API package's success envelope).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorEnvelope {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorBody>,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: String, details: Map<String, Value>) -> Self {
        Self {
            code: kind.status_code(),
            message: message.clone(),
            data: Some(ErrorBody {
                kind,
                message,
                details,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    Validation { message: String },
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("sandbox unavailable: {message}")]
    SandboxUnavailable { message: String },
    #[error("sandbox capacity exceeded: limit is {limit}")]
    CapacityExceeded { limit: usize },
    #[error("offset {requested} is older than the retained window (oldest is {oldest})")]
    StreamGap { requested: u64, oldest: u64 },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::UnknownTool { .. } => ErrorKind::UnknownTool,
            Self::SessionNotFound { .. } => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::SandboxUnavailable { .. } => ErrorKind::SandboxUnavailable,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::StreamGap { .. } => ErrorKind::StreamGap,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        let mut details = Map::new();
        match self {
            Self::Validation { .. } => {}
            Self::UnknownTool { tool } => {
                details.insert("tool".to_string(), Value::String(tool.clone()));
            }
            Self::SessionNotFound { session_id } => {
                details.insert("session_id".to_string(), Value::String(session_id.clone()));
            }
            Self::Timeout { seconds } => {
                details.insert("seconds".to_string(), Value::Number((*seconds).into()));
            }
            Self::SandboxUnavailable { .. } => {}
            Self::CapacityExceeded { limit } => {
                details.insert("limit".to_string(), Value::Number((*limit as u64).into()));
            }
            Self::StreamGap { requested, oldest } => {
                details.insert("requested".to_string(), Value::Number((*requested).into()));
                details.insert("oldest".to_string(), Value::Number((*oldest).into()));
            }
            Self::Internal { .. } => {}
        }
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            details,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        let body = self.to_error_body();
        ErrorEnvelope {
            code: self.kind().status_code(),
            message: body.message.clone(),
            data: Some(body),
        }
    }
}

impl From<RelayError> for ErrorEnvelope {
    fn from(value: RelayError) -> Self {
        value.to_envelope()
    }
}

impl From<&RelayError> for ErrorEnvelope {
    fn from(value: &RelayError) -> Self {
        value.to_envelope()
    }
}

impl From<RelayError> for ErrorBody {
    fn from(value: RelayError) -> Self {
        value.to_error_body()
    }
}

impl From<&RelayError> for ErrorBody {
    fn from(value: &RelayError) -> Self {
        value.to_error_body()
    }
}
