use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New Session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Idle,
    Stopping,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Created, Running) | (Created, Stopping) | (Created, Error) => true,
            (Running, Idle) | (Running, Stopping) | (Running, Error) => true,
            (Idle, Running) | (Idle, Stopping) | (Idle, Error) => true,
            (Error, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            role,
            content: content.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Authoritative session record. Only the registry mutates it; the Planning
/// Loop appends messages through the registry while a turn runs.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub status: SessionStatus,
    pub messages: Vec<Message>,
    pub tool_invocations: Vec<crate::events::ToolInvocationData>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("ses_{}", Uuid::new_v4().simple()),
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            status: SessionStatus::Created,
            messages: Vec::new(),
            tool_invocations: Vec::new(),
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.last_activity_at = now;
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity_at
    }

    pub fn latest_message_preview(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| matches!(message.role, MessageRole::User | MessageRole::Assistant))
            .map(|message| {
                let mut preview: String = message.content.chars().take(120).collect();
                if message.content.chars().count() > 120 {
                    preview.push_str("...");
                }
                preview
            })
    }

    pub fn detail(&self) -> SessionDetail {
        SessionDetail {
            session_id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            messages: self.messages.clone(),
            tool_invocations: self.tool_invocations.clone(),
            created_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
            last_activity_at: self.last_activity_at.to_rfc3339(),
        }
    }

    pub fn summary(&self, event_count: u64) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            message_count: self.messages.len(),
            event_count,
            latest_message: self.latest_message_preview(),
            created_at: self.created_at.to_rfc3339(),
            updated_at: self.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionDetail {
    pub session_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub messages: Vec<Message>,
    pub tool_invocations: Vec<crate::events::ToolInvocationData>,
    pub created_at: String,
    pub updated_at: String,
    pub last_activity_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub message_count: usize,
    pub event_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
