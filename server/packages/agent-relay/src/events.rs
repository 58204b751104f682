use agent_relay_error::ErrorBody;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// One entry in a session's ordered event log. Offsets are assigned by the
/// session's event log, are gapless, and start at 0.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionEvent {
    pub event_id: String,
    pub offset: u64,
    pub time: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: SessionEventType,
    pub data: EventPayload,
}

impl SessionEvent {
    pub fn new(
        session_id: &str,
        offset: u64,
        event_type: SessionEventType,
        data: EventPayload,
    ) -> Self {
        Self {
            event_id: format!("evt_{offset}"),
            offset,
            time: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            event_type,
            data,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type == SessionEventType::Done
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub enum SessionEventType {
    #[serde(rename = "message.delta")]
    MessageDelta,
    #[serde(rename = "plan.update")]
    PlanUpdate,
    #[serde(rename = "step.update")]
    StepUpdate,
    #[serde(rename = "tool.invocation")]
    ToolInvocation,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "done")]
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum EventPayload {
    MessageDelta(MessageDeltaData),
    PlanUpdate(PlanUpdateData),
    StepUpdate(StepUpdateData),
    ToolInvocation(ToolInvocationData),
    Error(ErrorBody),
    Done(DoneData),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageDeltaData {
    pub delta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PlanUpdateData {
    pub steps: Vec<PlanStepSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PlanStepSnapshot {
    pub index: usize,
    pub description: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct StepUpdateData {
    pub step_index: usize,
    pub description: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

/// Record of one dispatched tool call. Also the `data` payload of
/// `tool.invocation` events, published once the call resolves.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ToolInvocationData {
    pub invocation_seq: u64,
    pub tool: String,
    pub arguments: Value,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct DoneData {
    pub outcome: TurnOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Stopped,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape_uses_dotted_type_names() {
        let event = SessionEvent::new(
            "ses_test",
            3,
            SessionEventType::StepUpdate,
            EventPayload::StepUpdate(StepUpdateData {
                step_index: 0,
                description: "list files".to_string(),
                status: StepStatus::Running,
                reason: None,
            }),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step.update");
        assert_eq!(value["event_id"], "evt_3");
        assert_eq!(value["offset"], 3);
        assert_eq!(value["data"]["status"], "running");
        assert!(value["data"].get("reason").is_none());
    }

    #[test]
    fn payloads_deserialize_to_their_own_variant() {
        let event: SessionEvent = serde_json::from_value(serde_json::json!({
            "event_id": "evt_5",
            "offset": 5,
            "time": "2026-01-01T00:00:00+00:00",
            "session_id": "ses_test",
            "type": "done",
            "data": { "outcome": "stopped" }
        }))
        .unwrap();
        assert!(event.is_terminal());
        match event.data {
            EventPayload::Done(done) => assert_eq!(done.outcome, TurnOutcome::Stopped),
            other => panic!("expected done payload, got {other:?}"),
        }
    }
}
