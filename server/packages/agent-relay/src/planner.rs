use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent_relay_error::RelayError;
use agent_relay_sandbox::SandboxRef;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::bus::SessionBus;
use crate::events::{
    DoneData, EventPayload, InvocationStatus, MessageDeltaData, PlanStepSnapshot, PlanUpdateData,
    SessionEventType, StepStatus, StepUpdateData, ToolInvocationData, TurnOutcome,
};
use crate::provider::{Action, ModelProvider, TurnContext};
use crate::session::{Message, MessageRole, Session, SessionStatus};
use crate::tools::{SessionToolState, ToolGateway};

/// Hard ceiling on model round-trips per turn. A provider that never
/// finishes ends the turn as failed instead of spinning.
const MAX_ROUNDS: usize = 16;

const SYSTEM_PROMPT: &str = "You are an agent working inside an isolated sandbox. \
Plan your work as explicit steps, run one tool at a time, and report what you find.";

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub description: String,
    pub status: StepStatus,
    pub reason: Option<String>,
    pub invocation_seq: Option<u64>,
}

/// Ordered steps for one turn. Steps are appended or updated in place,
/// never reordered; at most one is running at a time.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    steps: Vec<PlanStep>,
}

impl Plan {
    pub fn from_descriptions(descriptions: Vec<String>) -> Self {
        Self {
            steps: descriptions
                .into_iter()
                .map(|description| PlanStep {
                    description,
                    status: StepStatus::Pending,
                    reason: None,
                    invocation_seq: None,
                })
                .collect(),
        }
    }

    pub fn snapshot(&self) -> Vec<PlanStepSnapshot> {
        self.steps
            .iter()
            .enumerate()
            .map(|(index, step)| PlanStepSnapshot {
                index,
                description: step.description.clone(),
                status: step.status,
            })
            .collect()
    }

    pub fn first_pending(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.status == StepStatus::Pending)
    }

    pub fn has_pending_step(&self) -> bool {
        self.first_pending().is_some()
    }

    pub fn has_failed_step(&self) -> bool {
        self.steps
            .iter()
            .any(|step| step.status == StepStatus::Failed)
    }

    pub fn running_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Running)
            .count()
    }

    /// Updates one step and returns the event payload describing the
    /// transition. Out-of-range indexes return `None`.
    pub fn mark_step(
        &mut self,
        index: usize,
        status: StepStatus,
        reason: Option<String>,
    ) -> Option<StepUpdateData> {
        let step = self.steps.get_mut(index)?;
        step.status = status;
        step.reason = reason.clone();
        Some(StepUpdateData {
            step_index: index,
            description: step.description.clone(),
            status,
            reason,
        })
    }

    pub fn set_invocation(&mut self, index: usize, invocation_seq: u64) {
        if let Some(step) = self.steps.get_mut(index) {
            step.invocation_seq = Some(invocation_seq);
        }
    }
}

/// Cooperative stop flag shared between a session's turn task and the
/// supervisor. `request` is idempotent; `stopped` resolves once a stop has
/// been requested, tolerating a request that lands between the flag check
/// and parking on the notify.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub async fn stopped(&self) {
        while !self.is_requested() {
            self.notify.notified().await;
        }
    }
}

#[derive(Debug)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    pub assistant: Option<Message>,
}

/// Runs one conversation turn for one session: alternates model calls and
/// action execution, publishing an event for every transition before the
/// next iteration starts. The caller holds the session's turn lock for the
/// duration, so turns on the same session never interleave.
pub struct TurnRunner {
    pub session_id: String,
    pub record: Arc<Mutex<Session>>,
    pub bus: SessionBus,
    pub gateway: Arc<ToolGateway>,
    pub tool_state: Arc<SessionToolState>,
    pub sandbox: SandboxRef,
    pub provider: Arc<dyn ModelProvider>,
    pub stop: StopSignal,
}

impl TurnRunner {
    pub async fn run(self, incoming: Vec<Message>) -> TurnResult {
        {
            let mut record = self.record.lock().await;
            if record.messages.is_empty() {
                record
                    .messages
                    .push(Message::new(MessageRole::System, SYSTEM_PROMPT));
            }
            record.messages.extend(incoming);
            if record.status.can_transition_to(SessionStatus::Running) {
                record.status = SessionStatus::Running;
            }
            record.touch();
        }

        let mut plan: Option<Plan> = None;
        let mut said_text = false;
        let mut last_invocation: Option<ToolInvocationData> = None;
        let mut assistant_text = String::new();
        let mut outcome = TurnOutcome::Completed;
        let mut summary: Option<String> = None;
        let mut fatal = false;
        let mut finished = false;

        for round in 0..MAX_ROUNDS {
            if self.stop.is_requested() {
                outcome = TurnOutcome::Stopped;
                break;
            }

            let messages = { self.record.lock().await.messages.clone() };
            let context = TurnContext {
                messages: &messages,
                plan: plan.as_ref(),
                last_invocation: last_invocation.as_ref(),
                said_text,
                round,
            };

            let decided = tokio::select! {
                _ = self.stop.stopped() => {
                    outcome = TurnOutcome::Stopped;
                    break;
                }
                decided = self.provider.next_action(&context) => decided,
            };
            let action = match decided {
                Ok(action) => action,
                Err(error) => {
                    warn!(
                        session_id = %self.session_id,
                        provider = self.provider.name(),
                        error = %error,
                        "model provider failed"
                    );
                    self.publish_error(&error).await;
                    outcome = TurnOutcome::Failed;
                    summary = Some(error.to_string());
                    fatal = true;
                    break;
                }
            };

            match action {
                Action::Say { text } => {
                    if !assistant_text.is_empty() {
                        assistant_text.push_str("\n\n");
                    }
                    assistant_text.push_str(&text);
                    said_text = true;
                    self.bus
                        .publish(
                            SessionEventType::MessageDelta,
                            EventPayload::MessageDelta(MessageDeltaData { delta: text }),
                        )
                        .await;
                }
                Action::Plan { steps } => {
                    let next = Plan::from_descriptions(steps);
                    self.publish_plan(&next).await;
                    plan = Some(next);
                }
                Action::ToolCall { tool, arguments } => {
                    let step_index = match plan.as_mut().and_then(|plan| plan.first_pending()) {
                        Some(index) => index,
                        None => {
                            // Tool call without a pending step gets an
                            // implicit single-step plan.
                            let implicit =
                                Plan::from_descriptions(vec![format!("Run {tool}")]);
                            self.publish_plan(&implicit).await;
                            plan = Some(implicit);
                            0
                        }
                    };
                    let Some(plan) = plan.as_mut() else { break };

                    if let Some(update) = plan.mark_step(step_index, StepStatus::Running, None) {
                        self.publish_step(update).await;
                    }

                    let dispatched =
                        self.gateway
                            .execute(&self.tool_state, &self.sandbox, &tool, &arguments);
                    let result = tokio::select! {
                        _ = self.stop.stopped() => {
                            // The sandbox call may still complete on its
                            // own; its result is discarded, not applied.
                            outcome = TurnOutcome::Stopped;
                            break;
                        }
                        result = dispatched => result,
                    };

                    match result {
                        Ok(invocation) => {
                            self.bus
                                .publish(
                                    SessionEventType::ToolInvocation,
                                    EventPayload::ToolInvocation(invocation.clone()),
                                )
                                .await;
                            {
                                let mut record = self.record.lock().await;
                                record.tool_invocations.push(invocation.clone());
                                record.touch();
                            }
                            let update = match invocation.status {
                                InvocationStatus::Completed => {
                                    plan.set_invocation(step_index, invocation.invocation_seq);
                                    plan.mark_step(step_index, StepStatus::Done, None)
                                }
                                _ => plan.mark_step(
                                    step_index,
                                    StepStatus::Failed,
                                    invocation.error.clone(),
                                ),
                            };
                            if let Some(update) = update {
                                self.publish_step(update).await;
                            }
                            last_invocation = Some(invocation);
                        }
                        Err(error) => match &error {
                            RelayError::Timeout { .. } => {
                                if let Some(update) = plan.mark_step(
                                    step_index,
                                    StepStatus::Failed,
                                    Some("timeout".to_string()),
                                ) {
                                    self.publish_step(update).await;
                                }
                                last_invocation =
                                    Some(failed_invocation(&tool, &arguments, &error));
                            }
                            RelayError::UnknownTool { .. } | RelayError::Validation { .. } => {
                                self.publish_error(&error).await;
                                if let Some(update) = plan.mark_step(
                                    step_index,
                                    StepStatus::Failed,
                                    Some(error.kind().as_str().to_string()),
                                ) {
                                    self.publish_step(update).await;
                                }
                                last_invocation =
                                    Some(failed_invocation(&tool, &arguments, &error));
                            }
                            _ => {
                                // Transport or internal failure: the turn
                                // cannot proceed without its sandbox.
                                self.publish_error(&error).await;
                                outcome = TurnOutcome::Failed;
                                summary = Some(error.to_string());
                                fatal = true;
                                break;
                            }
                        },
                    }
                }
                Action::Finish {
                    summary: turn_summary,
                } => {
                    outcome = if plan.as_ref().is_some_and(Plan::has_failed_step) {
                        TurnOutcome::Failed
                    } else {
                        TurnOutcome::Completed
                    };
                    summary = turn_summary;
                    finished = true;
                    break;
                }
            }
        }

        if outcome == TurnOutcome::Stopped {
            debug!(session_id = %self.session_id, "turn unwound after stop request");
            // Terminal event and final status belong to the stop
            // orchestration; partial output is discarded, not applied.
            return TurnResult {
                outcome,
                assistant: None,
            };
        }

        if !finished && !fatal && outcome == TurnOutcome::Completed {
            outcome = TurnOutcome::Failed;
            summary = Some(format!("turn ended after {MAX_ROUNDS} rounds without completion"));
        }

        if assistant_text.is_empty() {
            if let Some(summary) = &summary {
                assistant_text = summary.clone();
            }
        }
        let assistant = (!assistant_text.is_empty())
            .then(|| Message::new(MessageRole::Assistant, assistant_text));

        {
            let mut record = self.record.lock().await;
            if let Some(message) = &assistant {
                record.messages.push(message.clone());
            }
            let next = if fatal {
                SessionStatus::Error
            } else {
                SessionStatus::Idle
            };
            if record.status.can_transition_to(next) {
                record.status = next;
            }
            record.touch();
        }

        self.bus
            .publish(
                SessionEventType::Done,
                EventPayload::Done(DoneData {
                    outcome,
                    summary: summary.clone(),
                }),
            )
            .await;

        TurnResult { outcome, assistant }
    }

    async fn publish_plan(&self, plan: &Plan) {
        self.bus
            .publish(
                SessionEventType::PlanUpdate,
                EventPayload::PlanUpdate(PlanUpdateData {
                    steps: plan.snapshot(),
                }),
            )
            .await;
    }

    async fn publish_step(&self, update: StepUpdateData) {
        self.bus
            .publish(SessionEventType::StepUpdate, EventPayload::StepUpdate(update))
            .await;
    }

    async fn publish_error(&self, error: &RelayError) {
        self.bus
            .publish(SessionEventType::Error, EventPayload::Error(error.into()))
            .await;
    }
}

/// In-memory record for the provider's context when the gateway returned an
/// error instead of a resolved invocation. Never published.
fn failed_invocation(tool: &str, arguments: &Value, error: &RelayError) -> ToolInvocationData {
    let now = Utc::now().to_rfc3339();
    ToolInvocationData {
        invocation_seq: 0,
        tool: tool.to_string(),
        arguments: arguments.clone(),
        status: InvocationStatus::Failed,
        result: None,
        error: Some(error.to_string()),
        started_at: now.clone(),
        completed_at: Some(now),
    }
}
