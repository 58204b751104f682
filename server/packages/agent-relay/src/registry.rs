use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_relay_error::RelayError;
use agent_relay_sandbox::{SandboxProvisioner, SandboxRef};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::bus::SessionBus;
use crate::events::ToolInvocationData;
use crate::planner::{StopSignal, TurnRunner};
use crate::provider::ModelProvider;
use crate::session::{Message, MessageRole, Session, SessionDetail, SessionStatus, SessionSummary};
use crate::tools::{SessionToolState, ToolGateway};

/// Live state for one session: the authoritative record plus the shared
/// pieces a turn task needs. Cheap to clone; everything inside is shared.
#[derive(Clone)]
pub struct SessionSlot {
    pub session_id: String,
    pub record: Arc<Mutex<Session>>,
    pub bus: SessionBus,
    pub tool_state: Arc<SessionToolState>,
    pub sandbox: SandboxRef,
    pub stop: StopSignal,
    // Held for the duration of a turn; the stop path acquires it to wait
    // for the running turn to unwind.
    pub turn_lock: Arc<Mutex<()>>,
}

/// Counts live per-session sandboxes against the configured ceiling.
/// Shared-sandbox mode never reserves.
#[derive(Debug)]
pub struct AdmissionGuard {
    limit: usize,
    live: AtomicUsize,
}

impl AdmissionGuard {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            live: AtomicUsize::new(0),
        }
    }

    pub fn try_reserve(&self) -> Result<(), RelayError> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < self.limit).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|_| RelayError::CapacityExceeded { limit: self.limit })
    }

    pub fn release(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                live.checked_sub(1)
            });
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Process-wide source of truth for sessions. Every mutation passes through
/// here; the supervisor drives stop/teardown through the slots it hands out.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionSlot>>,
    provisioner: SandboxProvisioner,
    gateway: Arc<ToolGateway>,
    admission: AdmissionGuard,
    event_retention: usize,
}

impl SessionRegistry {
    pub fn new(
        provisioner: SandboxProvisioner,
        gateway: ToolGateway,
        max_sandboxes: usize,
        event_retention: usize,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            provisioner,
            gateway: Arc::new(gateway),
            admission: AdmissionGuard::new(max_sandboxes),
            event_retention,
        }
    }

    pub fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    pub fn provisioner(&self) -> &SandboxProvisioner {
        &self.provisioner
    }

    pub fn admission(&self) -> &AdmissionGuard {
        &self.admission
    }

    /// Provisions the sandbox first and only then registers the session;
    /// a provisioning failure leaves no trace behind.
    pub async fn create(&self, title: Option<String>) -> Result<SessionDetail, RelayError> {
        let reserved = !self.provisioner.is_shared();
        if reserved {
            self.admission.try_reserve()?;
        }

        let sandbox = match self.provisioner.provision().await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                if reserved {
                    self.admission.release();
                }
                warn!(error = %err, "session creation failed during sandbox provisioning");
                return Err(err);
            }
        };

        let session = Session::new(title);
        let detail = session.detail();
        let slot = SessionSlot {
            session_id: session.id.clone(),
            record: Arc::new(Mutex::new(session)),
            bus: SessionBus::new(&detail.session_id, self.event_retention),
            tool_state: Arc::new(SessionToolState::default()),
            sandbox,
            stop: StopSignal::default(),
            turn_lock: Arc::new(Mutex::new(())),
        };

        self.sessions
            .lock()
            .await
            .insert(detail.session_id.clone(), slot);
        info!(session_id = %detail.session_id, "session created");
        Ok(detail)
    }

    pub async fn slot(&self, session_id: &str) -> Result<SessionSlot, RelayError> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub async fn detail(&self, session_id: &str) -> Result<SessionDetail, RelayError> {
        let slot = self.slot(session_id).await?;
        let record = slot.record.lock().await;
        Ok(record.detail())
    }

    /// Summaries newest-first, truncated to `limit` when given.
    pub async fn list(&self, limit: Option<usize>) -> Vec<SessionSummary> {
        let slots: Vec<SessionSlot> = {
            let sessions = self.sessions.lock().await;
            sessions.values().cloned().collect()
        };

        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            let event_count = slot.bus.event_count().await;
            let record = slot.record.lock().await;
            summaries.push((record.created_at, record.summary(event_count)));
        }
        summaries.sort_by(|a, b| b.0.cmp(&a.0));

        let mut summaries: Vec<SessionSummary> =
            summaries.into_iter().map(|(_, summary)| summary).collect();
        if let Some(limit) = limit {
            summaries.truncate(limit);
        }
        summaries
    }

    pub async fn update_title(
        &self,
        session_id: &str,
        title: String,
    ) -> Result<SessionDetail, RelayError> {
        let slot = self.slot(session_id).await?;
        let mut record = slot.record.lock().await;
        record.title = title;
        record.touch();
        Ok(record.detail())
    }

    /// Removes the registry entry. Teardown happens before this, through
    /// the supervisor; unknown ids are fine.
    pub async fn remove(&self, session_id: &str) -> Option<SessionSlot> {
        self.sessions.lock().await.remove(session_id)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub fn turn_runner(&self, slot: &SessionSlot, provider: Arc<dyn ModelProvider>) -> TurnRunner {
        TurnRunner {
            session_id: slot.session_id.clone(),
            record: slot.record.clone(),
            bus: slot.bus.clone(),
            gateway: self.gateway.clone(),
            tool_state: slot.tool_state.clone(),
            sandbox: slot.sandbox.clone(),
            provider,
            stop: slot.stop.clone(),
        }
    }

    /// Checks, under the turn lock, that the session can accept a turn.
    pub async fn ensure_accepting(&self, slot: &SessionSlot) -> Result<(), RelayError> {
        let record = slot.record.lock().await;
        match record.status {
            SessionStatus::Created | SessionStatus::Idle => Ok(()),
            status => Err(RelayError::Validation {
                message: format!(
                    "session {} is {} and not accepting messages",
                    slot.session_id,
                    status.as_str()
                ),
            }),
        }
    }

    /// Direct tool execution outside a turn. Records the invocation on the
    /// session but publishes nothing; the event stream stays owned by the
    /// turn loop.
    pub async fn manual_execute(
        &self,
        session_id: &str,
        tool: &str,
        arguments: &Value,
    ) -> Result<ToolInvocationData, RelayError> {
        let slot = self.slot(session_id).await?;
        {
            let record = slot.record.lock().await;
            if matches!(
                record.status,
                SessionStatus::Stopping | SessionStatus::Stopped | SessionStatus::Error
            ) {
                return Err(RelayError::Validation {
                    message: format!(
                        "session {} is {} and cannot execute tools",
                        session_id,
                        record.status.as_str()
                    ),
                });
            }
        }

        let invocation = self
            .gateway
            .execute(&slot.tool_state, &slot.sandbox, tool, arguments)
            .await?;

        let mut record = slot.record.lock().await;
        record.tool_invocations.push(invocation.clone());
        record.touch();
        Ok(invocation)
    }

    /// Registers a session without provisioning a sandbox. The detached
    /// shared ref is never contacted by the paths under test.
    #[cfg(test)]
    pub(crate) async fn insert_detached(&self, session: Session) -> SessionSlot {
        use agent_relay_sandbox::{SandboxConfig, SharedSandbox};

        let session_id = session.id.clone();
        let slot = SessionSlot {
            session_id: session_id.clone(),
            record: Arc::new(Mutex::new(session)),
            bus: SessionBus::new(&session_id, self.event_retention),
            tool_state: Arc::new(SessionToolState::default()),
            sandbox: SandboxRef::Shared(SharedSandbox::new(SandboxConfig::default())),
            stop: StopSignal::default(),
            turn_lock: Arc::new(Mutex::new(())),
        };
        self.sessions
            .lock()
            .await
            .insert(session_id, slot.clone());
        slot
    }

    /// Builds the user-role messages for a turn from a chat request body.
    /// Roles other than user are rejected here because history is owned by
    /// the session; clients only ever submit new user input.
    pub fn turn_messages(messages: Vec<IncomingMessage>) -> Result<Vec<Message>, RelayError> {
        if messages.is_empty() {
            return Err(RelayError::Validation {
                message: "messages must not be empty".to_string(),
            });
        }
        let mut built = Vec::with_capacity(messages.len());
        for message in &messages {
            if message.content.trim().is_empty() {
                return Err(RelayError::Validation {
                    message: "message content must not be empty".to_string(),
                });
            }
            if message.role != MessageRole::User {
                return Err(RelayError::Validation {
                    message: "chat messages must use the user role".to_string(),
                });
            }
            built.push(Message::new(MessageRole::User, message.content.clone()));
        }
        Ok(built)
    }
}

/// One inbound chat message as supplied by the client.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct IncomingMessage {
    pub role: MessageRole,
    pub content: String,
}
