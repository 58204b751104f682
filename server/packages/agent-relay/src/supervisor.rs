use std::sync::Arc;
use std::time::Duration;

use agent_relay_error::RelayError;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::{DoneData, EventPayload, SessionEventType, TurnOutcome};
use crate::registry::SessionRegistry;
use crate::session::SessionStatus;

/// Stop/cancel orchestration and resource reclamation. The registry owns
/// the session map; the supervisor owns every path that ends a session.
#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<SessionRegistry>,
}

impl Supervisor {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Marks the session `stopping` (visible immediately), signals the
    /// turn task, waits for it to unwind at its next suspension point,
    /// publishes the terminal `done`, then tears the sandbox down.
    /// Idempotent once a stop is underway.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), RelayError> {
        let slot = self.registry.slot(session_id).await?;

        {
            let mut record = slot.record.lock().await;
            match record.status {
                SessionStatus::Stopped | SessionStatus::Stopping => return Ok(()),
                _ => {
                    record.status = SessionStatus::Stopping;
                    record.touch();
                }
            }
        }
        slot.stop.request();

        // A running turn holds the lock until it unwinds.
        let _turn = slot.turn_lock.lock().await;

        slot.bus
            .publish(
                SessionEventType::Done,
                EventPayload::Done(DoneData {
                    outcome: TurnOutcome::Stopped,
                    summary: None,
                }),
            )
            .await;

        {
            let mut record = slot.record.lock().await;
            if record.status.can_transition_to(SessionStatus::Stopped) {
                record.status = SessionStatus::Stopped;
            }
            record.touch();
        }

        slot.sandbox.stop().await;
        if !self.registry.provisioner().is_shared() {
            self.registry.admission().release();
        }
        info!(session_id, "session stopped");
        Ok(())
    }

    /// Stop then remove. Unknown ids and repeated deletes succeed; the
    /// registry entry only disappears after teardown finished.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), RelayError> {
        match self.stop_session(session_id).await {
            Ok(()) => {}
            Err(RelayError::SessionNotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        }
        if self.registry.remove(session_id).await.is_some() {
            info!(session_id, "session deleted");
        }
        Ok(())
    }

    /// Periodic reclamation of sessions idle past the threshold.
    pub fn spawn_idle_sweep(&self, idle_threshold: Duration) -> JoinHandle<()> {
        let supervisor = self.clone();
        let threshold = chrono::Duration::from_std(idle_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let interval = sweep_interval(idle_threshold);
        info!(
            interval_secs = interval.as_secs(),
            threshold_secs = idle_threshold.as_secs(),
            "idle sweep started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                supervisor.sweep_idle(threshold).await;
            }
        })
    }

    async fn sweep_idle(&self, threshold: chrono::Duration) {
        let now = Utc::now();
        for session_id in self.registry.session_ids().await {
            let Ok(slot) = self.registry.slot(&session_id).await else {
                continue;
            };
            let expired = {
                let record = slot.record.lock().await;
                matches!(
                    record.status,
                    SessionStatus::Created | SessionStatus::Idle | SessionStatus::Error
                ) && record.idle_for(now) >= threshold
            };
            if expired {
                info!(session_id = %session_id, "reclaiming idle session");
                if let Err(err) = self.stop_session(&session_id).await {
                    warn!(session_id = %session_id, error = %err, "idle reclamation failed");
                }
            }
        }
    }

    /// Process shutdown: stop every live session, then the shared sandbox
    /// instance if one exists.
    pub async fn shutdown_all(&self) {
        for session_id in self.registry.session_ids().await {
            if let Err(err) = self.stop_session(&session_id).await {
                warn!(session_id = %session_id, error = %err, "stop during shutdown failed");
            }
        }
        self.registry.provisioner().shutdown().await;
    }
}

/// Sweep cadence: half the threshold, at most every 60s, at least every 1s.
fn sweep_interval(threshold: Duration) -> Duration {
    let half = threshold / 2;
    half.min(Duration::from_secs(60)).max(Duration::from_secs(1))
}
