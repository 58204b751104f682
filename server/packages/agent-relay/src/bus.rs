use std::collections::VecDeque;
use std::sync::Arc;

use agent_relay_error::RelayError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use utoipa::ToSchema;

use crate::events::{EventPayload, SessionEvent, SessionEventType};

const BROADCAST_CAPACITY: usize = 256;

/// Per-session append-only event log with a bounded retention window and
/// live fan-out. The Planning Loop is the only publisher for a session;
/// subscribers replay retained events and then follow the broadcast.
#[derive(Debug)]
pub struct EventLog {
    session_id: String,
    capacity: usize,
    next_offset: u64,
    first_retained: u64,
    events: VecDeque<SessionEvent>,
    broadcaster: broadcast::Sender<SessionEvent>,
}

impl EventLog {
    fn new(session_id: &str, capacity: usize) -> Self {
        let (broadcaster, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            session_id: session_id.to_string(),
            capacity: capacity.max(1),
            next_offset: 0,
            first_retained: 0,
            events: VecDeque::new(),
            broadcaster,
        }
    }

    fn publish(&mut self, event_type: SessionEventType, data: EventPayload) -> SessionEvent {
        let offset = self.next_offset;
        self.next_offset += 1;
        let event = SessionEvent::new(&self.session_id, offset, event_type, data);

        self.events.push_back(event.clone());
        while self.events.len() > self.capacity {
            self.events.pop_front();
            self.first_retained += 1;
        }

        let _ = self.broadcaster.send(event.clone());
        event
    }

    /// Retained events after `from` (exclusive), or from the start when
    /// `from` is absent. Fails with `stream_gap` when the requested
    /// position has already been evicted.
    fn replay_after(&self, from: Option<u64>) -> Result<Vec<SessionEvent>, RelayError> {
        self.check_retained(from)?;
        let events = self
            .events
            .iter()
            .filter(|event| match from {
                Some(from) => event.offset > from,
                None => true,
            })
            .cloned()
            .collect();
        Ok(events)
    }

    fn check_retained(&self, from: Option<u64>) -> Result<(), RelayError> {
        if self.first_retained == 0 {
            return Ok(());
        }
        match from {
            Some(from) if from >= self.first_retained => Ok(()),
            Some(from) => Err(RelayError::StreamGap {
                requested: from,
                oldest: self.first_retained,
            }),
            None => Err(RelayError::StreamGap {
                requested: 0,
                oldest: self.first_retained,
            }),
        }
    }

    fn event_count(&self) -> u64 {
        self.next_offset
    }
}

/// Live subscription: replay of retained events followed by the broadcast
/// receiver. Registration happens under the log lock, so the receiver only
/// ever sees events published after the replay snapshot.
#[derive(Debug)]
pub struct Subscription {
    pub replay: Vec<SessionEvent>,
    pub receiver: broadcast::Receiver<SessionEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct EventPage {
    pub events: Vec<SessionEvent>,
    pub has_more: bool,
}

/// Shared handle to one session's event log. Publish, subscribe, and paged
/// reads all serialize on the inner lock, so offset assignment never races
/// subscriber registration.
#[derive(Debug, Clone)]
pub struct SessionBus {
    log: Arc<Mutex<EventLog>>,
}

impl SessionBus {
    pub fn new(session_id: &str, capacity: usize) -> Self {
        Self {
            log: Arc::new(Mutex::new(EventLog::new(session_id, capacity))),
        }
    }

    pub async fn publish(&self, event_type: SessionEventType, data: EventPayload) -> SessionEvent {
        let mut log = self.log.lock().await;
        log.publish(event_type, data)
    }

    /// Atomically snapshots the replay and registers the live receiver.
    /// Events published after this call land in the receiver, never in
    /// both halves.
    pub async fn subscribe(&self, from: Option<u64>) -> Result<Subscription, RelayError> {
        let log = self.log.lock().await;
        let replay = log.replay_after(from)?;
        let receiver = log.broadcaster.subscribe();
        Ok(Subscription { replay, receiver })
    }

    pub async fn page(
        &self,
        from: Option<u64>,
        limit: Option<u64>,
    ) -> Result<EventPage, RelayError> {
        let log = self.log.lock().await;
        let mut events = log.replay_after(from)?;
        let has_more = if let Some(limit) = limit {
            let limit = limit as usize;
            if events.len() > limit {
                events.truncate(limit);
                true
            } else {
                false
            }
        } else {
            false
        };
        Ok(EventPage { events, has_more })
    }

    pub async fn event_count(&self) -> u64 {
        self.log.lock().await.event_count()
    }
}
