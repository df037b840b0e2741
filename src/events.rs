//! Event channel for observers of task, agent and worktree changes.
//!
//! Publishing is fire-and-forget from the orchestrator's point of view:
//! failures are logged by the caller and never abort a transition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Event type names published by the orchestrator.
pub mod kinds {
    pub const TASK_STAGE_CHANGED: &str = "task.stage_changed";
    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_REJECTED: &str = "task.rejected";
    pub const AGENT_STATUS_CHANGED: &str = "agent.status_changed";
    pub const AGENT_TURN: &str = "agent.turn";
    pub const TOOL_DENIED: &str = "agent.tool_denied";
    pub const WORKTREE_STATUS_CHANGED: &str = "worktree.status_changed";
    pub const WORKTREE_MERGED: &str = "worktree.merged";
}

/// A published notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity_id: String,
    pub event_type: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(entity_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            event_type: event_type.into(),
            payload,
            at: Utc::now(),
        }
    }
}

/// Outbound notification channel.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Publishes without letting a failure escape; failures are only logged.
pub async fn emit(
    publisher: &dyn EventPublisher,
    entity_id: impl Into<String>,
    event_type: &str,
    payload: Value,
) {
    let event = Event::new(entity_id, event_type, payload);
    let entity_id = event.entity_id.clone();
    if let Err(e) = publisher.publish(event).await {
        tracing::debug!(entity_id = %entity_id, event_type, error = %e, "event publish failed");
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Fans events out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Event>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| Error::Execution("no event subscribers".to_string()))
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events of one type, in publish order.
    pub fn of_type(&self, event_type: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
