//! Observable cycle events.
//!
//! Every state transition of an orchestration cycle is published on a
//! broadcast channel so that UIs and loggers can follow along. Publishing
//! never blocks and never fails the cycle: with no subscribers, events are
//! simply dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

/// States of one orchestration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    /// Query accepted
    Received,
    /// Context window built from memory
    ContextRetrieved,
    /// Reasoner returned a decision
    Decided,
    /// Skills are running
    Executing,
    /// Results written to memory
    MemoryUpdated,
    /// Response produced; cycle succeeded
    Responded,
    /// Cycle failed
    Errored,
}

impl CycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Responded | Self::Errored)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: CycleState) -> bool {
        use CycleState::*;
        match (self, next) {
            (s, Errored) => !s.is_terminal(),
            (Received, ContextRetrieved)
            | (ContextRetrieved, Decided)
            | (Decided, Executing)
            | (Executing, MemoryUpdated)
            | (MemoryUpdated, Responded) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::ContextRetrieved => "CONTEXT_RETRIEVED",
            Self::Decided => "DECIDED",
            Self::Executing => "EXECUTING",
            Self::MemoryUpdated => "MEMORY_UPDATED",
            Self::Responded => "RESPONDED",
            Self::Errored => "ERRORED",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleEvent {
    pub cycle_id: Uuid,
    pub state: CycleState,
    /// Human-readable detail
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl CycleEvent {
    pub fn new(cycle_id: Uuid, state: CycleState, content: impl Into<String>) -> Self {
        Self {
            cycle_id,
            state,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }

    pub fn is_error(&self) -> bool {
        self.state == CycleState::Errored
    }

    /// Compact single-line rendering.
    pub fn as_log_line(&self) -> String {
        let short_id: String = self.cycle_id.to_string().chars().take(8).collect();
        format!("[{}] {}: {}", short_id, self.state, self.content)
    }
}

/// Broadcast channel for cycle events.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<CycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus; slow subscribers lag once `capacity` events are buffered.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: CycleEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use CycleState::*;
        assert!(Received.can_transition_to(ContextRetrieved));
        assert!(Executing.can_transition_to(Errored));
        assert!(!Received.can_transition_to(Decided));
        assert!(!Responded.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Errored));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&CycleState::MemoryUpdated).unwrap();
        assert_eq!(json, "\"MEMORY_UPDATED\"");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        bus.emit(CycleEvent::new(Uuid::new_v4(), CycleState::Received, "dropped"));

        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        let id = Uuid::new_v4();
        bus.emit(CycleEvent::new(id, CycleState::Received, "hello").with_metadata("n", 1));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.cycle_id, id);
        assert_eq!(event.get_metadata("n"), Some(&Value::from(1)));
        assert!(event.as_log_line().ends_with("RECEIVED: hello"));
    }
}
