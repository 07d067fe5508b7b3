// src/event/mod.rs
//! Domain events and the ingest filter
//!
//! The hub event bus pushes immutable [`HubEvent`]s at the engine. A coarse
//! [`EventFilter`] runs before anything is enqueued: deny rules win, and an
//! empty allow-list admits everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use ulid::Ulid;

/// Event type carried by state transitions
pub const EVENT_STATE_CHANGED: &str = "state_changed";

/// One immutable domain event from the hub bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    /// Event type, e.g. `state_changed`, `automation_triggered`
    pub event_type: String,

    /// Moment the event fired
    pub time_fired: DateTime<Utc>,

    /// Event payload (JSON)
    pub data: serde_json::Value,

    /// Correlation id linking events from one trigger chain
    pub context_id: Option<String>,
}

impl HubEvent {
    /// Create an event fired now, with a fresh context id
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            time_fired: Utc::now(),
            data,
            context_id: Some(Ulid::new().to_string()),
        }
    }

    /// Create a state-changed event for an entity
    pub fn state_changed(
        entity_id: impl Into<String>,
        state: impl Into<String>,
        attributes: serde_json::Value,
    ) -> Self {
        Self::new(
            EVENT_STATE_CHANGED,
            serde_json::json!({
                "entity_id": entity_id.into(),
                "state": state.into(),
                "attributes": attributes,
            }),
        )
    }

    /// Entity id for state-changed events, if present
    pub fn entity_id(&self) -> Option<&str> {
        self.data.get("entity_id").and_then(|v| v.as_str())
    }
}

/// Payload shape of a `state_changed` event
#[derive(Debug, Clone, Deserialize)]
pub struct StateChangedData {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Coarse allow/deny filter applied before enqueueing
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    include_types: HashSet<String>,
    exclude_types: HashSet<String>,
    include_entities: HashSet<String>,
    exclude_entities: HashSet<String>,
}

impl EventFilter {
    pub fn new(
        include_types: impl IntoIterator<Item = String>,
        exclude_types: impl IntoIterator<Item = String>,
        include_entities: impl IntoIterator<Item = String>,
        exclude_entities: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            include_types: include_types.into_iter().collect(),
            exclude_types: exclude_types.into_iter().collect(),
            include_entities: include_entities.into_iter().collect(),
            exclude_entities: exclude_entities.into_iter().collect(),
        }
    }

    /// Whether the event should be recorded
    pub fn allows(&self, event: &HubEvent) -> bool {
        if self.exclude_types.contains(&event.event_type) {
            return false;
        }
        if !self.include_types.is_empty() && !self.include_types.contains(&event.event_type) {
            return false;
        }

        if let Some(entity_id) = event.entity_id() {
            if self.exclude_entities.contains(entity_id) {
                return false;
            }
            if !self.include_entities.is_empty() && !self.include_entities.contains(entity_id) {
                return false;
            }
        }

        true
    }
}
