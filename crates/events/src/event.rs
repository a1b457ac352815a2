use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use backline_core::{AggregateId, EventId, UserId};

/// A domain event produced by a business operation.
///
/// Events are facts: once created they are only read. The builder-style
/// `with_*` methods consume the value and are meant for construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    #[serde(rename = "type")]
    event_type: String,
    aggregate_id: AggregateId,
    caused_by_user_id: Option<UserId>,
    occurred_at: DateTime<Utc>,
    payload: JsonValue,
}

impl Event {
    pub fn new(event_type: impl Into<String>, aggregate_id: AggregateId, payload: JsonValue) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            aggregate_id,
            caused_by_user_id: None,
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn caused_by(mut self, user_id: UserId) -> Self {
        self.caused_by_user_id = Some(user_id);
        self
    }

    pub fn with_occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Stable event type used for routing (e.g. `"low-stock"`, `"order.placed"`).
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn caused_by_user_id(&self) -> Option<UserId> {
        self.caused_by_user_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }
}
