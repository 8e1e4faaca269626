//! Actor–Event–Object–Result events. Immutable once appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One appended event. `event` is either `"<Type>.<verb>"` or a global
/// keyword such as `"entity:created"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_data: Option<Value>,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Input to `emit`. Either the full AEOR shape, built field-by-field, or the
/// legacy `(event_name, data)` form via [`EventDraft::legacy`], which lands
/// the payload in `object_data` under the `"system"` actor.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub actor: Option<String>,
    pub actor_data: Option<Value>,
    pub event: String,
    pub object: Option<String>,
    pub object_data: Option<Value>,
    pub result: Option<String>,
    pub result_data: Option<Value>,
    pub meta: Option<Value>,
}

impl EventDraft {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Default::default()
        }
    }

    /// Legacy two-argument emit form.
    pub fn legacy(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            object_data: data,
            ..Default::default()
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn actor_data(mut self, data: Value) -> Self {
        self.actor_data = Some(data);
        self
    }

    pub fn object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn object_data(mut self, data: Value) -> Self {
        self.object_data = Some(data);
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn result_data(mut self, data: Value) -> Self {
        self.result_data = Some(data);
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Seal the draft into an immutable event.
    pub fn build(self) -> Event {
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            actor: self.actor.unwrap_or_else(|| "system".into()),
            actor_data: self.actor_data,
            event: self.event,
            object: self.object,
            object_data: self.object_data,
            result: self.result,
            result_data: self.result_data,
            meta: self.meta,
            timestamp: Utc::now(),
        }
    }
}
