//! Actions — first-class long-running work items.
//!
//! The state machine:
//!
//! ```text
//!                ┌───────┐
//!     create ───▶│pending│───cancel──▶ cancelled (terminal)
//!                └──┬────┘
//!                   │ start
//!                   ▼
//!                ┌──────┐      cancel     ┌─────────┐
//!                │active│─────────────▶   │cancelled│
//!                └──┬───┘                 └─────────┘
//!         complete │            │ fail
//!                   ▼            ▼
//!               ┌─────────┐   ┌──────┐──retry──▶ pending
//!               │completed│   │failed│
//!               └─────────┘   └──────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Active => "active",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Cancelled)
    }

    /// Whether a direct status update may move `self` to `to`.
    ///
    /// `Failed -> Pending` only happens through `retry`, never a plain
    /// status patch, so it is not legal here.
    pub fn can_transition_to(&self, to: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, to),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelled)
        )
    }

    /// Validate a transition, producing the store error on refusal.
    pub fn check_transition(&self, to: ActionStatus) -> Result<()> {
        if *self == to || self.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().into(),
                to: to.as_str().into(),
            })
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A long-running work item. `action`/`act`/`activity` are the conjugated
/// forms of the base verb (`publish` / `publishes` / `publishing`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_data: Option<Value>,
    pub action: String,
    pub act: String,
    pub activity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_data: Option<Value>,
    pub status: ActionStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Input to `create_action`. `verb` is the base verb; the manager derives
/// the conjugated forms.
#[derive(Debug, Clone, Default)]
pub struct ActionDraft {
    pub actor: String,
    pub actor_data: Option<Value>,
    pub verb: String,
    pub object: Option<String>,
    pub object_data: Option<Value>,
    pub total: Option<f64>,
    pub meta: Option<Value>,
}

impl ActionDraft {
    pub fn new(actor: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            verb: verb.into(),
            ..Default::default()
        }
    }

    pub fn object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn object_data(mut self, data: Value) -> Self {
        self.object_data = Some(data);
        self
    }

    pub fn total(mut self, total: f64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Partial update to an action. A `status` change runs through the state
/// machine; other fields merge in place.
#[derive(Debug, Clone, Default)]
pub struct ActionPatch {
    pub status: Option<ActionStatus>,
    pub progress: Option<f64>,
    pub total: Option<f64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub meta: Option<Value>,
}

impl ActionPatch {
    pub fn status(status: ActionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use ActionStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Failed));
        assert!(Active.can_transition_to(Cancelled));
    }

    #[test]
    fn test_illegal_transitions() {
        use ActionStatus::*;
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        // retry is not a plain status patch
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn test_check_transition_error_shape() {
        let err = ActionStatus::Completed
            .check_transition(ActionStatus::Active)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::InvalidStateTransition { .. }
        ));
    }
}
