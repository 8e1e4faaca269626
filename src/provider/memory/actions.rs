//! Action manager: lifecycle state machine and derived events.

use chrono::Utc;
use uuid::Uuid;

use crate::model::{Action, ActionDraft, ActionPatch, ActionStatus, EventDraft};
use crate::provider::ActionFilter;
use crate::verbs::conjugate;
use crate::{Error, Result};

use super::MemoryProvider;

impl MemoryProvider {
    /// Create an action in `pending`. The base verb is conjugated into
    /// `(action, act, activity)`. Emits `Action.created`.
    pub async fn create_action(&self, draft: ActionDraft) -> Result<Action> {
        if draft.actor.trim().is_empty() {
            return Err(Error::Validation("action actor must not be empty".into()));
        }
        if draft.verb.trim().is_empty() {
            return Err(Error::Validation("action verb must not be empty".into()));
        }

        let forms = conjugate(&draft.verb);
        let action = Action {
            id: Uuid::new_v4().to_string(),
            actor: draft.actor,
            actor_data: draft.actor_data,
            action: forms.action,
            act: forms.act,
            activity: forms.activity,
            object: draft.object,
            object_data: draft.object_data,
            status: ActionStatus::Pending,
            progress: 0.0,
            total: draft.total,
            result: None,
            error: None,
            meta: draft.meta,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            updated_at: None,
        };

        self.inner
            .actions
            .write()
            .insert(action.id.clone(), action.clone());
        self.emit_action_event("created", &action).await?;
        Ok(action)
    }

    pub async fn get_action(&self, id: &str) -> Result<Option<Action>> {
        Ok(self.inner.actions.read().get(id).cloned())
    }

    /// Merge a patch. A `status` change runs through the state machine:
    /// entering `active` stamps `started_at`; entering a terminal state
    /// stamps `completed_at`; each emits the corresponding event.
    pub async fn update_action(&self, id: &str, patch: ActionPatch) -> Result<Action> {
        let (action, lifecycle) = {
            let mut actions = self.inner.actions.write();
            let action = actions
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("Action/{id}")))?;

            let mut lifecycle = None;
            if let Some(next) = patch.status {
                if next != action.status {
                    action.status.check_transition(next)?;
                    let now = Utc::now();
                    match next {
                        ActionStatus::Active => {
                            action.started_at = Some(now);
                            lifecycle = Some("started");
                        }
                        ActionStatus::Completed => {
                            action.completed_at = Some(now);
                            lifecycle = Some("completed");
                        }
                        ActionStatus::Failed => {
                            action.completed_at = Some(now);
                            lifecycle = Some("failed");
                        }
                        ActionStatus::Cancelled => {
                            action.completed_at = Some(now);
                            lifecycle = Some("cancelled");
                        }
                        // check_transition refuses every path back to pending
                        ActionStatus::Pending => {}
                    }
                    action.status = next;
                }
            }

            if let Some(progress) = patch.progress {
                action.progress = progress;
            }
            if let Some(total) = patch.total {
                action.total = Some(total);
            }
            if let Some(result) = patch.result {
                action.result = Some(result);
            }
            if let Some(error) = patch.error {
                action.error = Some(error);
            }
            if let Some(meta) = patch.meta {
                action.meta = Some(meta);
            }
            action.updated_at = Some(Utc::now());
            (action.clone(), lifecycle)
        };

        if let Some(verb) = lifecycle {
            self.emit_action_event(verb, &action).await?;
        }
        Ok(action)
    }

    pub async fn list_actions(&self, filter: ActionFilter) -> Result<Vec<Action>> {
        let actions = self.inner.actions.read();
        let mut filtered: Vec<Action> = actions
            .values()
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .filter(|a| filter.actor.as_deref().is_none_or(|actor| a.actor == actor))
            .filter(|a| {
                filter
                    .object
                    .as_deref()
                    .is_none_or(|object| a.object.as_deref() == Some(object))
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = filtered.len().saturating_sub(limit);
            filtered.drain(..skip);
        }
        Ok(filtered)
    }

    /// Return a failed action to `pending`, clearing `error`, `started_at`,
    /// and `completed_at`. Emits `Action.retried`. Only legal from `failed`.
    pub async fn retry_action(&self, id: &str) -> Result<Action> {
        let action = {
            let mut actions = self.inner.actions.write();
            let action = actions
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("Action/{id}")))?;
            if action.status != ActionStatus::Failed {
                return Err(Error::InvalidStateTransition {
                    from: action.status.as_str().into(),
                    to: ActionStatus::Pending.as_str().into(),
                });
            }
            action.status = ActionStatus::Pending;
            action.error = None;
            action.started_at = None;
            action.completed_at = None;
            action.updated_at = Some(Utc::now());
            action.clone()
        };
        self.emit_action_event("retried", &action).await?;
        Ok(action)
    }

    /// Cancel from `pending` or `active`; terminal states refuse.
    pub async fn cancel_action(&self, id: &str) -> Result<Action> {
        self.update_action(id, ActionPatch::status(ActionStatus::Cancelled))
            .await
    }

    async fn emit_action_event(&self, verb: &str, action: &Action) -> Result<()> {
        let mut draft = EventDraft::new(format!("Action.{verb}"))
            .actor(action.actor.clone())
            .object(format!("Action/{}", action.id));
        if let Ok(data) = serde_json::to_value(action) {
            draft = draft.object_data(data);
        }
        self.emit(draft).await?;
        Ok(())
    }
}
