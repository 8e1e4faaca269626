//! Event log + bus: append-only history, pattern subscriptions, replay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::model::{entity_url, Event, EventDraft, Record};
use crate::provider::{EventFilter, EventHandler, ReplayFilter, Subscription};
use crate::Result;

use super::MemoryProvider;

// ============================================================================
// Pattern matching
// ============================================================================

/// Event-name pattern matching, in order:
/// 1. literal equality
/// 2. `"*"` matches everything
/// 3. `"Prefix.*"` matches names beginning with `"Prefix."`
/// 4. `"*.suffix"` matches names ending with `".suffix"`
/// 5. anything else: no match
pub fn matches_pattern(event: &str, pattern: &str) -> bool {
    if pattern == event {
        return true;
    }
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return event
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.'));
    }
    false
}

// ============================================================================
// Subscriber registry
// ============================================================================

pub(crate) struct SubscriberRegistry {
    /// pattern → handlers, both in registration order.
    patterns: RwLock<IndexMap<String, Vec<(u64, EventHandler)>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            patterns: RwLock::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn subscribe(self: &Arc<Self>, pattern: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.patterns
            .write()
            .entry(pattern.to_string())
            .or_default()
            .push((id, handler));
        let registry = Arc::downgrade(self);
        let pattern_key = pattern.to_string();
        Subscription::new(pattern, move || {
            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe(&pattern_key, id);
            }
        })
    }

    fn unsubscribe(&self, pattern: &str, id: u64) {
        let mut patterns = self.patterns.write();
        if let Some(handlers) = patterns.get_mut(pattern) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                patterns.shift_remove(pattern);
            }
        }
    }

    /// All handlers whose pattern matches `event`, pattern insertion order
    /// first, registration order within a pattern.
    fn matching(&self, event: &str) -> Vec<EventHandler> {
        let patterns = self.patterns.read();
        patterns
            .iter()
            .filter(|(pattern, _)| matches_pattern(event, pattern))
            .flat_map(|(_, handlers)| handlers.iter().map(|(_, h)| Arc::clone(h)))
            .collect()
    }
}

// ============================================================================
// Bus operations
// ============================================================================

impl MemoryProvider {
    /// Append an event and dispatch matching handlers under the limiter.
    /// Handler errors are logged and never abort emission.
    pub async fn emit(&self, draft: EventDraft) -> Result<Event> {
        let event = draft.build();
        {
            let mut log = self.inner.events.write();
            log.push(event.clone());
            if let Some(hook) = &self.inner.retention {
                hook(&mut log);
            }
        }

        let handlers = self.inner.subscribers.matching(&event.event);
        if !handlers.is_empty() {
            let results = self
                .inner
                .limiter
                .map(handlers, |handler| handler(event.clone()))
                .await;
            for err in results.into_iter().filter_map(Result::err) {
                warn!(event = %event.event, error = %err, "event handler failed");
            }
        }
        Ok(event)
    }

    /// Subscribe a handler to an event pattern.
    pub fn on(&self, pattern: &str, handler: EventHandler) -> Subscription {
        self.inner.subscribers.subscribe(pattern, handler)
    }

    /// Filtered view of the log. `limit` keeps the most recent N, in
    /// chronological order.
    pub async fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>> {
        let log = self.inner.events.read();
        let mut filtered: Vec<Event> = log
            .iter()
            .filter(|e| event_matches_filter(e, &filter.event, &filter.actor, &filter.object))
            .filter(|e| filter.since.is_none_or(|since| e.timestamp >= since))
            .filter(|e| filter.until.is_none_or(|until| e.timestamp <= until))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = filtered.len().saturating_sub(limit);
            filtered.drain(..skip);
        }
        Ok(filtered)
    }

    /// Re-invoke `handler` over the filtered history in timestamp order,
    /// one invocation at a time through the limiter. Handler errors are
    /// logged; replay continues. Returns the number of events replayed.
    pub async fn replay_events(
        &self,
        filter: ReplayFilter,
        handler: EventHandler,
    ) -> Result<usize> {
        let events: Vec<Event> = {
            let log = self.inner.events.read();
            log.iter()
                .filter(|e| event_matches_filter(e, &filter.event, &filter.actor, &None))
                .filter(|e| filter.since.is_none_or(|since| e.timestamp >= since))
                .cloned()
                .collect()
        };

        let mut replayed = 0;
        for event in events {
            let name = event.event.clone();
            if let Err(err) = self.inner.limiter.run(handler(event)).await {
                warn!(event = %name, error = %err, "replay handler failed");
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    /// The two-event chain of every CRUD call: `<Type>.<verb>` first,
    /// the global `entity:<verb>` second.
    pub(crate) async fn emit_entity_events(
        &self,
        entity_type: &str,
        id: &str,
        verb: &str,
        record: &Record,
    ) -> Result<()> {
        let url = entity_url(entity_type, id);
        let data = Value::Object(record.clone());
        self.emit(
            EventDraft::new(format!("{entity_type}.{verb}"))
                .object(url.clone())
                .object_data(data.clone()),
        )
        .await?;
        self.emit(
            EventDraft::new(format!("entity:{verb}"))
                .object(url)
                .object_data(data),
        )
        .await?;
        Ok(())
    }
}

// ============================================================================
// Filtering
// ============================================================================

fn event_matches_filter(
    event: &Event,
    pattern: &Option<String>,
    actor: &Option<String>,
    object: &Option<String>,
) -> bool {
    if let Some(pattern) = pattern {
        if !matches_pattern(&event.event, pattern) {
            return false;
        }
    }
    if let Some(actor) = actor {
        if &event.actor != actor {
            return false;
        }
    }
    if let Some(object) = object {
        if event.object.as_deref() != Some(object.as_str()) {
            return false;
        }
    }
    true
}

// ============================================================================
// Tests
// ============================================================================
