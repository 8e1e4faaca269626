//! In-memory provider — the reference implementation of [`Provider`].
//!
//! State is a set of per-concern collections behind `parking_lot` locks;
//! locks are never held across an await. Mutations are serialized per
//! collection, reads observe committed state. Authoritative only within
//! one process lifetime — there is no durability.

mod events;
mod actions;
mod artifacts;
mod search;
mod txn;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::embedding::{EmbeddingConfig, EmbeddingProvider, MockEmbedding};
use crate::limiter::Limiter;
use crate::model::{
    entity_url, Action, ActionDraft, ActionPatch, Artifact, ArtifactDraft, Entity, Event,
    EventDraft, Record,
};
use crate::validate::{
    validate_batch_len, validate_entity_id, validate_field_name, validate_type_name,
    DANGEROUS_KEYS,
};
use crate::{Error, Result};

use super::{
    ActionFilter, EventFilter, EventHandler, HybridSearchOptions, ListOptions, Provider,
    ProviderCapabilities, RelateOptions, ReplayFilter, RetentionHook, SearchOptions,
    SemanticSearchOptions, SortOrder, StoreConfig, StoreStats, Subscription,
    UnionSearchOptions, UnionSearchResult,
};

pub use artifacts::EMBEDDING_KIND;
pub use events::matches_pattern;
pub use txn::MemoryTransaction;

use events::SubscriberRegistry;

// ============================================================================
// MemoryProvider
// ============================================================================

/// In-memory entity store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryProvider {
    pub(crate) inner: Arc<MemoryInner>,
}

pub(crate) struct MemoryInner {
    /// type name → (id → entity), both levels insertion-ordered.
    pub(crate) entities: RwLock<IndexMap<String, IndexMap<String, Entity>>>,
    /// `"fromType:fromId:relation"` → ordered set of `"toType:toId"`.
    pub(crate) relations: RwLock<IndexMap<String, IndexSet<String>>>,
    pub(crate) events: RwLock<Vec<Event>>,
    pub(crate) subscribers: Arc<SubscriberRegistry>,
    pub(crate) actions: RwLock<IndexMap<String, Action>>,
    /// `(url, kind)` → artifact.
    pub(crate) artifacts: RwLock<IndexMap<(String, String), Artifact>>,
    pub(crate) embedder: RwLock<Option<Arc<dyn EmbeddingProvider>>>,
    pub(crate) embedding_configs: RwLock<HashMap<String, EmbeddingConfig>>,
    pub(crate) mock: MockEmbedding,
    pub(crate) limiter: Limiter,
    pub(crate) retention: Option<RetentionHook>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let limiter = config
            .limiter_capacity
            .map(Limiter::new)
            .unwrap_or_default();
        Self {
            inner: Arc::new(MemoryInner {
                entities: RwLock::new(IndexMap::new()),
                relations: RwLock::new(IndexMap::new()),
                events: RwLock::new(Vec::new()),
                subscribers: SubscriberRegistry::new(),
                actions: RwLock::new(IndexMap::new()),
                artifacts: RwLock::new(IndexMap::new()),
                embedder: RwLock::new(None),
                embedding_configs: RwLock::new(HashMap::new()),
                mock: MockEmbedding::default(),
                limiter,
                retention: config.retention,
            }),
        }
    }

    /// Install an embedding backend. Failures at call time fall back to
    /// the built-in mock generator.
    pub fn set_embedding_provider(&self, provider: Arc<dyn EmbeddingProvider>) {
        *self.inner.embedder.write() = Some(provider);
    }

    /// Per-type automatic embedding policy.
    pub fn configure_embedding(&self, entity_type: &str, config: EmbeddingConfig) {
        self.inner
            .embedding_configs
            .write()
            .insert(entity_type.to_string(), config);
    }

    pub fn limiter(&self) -> &Limiter {
        &self.inner.limiter
    }

    // ========================================================================
    // Entity CRUD
    // ========================================================================

    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Record>> {
        validate_type_name(entity_type)?;
        validate_entity_id(id)?;
        let entities = self.inner.entities.read();
        Ok(entities
            .get(entity_type)
            .and_then(|map| map.get(id))
            .map(Entity::record))
    }

    pub async fn list(&self, entity_type: &str, options: ListOptions) -> Result<Vec<Record>> {
        validate_type_name(entity_type)?;
        if let Some(filter) = &options.filter {
            for key in filter.keys() {
                validate_field_name(key)?;
            }
        }
        if let Some(order_by) = &options.order_by {
            validate_field_name(order_by)?;
        }

        let mut records: Vec<Record> = {
            let entities = self.inner.entities.read();
            entities
                .get(entity_type)
                .map(|map| map.values().map(Entity::record).collect())
                .unwrap_or_default()
        };

        if let Some(filter) = &options.filter {
            records.retain(|record| {
                filter
                    .iter()
                    .all(|(key, expected)| record.get(key) == Some(expected))
            });
        }

        if let Some(order_by) = &options.order_by {
            let descending = options.order == SortOrder::Descending;
            records.sort_by(|a, b| {
                let ord = match (a.get(order_by), b.get(order_by)) {
                    (None, None) => Ordering::Equal,
                    // Missing values sort last ascending, first descending.
                    (None, Some(_)) => Ordering::Greater,
                    (Some(_), None) => Ordering::Less,
                    (Some(x), Some(y)) => json_cmp(x, y).unwrap_or(Ordering::Equal),
                };
                if descending { ord.reverse() } else { ord }
            });
        }

        let offset = options.offset.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn create(
        &self,
        entity_type: &str,
        id: Option<&str>,
        data: Record,
    ) -> Result<Record> {
        validate_type_name(entity_type)?;
        if let Some(id) = id {
            validate_entity_id(id)?;
        }
        reject_dangerous_keys(&data)?;

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let entity = {
            let mut entities = self.inner.entities.write();
            let map = entities.entry(entity_type.to_string()).or_default();
            if map.contains_key(&id) {
                return Err(Error::AlreadyExists(format!("{entity_type}/{id}")));
            }
            let entity = Entity::new(entity_type, id.clone(), data);
            map.insert(id.clone(), entity.clone());
            entity
        };

        self.auto_embed(&entity).await?;
        let record = entity.record();
        self.emit_entity_events(entity_type, &id, "created", &record)
            .await?;
        Ok(record)
    }

    pub async fn update(&self, entity_type: &str, id: &str, patch: Record) -> Result<Record> {
        validate_type_name(entity_type)?;
        validate_entity_id(id)?;
        reject_dangerous_keys(&patch)?;

        let entity = {
            let mut entities = self.inner.entities.write();
            let entity = entities
                .get_mut(entity_type)
                .and_then(|map| map.get_mut(id))
                .ok_or_else(|| Error::NotFound(format!("{entity_type}/{id}")))?;
            entity.apply_patch(patch);
            entity.clone()
        };

        let url = entity_url(entity_type, id);
        self.invalidate_derived_artifacts(&url);
        self.auto_embed(&entity).await?;
        let record = entity.record();
        self.emit_entity_events(entity_type, id, "updated", &record)
            .await?;
        Ok(record)
    }

    /// Full-field replacement: keeps `createdAt`, runs the update
    /// side-effect chain. Field removal goes through here.
    pub async fn replace(&self, entity_type: &str, id: &str, data: Record) -> Result<Record> {
        validate_type_name(entity_type)?;
        validate_entity_id(id)?;
        reject_dangerous_keys(&data)?;

        let entity = {
            let mut entities = self.inner.entities.write();
            let entity = entities
                .get_mut(entity_type)
                .and_then(|map| map.get_mut(id))
                .ok_or_else(|| Error::NotFound(format!("{entity_type}/{id}")))?;
            entity.fields.clear();
            entity.apply_patch(data);
            entity.clone()
        };

        let url = entity_url(entity_type, id);
        self.invalidate_derived_artifacts(&url);
        self.auto_embed(&entity).await?;
        let record = entity.record();
        self.emit_entity_events(entity_type, id, "updated", &record)
            .await?;
        Ok(record)
    }

    pub async fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        validate_type_name(entity_type)?;
        validate_entity_id(id)?;

        let removed = {
            let mut entities = self.inner.entities.write();
            entities
                .get_mut(entity_type)
                .and_then(|map| map.shift_remove(id))
        };
        let Some(entity) = removed else {
            return Ok(false);
        };

        self.cleanup_relations(entity_type, id);
        self.remove_all_artifacts(&entity_url(entity_type, id));
        let record = entity.record();
        self.emit_entity_events(entity_type, id, "deleted", &record)
            .await?;
        Ok(true)
    }

    // ========================================================================
    // Batches — length is checked before any per-item work begins
    // ========================================================================

    pub async fn create_many(
        &self,
        entity_type: &str,
        items: Vec<(Option<String>, Record)>,
    ) -> Result<Vec<Record>> {
        validate_batch_len(items.len())?;
        let mut out = Vec::with_capacity(items.len());
        for (id, data) in items {
            out.push(self.create(entity_type, id.as_deref(), data).await?);
        }
        Ok(out)
    }

    pub async fn update_many(
        &self,
        entity_type: &str,
        items: Vec<(String, Record)>,
    ) -> Result<Vec<Record>> {
        validate_batch_len(items.len())?;
        let mut out = Vec::with_capacity(items.len());
        for (id, patch) in items {
            out.push(self.update(entity_type, &id, patch).await?);
        }
        Ok(out)
    }

    pub async fn delete_many(&self, entity_type: &str, ids: Vec<String>) -> Result<usize> {
        validate_batch_len(ids.len())?;
        let mut deleted = 0;
        for id in ids {
            if self.delete(entity_type, &id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub async fn perform_many(&self, drafts: Vec<ActionDraft>) -> Result<Vec<Action>> {
        validate_batch_len(drafts.len())?;
        let mut out = Vec::with_capacity(drafts.len());
        for draft in drafts {
            out.push(self.create_action(draft).await?);
        }
        Ok(out)
    }

    // ========================================================================
    // Relations
    // ========================================================================

    pub async fn relate(
        &self,
        from_type: &str,
        from_id: &str,
        relation: &str,
        to_type: &str,
        to_id: &str,
        options: RelateOptions,
    ) -> Result<()> {
        validate_type_name(from_type)?;
        validate_type_name(to_type)?;
        validate_entity_id(from_id)?;
        validate_entity_id(to_id)?;
        validate_field_name(relation)?;

        // Both endpoints must exist.
        {
            let entities = self.inner.entities.read();
            let exists = |t: &str, id: &str| {
                entities.get(t).is_some_and(|map| map.contains_key(id))
            };
            if !exists(from_type, from_id) {
                return Err(Error::NotFound(format!("{from_type}/{from_id}")));
            }
            if !exists(to_type, to_id) {
                return Err(Error::NotFound(format!("{to_type}/{to_id}")));
            }
        }

        let key = relation_key(from_type, from_id, relation);
        let target = target_key(to_type, to_id);
        self.inner
            .relations
            .write()
            .entry(key)
            .or_default()
            .insert(target.clone());

        let meta = options_meta(&options);
        let mut draft = EventDraft::new("Relation.created")
            .object(entity_url(from_type, from_id))
            .object_data(serde_json::json!({
                "from": target_key(from_type, from_id),
                "to": target,
                "relation": relation,
            }));
        if let Some(meta) = meta {
            draft = draft.meta(meta);
        }
        self.emit(draft).await?;
        Ok(())
    }

    pub async fn unrelate(
        &self,
        from_type: &str,
        from_id: &str,
        relation: &str,
        to_type: &str,
        to_id: &str,
    ) -> Result<bool> {
        validate_type_name(from_type)?;
        validate_type_name(to_type)?;
        validate_entity_id(from_id)?;
        validate_entity_id(to_id)?;
        validate_field_name(relation)?;

        let key = relation_key(from_type, from_id, relation);
        let target = target_key(to_type, to_id);
        let mut relations = self.inner.relations.write();
        let Some(targets) = relations.get_mut(&key) else {
            return Ok(false);
        };
        let removed = targets.shift_remove(&target);
        if targets.is_empty() {
            relations.shift_remove(&key);
        }
        Ok(removed)
    }

    pub async fn related(
        &self,
        entity_type: &str,
        id: &str,
        relation: &str,
    ) -> Result<Vec<Record>> {
        validate_type_name(entity_type)?;
        validate_entity_id(id)?;
        validate_field_name(relation)?;

        let targets: Vec<String> = {
            let relations = self.inner.relations.read();
            relations
                .get(&relation_key(entity_type, id, relation))
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        let entities = self.inner.entities.read();
        Ok(targets
            .iter()
            .filter_map(|target| {
                let (to_type, to_id) = target.split_once(':')?;
                entities
                    .get(to_type)
                    .and_then(|map| map.get(to_id))
                    .map(Entity::record)
            })
            .collect())
    }

    /// Remove every edge incident to `type:id`, in both directions.
    fn cleanup_relations(&self, entity_type: &str, id: &str) {
        let prefix = format!("{entity_type}:{id}:");
        let target = target_key(entity_type, id);
        let mut relations = self.inner.relations.write();
        relations.retain(|key, _| !key.starts_with(&prefix));
        for targets in relations.values_mut() {
            targets.shift_remove(&target);
        }
        relations.retain(|_, targets| !targets.is_empty());
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub async fn stats(&self) -> Result<StoreStats> {
        let entity_counts: IndexMap<String, usize> = {
            let entities = self.inner.entities.read();
            entities
                .iter()
                .map(|(name, map)| (name.clone(), map.len()))
                .collect()
        };
        let relation_count = self
            .inner
            .relations
            .read()
            .values()
            .map(IndexSet::len)
            .sum();
        let mut action_counts: IndexMap<String, usize> = IndexMap::new();
        for action in self.inner.actions.read().values() {
            *action_counts
                .entry(action.status.as_str().to_string())
                .or_default() += 1;
        }
        Ok(StoreStats {
            entity_counts,
            relation_count,
            event_count: self.inner.events.read().len(),
            action_counts,
            artifact_count: self.inner.artifacts.read().len(),
            limiter_active: self.inner.limiter.active(),
            limiter_pending: self.inner.limiter.pending(),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn relation_key(from_type: &str, from_id: &str, relation: &str) -> String {
    format!("{from_type}:{from_id}:{relation}")
}

pub(crate) fn target_key(entity_type: &str, id: &str) -> String {
    format!("{entity_type}:{id}")
}

fn reject_dangerous_keys(data: &Record) -> Result<()> {
    for key in data.keys() {
        if DANGEROUS_KEYS.contains(&key.as_str()) {
            return Err(Error::Validation(format!(
                "field name '{key}' is not allowed"
            )));
        }
    }
    Ok(())
}

fn options_meta(options: &RelateOptions) -> Option<Value> {
    if options.match_mode.is_none()
        && options.similarity.is_none()
        && options.matched_type.is_none()
    {
        return None;
    }
    serde_json::to_value(options).ok()
}

/// Total-ish ordering over JSON scalars: null < bool < number < string;
/// containers compare by serialization. `None` for cross-class pairs.
pub(crate) fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.partial_cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().partial_cmp(&y.as_f64())
        }
        (Value::String(x), Value::String(y)) => x.partial_cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            let x = serde_json::to_string(a).ok()?;
            let y = serde_json::to_string(b).ok()?;
            x.partial_cmp(&y)
        }
        _ => None,
    }
}

// ============================================================================
// Provider impl — thin delegation to the inherent methods
// ============================================================================

#[async_trait]
impl Provider for MemoryProvider {
    type Txn = MemoryTransaction;

    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Record>> {
        MemoryProvider::get(self, entity_type, id).await
    }

    async fn list(&self, entity_type: &str, options: ListOptions) -> Result<Vec<Record>> {
        MemoryProvider::list(self, entity_type, options).await
    }

    async fn create(&self, entity_type: &str, id: Option<&str>, data: Record) -> Result<Record> {
        MemoryProvider::create(self, entity_type, id, data).await
    }

    async fn update(&self, entity_type: &str, id: &str, patch: Record) -> Result<Record> {
        MemoryProvider::update(self, entity_type, id, patch).await
    }

    async fn replace(&self, entity_type: &str, id: &str, data: Record) -> Result<Record> {
        MemoryProvider::replace(self, entity_type, id, data).await
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        MemoryProvider::delete(self, entity_type, id).await
    }

    async fn create_many(
        &self,
        entity_type: &str,
        items: Vec<(Option<String>, Record)>,
    ) -> Result<Vec<Record>> {
        MemoryProvider::create_many(self, entity_type, items).await
    }

    async fn update_many(
        &self,
        entity_type: &str,
        items: Vec<(String, Record)>,
    ) -> Result<Vec<Record>> {
        MemoryProvider::update_many(self, entity_type, items).await
    }

    async fn delete_many(&self, entity_type: &str, ids: Vec<String>) -> Result<usize> {
        MemoryProvider::delete_many(self, entity_type, ids).await
    }

    async fn perform_many(&self, drafts: Vec<ActionDraft>) -> Result<Vec<Action>> {
        MemoryProvider::perform_many(self, drafts).await
    }

    async fn search(
        &self,
        entity_type: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<Record>> {
        MemoryProvider::search(self, entity_type, query, options).await
    }

    async fn semantic_search(
        &self,
        entity_type: &str,
        query: &str,
        options: SemanticSearchOptions,
    ) -> Result<Vec<Record>> {
        MemoryProvider::semantic_search(self, entity_type, query, options).await
    }

    async fn hybrid_search(
        &self,
        entity_type: &str,
        query: &str,
        options: HybridSearchOptions,
    ) -> Result<Vec<Record>> {
        MemoryProvider::hybrid_search(self, entity_type, query, options).await
    }

    async fn union_search(
        &self,
        types: &[String],
        query: &str,
        options: UnionSearchOptions,
    ) -> Result<UnionSearchResult> {
        MemoryProvider::union_search(self, types, query, options).await
    }

    async fn relate(
        &self,
        from_type: &str,
        from_id: &str,
        relation: &str,
        to_type: &str,
        to_id: &str,
        options: RelateOptions,
    ) -> Result<()> {
        MemoryProvider::relate(self, from_type, from_id, relation, to_type, to_id, options).await
    }

    async fn unrelate(
        &self,
        from_type: &str,
        from_id: &str,
        relation: &str,
        to_type: &str,
        to_id: &str,
    ) -> Result<bool> {
        MemoryProvider::unrelate(self, from_type, from_id, relation, to_type, to_id).await
    }

    async fn related(&self, entity_type: &str, id: &str, relation: &str) -> Result<Vec<Record>> {
        MemoryProvider::related(self, entity_type, id, relation).await
    }

    async fn emit(&self, draft: EventDraft) -> Result<Event> {
        MemoryProvider::emit(self, draft).await
    }

    fn on(&self, pattern: &str, handler: EventHandler) -> Subscription {
        MemoryProvider::on(self, pattern, handler)
    }

    async fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>> {
        MemoryProvider::list_events(self, filter).await
    }

    async fn replay_events(&self, filter: ReplayFilter, handler: EventHandler) -> Result<usize> {
        MemoryProvider::replay_events(self, filter, handler).await
    }

    async fn create_action(&self, draft: ActionDraft) -> Result<Action> {
        MemoryProvider::create_action(self, draft).await
    }

    async fn get_action(&self, id: &str) -> Result<Option<Action>> {
        MemoryProvider::get_action(self, id).await
    }

    async fn update_action(&self, id: &str, patch: ActionPatch) -> Result<Action> {
        MemoryProvider::update_action(self, id, patch).await
    }

    async fn list_actions(&self, filter: ActionFilter) -> Result<Vec<Action>> {
        MemoryProvider::list_actions(self, filter).await
    }

    async fn retry_action(&self, id: &str) -> Result<Action> {
        MemoryProvider::retry_action(self, id).await
    }

    async fn cancel_action(&self, id: &str) -> Result<Action> {
        MemoryProvider::cancel_action(self, id).await
    }

    async fn get_artifact(&self, url: &str, kind: &str) -> Result<Option<Artifact>> {
        MemoryProvider::get_artifact(self, url, kind).await
    }

    async fn set_artifact(&self, draft: ArtifactDraft) -> Result<Artifact> {
        MemoryProvider::set_artifact(self, draft).await
    }

    async fn delete_artifact(&self, url: &str) -> Result<usize> {
        MemoryProvider::delete_artifact(self, url).await
    }

    async fn list_artifacts(&self, url: &str) -> Result<Vec<Artifact>> {
        MemoryProvider::list_artifacts(self, url).await
    }

    fn begin_transaction(&self) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction::new(self.clone()))
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_semantic_search: true,
            supports_hybrid_search: true,
            supports_union_search: true,
            supports_transactions: true,
            max_batch_size: Some(crate::validate::MAX_BATCH),
        }
    }

    async fn stats(&self) -> Result<StoreStats> {
        MemoryProvider::stats(self).await
    }
}

// ============================================================================
// Tests
// ============================================================================
