//! # Provider Contract
//!
//! This is THE contract between callers and any storage engine. The
//! in-memory reference implementation lives in [`memory`]; persistent
//! adapters (SQL-like or columnar) implement the same trait and convert
//! their native row shape into the `Record` projection.
//!
//! Methods an adapter cannot serve default to
//! `Error::CapabilityNotSupported` with a suggested alternative;
//! `capabilities()` lets callers negotiate up front.

pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::{
    Action, ActionDraft, ActionPatch, ActionStatus, Artifact, ArtifactDraft, Event, EventDraft,
    Record,
};
use crate::{Error, Result};

pub use memory::{MemoryProvider, MemoryTransaction};

// ============================================================================
// Read options
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Options for `list`: equality filter, ordering, pagination.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Equality filter over validated field names.
    pub filter: Option<Record>,
    pub order_by: Option<String>,
    pub order: SortOrder,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn filter(mut self, filter: Record) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some(field.into());
        self.order = order;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Options for full-text `search`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Fields to search; `None` searches the serialized record (`$all`).
    pub fields: Option<Vec<String>>,
    pub min_score: f64,
    pub limit: Option<usize>,
}

/// Options for `semantic_search`.
#[derive(Debug, Clone)]
pub struct SemanticSearchOptions {
    pub min_score: f32,
    pub limit: usize,
}

impl Default for SemanticSearchOptions {
    fn default() -> Self {
        Self {
            min_score: 0.0,
            limit: 10,
        }
    }
}

/// Options for `hybrid_search` — reciprocal-rank fusion of FTS and
/// semantic ranks: `w_fts/(k + fts_rank) + w_sem/(k + sem_rank)`.
#[derive(Debug, Clone)]
pub struct HybridSearchOptions {
    pub limit: usize,
    pub offset: usize,
    /// RRF dampening constant.
    pub k: f64,
    pub fts_weight: f64,
    pub semantic_weight: f64,
    /// FTS fields; `None` searches the serialized record.
    pub fields: Option<Vec<String>>,
}

impl Default for HybridSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
            k: 60.0,
            fts_weight: 0.5,
            semantic_weight: 0.5,
            fields: None,
        }
    }
}

// ============================================================================
// Union fallback search
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnionSearchMode {
    /// Search each type in declaration order; stop at the first with a hit.
    #[default]
    Ordered,
    /// Search all types concurrently.
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnionErrorPolicy {
    /// Collect per-type failures into `errors` and keep going.
    #[default]
    Continue,
    /// Surface the first per-type failure.
    Fail,
}

#[derive(Debug, Clone)]
pub struct UnionSearchOptions {
    pub mode: UnionSearchMode,
    pub limit: usize,
    /// Global similarity threshold.
    pub threshold: f32,
    /// Per-type overrides of the global threshold.
    pub per_type_thresholds: HashMap<String, f32>,
    /// Parallel mode: return all merged results instead of the single best.
    pub return_all: bool,
    pub on_error: UnionErrorPolicy,
    /// Ordered mode: when every type misses, also report the best
    /// below-threshold candidates for debugging.
    pub collect_below_threshold: bool,
}

impl Default for UnionSearchOptions {
    fn default() -> Self {
        Self {
            mode: UnionSearchMode::Ordered,
            limit: 10,
            threshold: 0.0,
            per_type_thresholds: HashMap::new(),
            return_all: false,
            on_error: UnionErrorPolicy::Continue,
            collect_below_threshold: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionSearchError {
    pub entity_type: String,
    pub message: String,
}

/// Outcome of a union fallback search over `Type1|Type2|…`.
#[derive(Debug, Clone, Default)]
pub struct UnionSearchResult {
    pub results: Vec<Record>,
    pub searched_types: Vec<String>,
    pub search_order: Vec<String>,
    pub matched_type: Option<String>,
    pub fallback_triggered: bool,
    pub all_types_exhausted: bool,
    pub below_threshold_matches: Vec<Record>,
    pub errors: Vec<UnionSearchError>,
}

// ============================================================================
// Relations, events, actions
// ============================================================================

/// Optional match metadata carried on the `Relation.created` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_mode: Option<crate::schema::MatchMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_type: Option<String>,
}

/// Filter for `list_events`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Event name pattern (literal, `*`, `Prefix.*`, `*.suffix`).
    pub event: Option<String>,
    pub actor: Option<String>,
    pub object: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Most recent N (chronological order preserved).
    pub limit: Option<usize>,
}

/// Filter for `replay_events`.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    pub event: Option<String>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Filter for `list_actions`.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub actor: Option<String>,
    pub object: Option<String>,
    pub limit: Option<usize>,
}

/// An async event subscriber. Errors are logged and never abort emission.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Handle for one handler–pattern binding. `unsubscribe` removes only
/// this binding; other handlers on the same pattern stay registered.
/// Dropping the handle without calling `unsubscribe` leaves the handler
/// installed.
pub struct Subscription {
    pattern: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            pattern: pattern.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Hook invoked after each append with mutable access to the log.
/// Retention policy (size- or age-bounded) is the integrator's choice;
/// without a hook the log grows unbounded.
pub type RetentionHook = Arc<dyn Fn(&mut Vec<Event>) + Send + Sync>;

/// Provider construction knobs.
#[derive(Clone, Default)]
pub struct StoreConfig {
    /// Concurrency limiter capacity; `None` uses the default of 10.
    pub limiter_capacity: Option<usize>,
    pub retention: Option<RetentionHook>,
}

// ============================================================================
// Capabilities + stats
// ============================================================================

/// What a provider can do — callers use this to negotiate before invoking
/// optional surface.
#[derive(Debug, Clone, Default)]
pub struct ProviderCapabilities {
    pub supports_semantic_search: bool,
    pub supports_hybrid_search: bool,
    pub supports_union_search: bool,
    pub supports_transactions: bool,
    pub max_batch_size: Option<usize>,
}

/// Point-in-time snapshot of provider state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub entity_counts: IndexMap<String, usize>,
    pub relation_count: usize,
    pub event_count: usize,
    pub action_counts: IndexMap<String, usize>,
    pub artifact_count: usize,
    pub limiter_active: usize,
    pub limiter_pending: usize,
}

// ============================================================================
// Transaction contract
// ============================================================================

/// Buffered-write transaction handle. All methods stay callable after
/// `commit` / `rollback` and fail with `TransactionClosed`.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Record>>;
    async fn create(&self, entity_type: &str, id: Option<&str>, data: Record) -> Result<Record>;
    async fn update(&self, entity_type: &str, id: &str, patch: Record) -> Result<Record>;
    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool>;
    async fn relate(
        &self,
        from_type: &str,
        from_id: &str,
        relation: &str,
        to_type: &str,
        to_id: &str,
        options: RelateOptions,
    ) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

// ============================================================================
// Provider trait
// ============================================================================

/// The universal storage contract.
///
/// The trait is intentionally broad — adapters return
/// `Error::CapabilityNotSupported` (via the provided defaults) for surface
/// they cannot serve rather than having a dozen optional traits.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// The transaction type for this provider.
    type Txn: StoreTransaction;

    // ========================================================================
    // Entity CRUD
    // ========================================================================

    /// Get one record, `None` when absent.
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Record>>;

    /// List records with validated `where` / `order_by` / pagination.
    async fn list(&self, entity_type: &str, options: ListOptions) -> Result<Vec<Record>>;

    /// Create a record, auto-assigning a UUID when `id` is `None`.
    /// Emits `<Type>.created` then `entity:created`.
    async fn create(&self, entity_type: &str, id: Option<&str>, data: Record) -> Result<Record>;

    /// Merge a patch into a record. Emits `<Type>.updated` then
    /// `entity:updated`, re-embeds, and invalidates derived artifacts.
    async fn update(&self, entity_type: &str, id: &str, patch: Record) -> Result<Record>;

    /// Replace a record's fields wholesale, keeping `createdAt`. Runs the
    /// update side-effect chain. Migrations use this for field removal.
    async fn replace(&self, _entity_type: &str, _id: &str, _data: Record) -> Result<Record> {
        Err(Error::CapabilityNotSupported {
            method: "replace",
            suggestion: "use update for merge semantics",
        })
    }

    /// Delete a record, its incident relations, and its artifacts.
    /// Returns false when absent.
    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool>;

    // ========================================================================
    // Batches — length is validated (≤ 1000) before any per-item work
    // ========================================================================

    async fn create_many(
        &self,
        entity_type: &str,
        items: Vec<(Option<String>, Record)>,
    ) -> Result<Vec<Record>>;

    async fn update_many(
        &self,
        entity_type: &str,
        items: Vec<(String, Record)>,
    ) -> Result<Vec<Record>>;

    async fn delete_many(&self, entity_type: &str, ids: Vec<String>) -> Result<usize>;

    /// Batch action creation.
    async fn perform_many(&self, drafts: Vec<ActionDraft>) -> Result<Vec<Action>>;

    // ========================================================================
    // Search
    // ========================================================================

    /// Case-insensitive substring search with positional scoring.
    async fn search(
        &self,
        entity_type: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<Record>>;

    /// Top-K by cosine similarity over stored embeddings.
    async fn semantic_search(
        &self,
        _entity_type: &str,
        _query: &str,
        _options: SemanticSearchOptions,
    ) -> Result<Vec<Record>> {
        Err(Error::CapabilityNotSupported {
            method: "semantic_search",
            suggestion: "use search for substring matching",
        })
    }

    /// Reciprocal-rank fusion of FTS and semantic results.
    async fn hybrid_search(
        &self,
        _entity_type: &str,
        _query: &str,
        _options: HybridSearchOptions,
    ) -> Result<Vec<Record>> {
        Err(Error::CapabilityNotSupported {
            method: "hybrid_search",
            suggestion: "use search or semantic_search directly",
        })
    }

    /// Union fallback search across candidate types (`<~A|B|…`).
    async fn union_search(
        &self,
        _types: &[String],
        _query: &str,
        _options: UnionSearchOptions,
    ) -> Result<UnionSearchResult> {
        Err(Error::CapabilityNotSupported {
            method: "union_search",
            suggestion: "call semantic_search per candidate type",
        })
    }

    // ========================================================================
    // Relations
    // ========================================================================

    async fn relate(
        &self,
        from_type: &str,
        from_id: &str,
        relation: &str,
        to_type: &str,
        to_id: &str,
        options: RelateOptions,
    ) -> Result<()>;

    async fn unrelate(
        &self,
        from_type: &str,
        from_id: &str,
        relation: &str,
        to_type: &str,
        to_id: &str,
    ) -> Result<bool>;

    async fn related(&self, entity_type: &str, id: &str, relation: &str) -> Result<Vec<Record>>;

    // ========================================================================
    // Events
    // ========================================================================

    /// Append an event and dispatch matching subscribers under the limiter.
    async fn emit(&self, draft: EventDraft) -> Result<Event>;

    /// Subscribe to an event pattern. The returned subscription removes
    /// only this handler–pattern binding.
    fn on(&self, pattern: &str, handler: EventHandler) -> Subscription;

    async fn list_events(&self, filter: EventFilter) -> Result<Vec<Event>>;

    /// Re-invoke a handler over filtered history in timestamp order.
    /// Returns the number of events replayed.
    async fn replay_events(&self, filter: ReplayFilter, handler: EventHandler) -> Result<usize>;

    // ========================================================================
    // Actions
    // ========================================================================

    async fn create_action(&self, draft: ActionDraft) -> Result<Action>;
    async fn get_action(&self, id: &str) -> Result<Option<Action>>;
    async fn update_action(&self, id: &str, patch: ActionPatch) -> Result<Action>;
    async fn list_actions(&self, filter: ActionFilter) -> Result<Vec<Action>>;
    async fn retry_action(&self, id: &str) -> Result<Action>;
    async fn cancel_action(&self, id: &str) -> Result<Action>;

    // ========================================================================
    // Artifacts
    // ========================================================================

    async fn get_artifact(&self, url: &str, kind: &str) -> Result<Option<Artifact>>;
    async fn set_artifact(&self, draft: ArtifactDraft) -> Result<Artifact>;
    /// Remove every kind scoped to `url`; returns how many were removed.
    async fn delete_artifact(&self, url: &str) -> Result<usize>;
    async fn list_artifacts(&self, url: &str) -> Result<Vec<Artifact>>;

    // ========================================================================
    // Transactions
    // ========================================================================

    fn begin_transaction(&self) -> Result<Self::Txn>;

    // ========================================================================
    // Introspection
    // ========================================================================

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    async fn stats(&self) -> Result<StoreStats>;
}
