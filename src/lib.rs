//! # entidb — Schema-first In-Process Entity Store
//!
//! A typed entity store that unifies five intertwined concerns behind a
//! single provider contract:
//!
//! 1. **Typed entity storage** — CRUD under declared entity types with
//!    auto-assigned ids and timestamps
//! 2. **Relationship graph** — named directed edges with schema-declared
//!    cardinality and cascade ordering
//! 3. **Event bus** — ordered Actor–Event–Object–Result log with pattern
//!    subscriptions, filtering, and replay
//! 4. **Action lifecycle** — long-running work items with a state machine
//!    and derived lifecycle events
//! 5. **Artifact cache + retrieval** — content-addressed per-entity
//!    artifacts (embeddings), plus full-text / vector / hybrid search
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `Provider` is the contract between callers and storage
//! 2. **Clean DTOs**: `Entity`, `Event`, `Action`, `Artifact` cross all boundaries
//! 3. **Schema owns nothing**: type string → `FieldSpec` is a pure function
//! 4. **Provider-agnostic migrations**: the executor only speaks the contract
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use entidb::{Store, SchemaSource, json_record};
//!
//! # async fn example() -> entidb::Result<()> {
//! let mut source = SchemaSource::new();
//! source.entity("Post", [("title", "string"), ("author", "->Author.posts")]);
//! source.entity("Author", [("name", "string")]);
//!
//! let store = Store::open_memory(&source)?;
//! let post = store.entity("Post")?
//!     .create(None, json_record!({"title": "Hello"}))
//!     .await?;
//! println!("{:?}", post.get("$id"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! | Provider | Description |
//! |----------|-------------|
//! | `MemoryProvider` | In-memory reference implementation, authoritative within one process |
//! | (adapters) | SQL-like / columnar backends implement the same `Provider` contract |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod schema;
pub mod validate;
pub mod limiter;
pub mod verbs;
pub mod embedding;
pub mod provider;
pub mod migrate;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Entity, Record, Event, EventDraft, Action, ActionStatus, ActionDraft,
    ActionPatch, Artifact, ArtifactDraft, MigrationRecord, RESERVED_KEYS,
};

// ============================================================================
// Re-exports: Schema layer
// ============================================================================

pub use schema::{
    Schema, SchemaSource, EntitySchema, FieldSpec, FieldType, Primitive,
    RefOperator, MatchMode, RefDirection, IndexKind,
    DependencyGraph, DependencyEdge, SchemaDiff, diff_schemas,
};

// ============================================================================
// Re-exports: Provider contract
// ============================================================================

pub use provider::{
    Provider, ProviderCapabilities, MemoryProvider, MemoryTransaction,
    StoreTransaction, ListOptions, SortOrder, SearchOptions,
    SemanticSearchOptions, HybridSearchOptions, UnionSearchOptions,
    UnionSearchMode, UnionErrorPolicy, UnionSearchResult,
    EventFilter, ReplayFilter, ActionFilter, RelateOptions,
    EventHandler, Subscription, StoreStats, StoreConfig, RetentionHook,
};

// ============================================================================
// Re-exports: Embedding, limiter, migrations
// ============================================================================

pub use embedding::{EmbeddingProvider, MockEmbedding, EmbeddingConfig, cosine_similarity};
pub use limiter::Limiter;
pub use migrate::{Migration, MigrationOp, MigrationReport, Migrator};

use std::sync::Arc;

// ============================================================================
// Top-level Store handle
// ============================================================================

/// The primary entry point. A `Store` binds a parsed schema, its dependency
/// graph, and a storage provider, and hands out per-type entity handles.
pub struct Store<P: Provider = MemoryProvider> {
    schema: Arc<Schema>,
    graph: Arc<DependencyGraph>,
    provider: Arc<P>,
}

impl<P: Provider> Store<P> {
    /// Create a Store from an already-parsed schema and provider.
    pub fn with_provider(schema: Schema, provider: P) -> Self {
        let graph = DependencyGraph::build(&schema);
        Self {
            schema: Arc::new(schema),
            graph: Arc::new(graph),
            provider: Arc::new(provider),
        }
    }

    /// The parsed schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The dependency graph derived from the schema.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Access the underlying provider (for advanced use).
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// A typed handle for one declared entity type.
    ///
    /// Fails with `Error::Validation` when the type is not in the schema —
    /// the dynamic `db.Post.create(...)` surface resolves through here.
    pub fn entity(&self, type_name: &str) -> Result<EntityHandle<'_, P>> {
        if !self.schema.entities.contains_key(type_name) {
            return Err(Error::Validation(format!(
                "unknown entity type '{type_name}'"
            )));
        }
        Ok(EntityHandle {
            store: self,
            type_name: type_name.to_string(),
        })
    }
}

impl Store<MemoryProvider> {
    /// Parse a schema source and open an in-memory store over it.
    pub fn open_memory(source: &SchemaSource) -> Result<Self> {
        let schema = schema::parse_schema(source)?;
        Ok(Self::with_provider(schema, MemoryProvider::new()))
    }
}

/// Per-type operation handle, the target of the `db.Post.create(...)` surface.
pub struct EntityHandle<'s, P: Provider> {
    store: &'s Store<P>,
    type_name: String,
}

impl<'s, P: Provider> EntityHandle<'s, P> {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub async fn create(&self, id: Option<&str>, data: Record) -> Result<Record> {
        self.store.provider.create(&self.type_name, id, data).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        self.store.provider.get(&self.type_name, id).await
    }

    pub async fn list(&self, options: ListOptions) -> Result<Vec<Record>> {
        self.store.provider.list(&self.type_name, options).await
    }

    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<Record>> {
        self.store.provider.search(&self.type_name, query, options).await
    }

    pub async fn semantic_search(
        &self,
        query: &str,
        options: SemanticSearchOptions,
    ) -> Result<Vec<Record>> {
        self.store
            .provider
            .semantic_search(&self.type_name, query, options)
            .await
    }

    pub async fn hybrid_search(
        &self,
        query: &str,
        options: HybridSearchOptions,
    ) -> Result<Vec<Record>> {
        self.store
            .provider
            .hybrid_search(&self.type_name, query, options)
            .await
    }

    pub async fn update(&self, id: &str, patch: Record) -> Result<Record> {
        self.store.provider.update(&self.type_name, id, patch).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.provider.delete(&self.type_name, id).await
    }

    pub async fn related(&self, id: &str, relation: &str) -> Result<Vec<Record>> {
        self.store.provider.related(&self.type_name, id, relation).await
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error taxonomy of the store. One variant per kind; providers and the
/// schema layer share it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("capability not supported: {method} ({suggestion})")]
    CapabilityNotSupported {
        method: &'static str,
        suggestion: &'static str,
    },

    #[error("invalid schema at {path}: {message}")]
    InvalidSchema { path: String, message: String },

    #[error("transaction is closed")]
    TransactionClosed,

    #[error("batch of {len} exceeds maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("embedding backend error: {0}")]
    EmbeddingBackend(String),

    #[error("subscriber error: {0}")]
    Subscriber(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Record-building macro (tests, examples, call sites)
// ============================================================================

/// Build a [`Record`] from JSON object syntax.
///
/// ```rust
/// use entidb::json_record;
/// let r = json_record!({"title": "Hello", "views": 3});
/// assert_eq!(r["views"], 3);
/// ```
#[macro_export]
macro_rules! json_record {
    ($($tt:tt)*) => {
        match ::serde_json::json!($($tt)*) {
            ::serde_json::Value::Object(map) => map,
            other => panic!("json_record! expects an object, got {other}"),
        }
    };
}
