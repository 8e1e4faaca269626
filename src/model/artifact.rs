//! Artifacts — derived blobs scoped to an entity URL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A content-addressed artifact. Keyed by `(url, kind)`; at most one per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// `"<Type>/<id>"` of the owning entity.
    pub url: String,
    /// e.g. `"embedding"`, `"rendered"`.
    pub kind: String,
    /// Hash of the source content the artifact was derived from.
    pub source_hash: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Input to `set_artifact`.
#[derive(Debug, Clone)]
pub struct ArtifactDraft {
    pub url: String,
    pub kind: String,
    pub source_hash: String,
    pub content: Value,
    pub metadata: Option<Value>,
}

impl ArtifactDraft {
    pub fn new(
        url: impl Into<String>,
        kind: impl Into<String>,
        source_hash: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            url: url.into(),
            kind: kind.into(),
            source_hash: source_hash.into(),
            content,
            metadata: None,
        }
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The artifact URL of an entity.
pub fn entity_url(entity_type: &str, id: &str) -> String {
    format!("{entity_type}/{id}")
}
