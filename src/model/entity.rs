//! Entity records and their caller-facing projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys that never live inside `Entity::fields`. The projection re-attaches
/// `$id` and `$type`; search projections attach the score keys.
pub const RESERVED_KEYS: &[&str] = &[
    "$id",
    "$type",
    "$score",
    "$rrfScore",
    "$ftsRank",
    "$semanticRank",
];

/// The caller-facing shape of an entity: its fields plus `$id`, `$type`,
/// `createdAt`, `updatedAt`, and (for search results) score keys.
pub type Record = serde_json::Map<String, Value>;

/// A stored entity. `(entity_type, id)` is unique; `created_at` is immutable
/// after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub fields: Record,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, fields: Record) -> Self {
        let now = Utc::now();
        let mut entity = Self {
            id: id.into(),
            entity_type: entity_type.into(),
            fields,
            created_at: now,
            updated_at: now,
        };
        strip_reserved(&mut entity.fields);
        entity
    }

    /// Merge a patch into the fields, refreshing `updated_at`.
    pub fn apply_patch(&mut self, patch: Record) {
        for (key, value) in patch {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            self.fields.insert(key, value);
        }
        self.updated_at = Utc::now();
    }

    /// The read-only projection returned to callers.
    pub fn record(&self) -> Record {
        let mut record = self.fields.clone();
        record.insert("$id".into(), Value::String(self.id.clone()));
        record.insert("$type".into(), Value::String(self.entity_type.clone()));
        record.insert(
            "createdAt".into(),
            Value::String(self.created_at.to_rfc3339()),
        );
        record.insert(
            "updatedAt".into(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        record
    }

    /// Projection text used by full-text search over `$all`: the serialized
    /// record minus the reserved keys.
    pub fn search_text(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_default()
    }
}

/// Drop reserved keys from incoming field data.
pub(crate) fn strip_reserved(fields: &mut Record) {
    for key in RESERVED_KEYS {
        fields.shift_remove(*key);
    }
}

/// One applied schema migration, stored under the `_SchemaVersion` entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: u32,
    pub description: String,
    #[serde(rename = "appliedAt")]
    pub applied_at: DateTime<Utc>,
}
