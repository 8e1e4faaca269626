//! Structural schema comparison with rename inference.

use serde::{Deserialize, Serialize};

use super::parser::{FieldSpec, Schema};

/// Similarity floor for treating a removed/added field pair as a rename.
const RENAME_SIMILARITY: f64 = 0.5;

// ============================================================================
// Diff data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Type,
    Optional,
    Array,
    Operator,
    Target,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Type => "type",
            ChangeKind::Optional => "optional",
            ChangeKind::Array => "array",
            ChangeKind::Operator => "operator",
            ChangeKind::Target => "target",
        }
    }
}

/// One field whose specification changed between schema versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub name: String,
    pub kinds: Vec<ChangeKind>,
    pub from: String,
    pub to: String,
}

/// A removed/added field pair similar enough to be a rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameCandidate {
    pub from: String,
    pub to: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDiff {
    pub name: String,
    pub added_fields: Vec<String>,
    pub removed_fields: Vec<String>,
    pub changed_fields: Vec<FieldChange>,
    pub possible_renames: Vec<RenameCandidate>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.added_fields.is_empty()
            && self.removed_fields.is_empty()
            && self.changed_fields.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub added_entities: Vec<String>,
    pub removed_entities: Vec<String>,
    pub modified_entities: Vec<EntityDiff>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_entities.is_empty()
            && self.removed_entities.is_empty()
            && self.modified_entities.is_empty()
    }

    /// Human-readable report of the structural diff.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "schemas are identical".to_string();
        }
        let mut out = String::new();
        for name in &self.added_entities {
            out.push_str(&format!("+ entity {name}\n"));
        }
        for name in &self.removed_entities {
            out.push_str(&format!("- entity {name}\n"));
        }
        for entity in &self.modified_entities {
            out.push_str(&format!("~ entity {}\n", entity.name));
            for field in &entity.added_fields {
                out.push_str(&format!("  + field {field}\n"));
            }
            for field in &entity.removed_fields {
                out.push_str(&format!("  - field {field}\n"));
            }
            for change in &entity.changed_fields {
                let kinds: Vec<&str> = change.kinds.iter().map(ChangeKind::as_str).collect();
                out.push_str(&format!(
                    "  ~ field {} ({}): {} -> {}\n",
                    change.name,
                    kinds.join(", "),
                    change.from,
                    change.to
                ));
            }
            for rename in &entity.possible_renames {
                out.push_str(&format!(
                    "  ? rename {} -> {} (similarity {:.2})\n",
                    rename.from, rename.to, rename.similarity
                ));
            }
        }
        out
    }
}

// ============================================================================
// Diffing
// ============================================================================

/// Compare two parsed schemas structurally.
pub fn diff_schemas(old: &Schema, new: &Schema) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    for name in new.entities.keys() {
        if !old.entities.contains_key(name) {
            diff.added_entities.push(name.clone());
        }
    }
    for name in old.entities.keys() {
        if !new.entities.contains_key(name) {
            diff.removed_entities.push(name.clone());
        }
    }

    for (name, old_entity) in &old.entities {
        let Some(new_entity) = new.entities.get(name) else { continue };
        let mut entity_diff = EntityDiff {
            name: name.clone(),
            ..Default::default()
        };

        for field in new_entity.fields.keys() {
            if !old_entity.fields.contains_key(field) {
                entity_diff.added_fields.push(field.clone());
            }
        }
        for field in old_entity.fields.keys() {
            if !new_entity.fields.contains_key(field) {
                entity_diff.removed_fields.push(field.clone());
            }
        }
        for (field, old_spec) in &old_entity.fields {
            let Some(new_spec) = new_entity.fields.get(field) else { continue };
            let kinds = classify_change(old_spec, new_spec);
            if !kinds.is_empty() {
                entity_diff.changed_fields.push(FieldChange {
                    name: field.clone(),
                    kinds,
                    from: old_spec.canonical(),
                    to: new_spec.canonical(),
                });
            }
        }

        for removed in &entity_diff.removed_fields {
            for added in &entity_diff.added_fields {
                let similarity = strsim::jaro_winkler(removed, added);
                if similarity >= RENAME_SIMILARITY {
                    entity_diff.possible_renames.push(RenameCandidate {
                        from: removed.clone(),
                        to: added.clone(),
                        similarity,
                    });
                }
            }
        }
        entity_diff
            .possible_renames
            .sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        if !entity_diff.is_empty() {
            diff.modified_entities.push(entity_diff);
        }
    }

    diff
}

fn classify_change(old: &FieldSpec, new: &FieldSpec) -> Vec<ChangeKind> {
    let mut kinds = Vec::new();
    if old.field_type != new.field_type {
        kinds.push(ChangeKind::Type);
    }
    if old.is_optional != new.is_optional {
        kinds.push(ChangeKind::Optional);
    }
    if old.is_array != new.is_array {
        kinds.push(ChangeKind::Array);
    }
    if old.operator != new.operator {
        kinds.push(ChangeKind::Operator);
    }
    if old.target_type != new.target_type || old.union_types != new.union_types {
        kinds.push(ChangeKind::Target);
    }
    kinds
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_schema, SchemaSource};
    use pretty_assertions::assert_eq;

    fn schema(entities: &[(&str, &[(&str, &str)])]) -> Schema {
        let mut source = SchemaSource::new();
        for (name, fields) in entities {
            source.entity(*name, fields.iter().copied());
        }
        parse_schema(&source).unwrap()
    }

    #[test]
    fn test_identical_schemas() {
        let a = schema(&[("Post", &[("title", "string")])]);
        let diff = diff_schemas(&a, &a.clone());
        assert!(diff.is_empty());
        assert_eq!(diff.summary(), "schemas are identical");
    }

    #[test]
    fn test_added_and_removed_entities() {
        let old = schema(&[("Post", &[("title", "string")])]);
        let new = schema(&[("Author", &[("name", "string")])]);
        let diff = diff_schemas(&old, &new);
        assert_eq!(diff.added_entities, vec!["Author"]);
        assert_eq!(diff.removed_entities, vec!["Post"]);
    }

    #[test]
    fn test_field_changes_classified() {
        let old = schema(&[(
            "Post",
            &[
                ("title", "string"),
                ("category", "->Category"),
                ("tags", "[string]"),
            ],
        )]);
        let new = schema(&[(
            "Post",
            &[
                ("title", "string?"),
                ("category", "~>Topic"),
                ("tags", "string"),
            ],
        )]);
        let diff = diff_schemas(&old, &new);
        let entity = &diff.modified_entities[0];

        let title = entity.changed_fields.iter().find(|c| c.name == "title").unwrap();
        assert_eq!(title.kinds, vec![ChangeKind::Optional]);

        let category = entity
            .changed_fields
            .iter()
            .find(|c| c.name == "category")
            .unwrap();
        assert!(category.kinds.contains(&ChangeKind::Operator));
        assert!(category.kinds.contains(&ChangeKind::Target));

        let tags = entity.changed_fields.iter().find(|c| c.name == "tags").unwrap();
        assert_eq!(tags.kinds, vec![ChangeKind::Array]);
    }

    #[test]
    fn test_rename_detection() {
        let old = schema(&[("Post", &[("body_text", "string")])]);
        let new = schema(&[("Post", &[("body", "string")])]);
        let diff = diff_schemas(&old, &new);
        let entity = &diff.modified_entities[0];
        assert_eq!(entity.possible_renames.len(), 1);
        assert_eq!(entity.possible_renames[0].from, "body_text");
        assert_eq!(entity.possible_renames[0].to, "body");
        assert!(entity.possible_renames[0].similarity >= 0.5);
    }

    #[test]
    fn test_dissimilar_names_not_renames() {
        let old = schema(&[("Post", &[("qzx", "string")])]);
        let new = schema(&[("Post", &[("body", "string")])]);
        let diff = diff_schemas(&old, &new);
        let entity = &diff.modified_entities[0];
        assert!(entity.possible_renames.is_empty());
    }

    #[test]
    fn test_summary_mentions_changes() {
        let old = schema(&[("Post", &[("title", "string")])]);
        let new = schema(&[("Post", &[("title", "string?")])]);
        let summary = diff_schemas(&old, &new).summary();
        assert!(summary.contains("~ entity Post"));
        assert!(summary.contains("optional"));
        assert!(summary.contains("string -> string?"));
    }
}
