//! Ordered schema migrations with up/down operations.
//!
//! The executor only speaks the [`Provider`] contract, so any backend
//! that supports `replace` can migrate. The current version lives in a
//! single record of the `_SchemaVersion` entity type.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{Record, RESERVED_KEYS};
use crate::provider::{ListOptions, Provider};
use crate::{Error, Result};

/// Entity type holding the version record.
pub const VERSION_TYPE: &str = "_SchemaVersion";
/// Id of the single version record.
pub const VERSION_ID: &str = "current";

// ============================================================================
// Migration definitions
// ============================================================================

/// Value-level transform used by `ChangeType`.
pub type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
/// Record-level transform used by `TransformData`.
pub type RecordTransformFn = Arc<dyn Fn(Record) -> Record + Send + Sync>;
/// Record predicate used to scope `TransformData`.
pub type RecordFilterFn = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// One migration step.
#[derive(Clone)]
pub enum MigrationOp {
    /// Declare a new entity type. Storage is dynamic, so this is a
    /// bookkeeping marker; data appears with the first create.
    AddEntity { name: String },
    /// Drop an entity type, deleting its records when `delete_data`.
    RemoveEntity { name: String, delete_data: bool },
    /// Add a field to every record, with an optional default value.
    AddField {
        entity: String,
        field: String,
        default: Option<Value>,
    },
    /// Remove a field from every record.
    RemoveField { entity: String, field: String },
    /// Rename a field on every record.
    RenameField {
        entity: String,
        from: String,
        to: String,
    },
    /// Re-type a field by mapping each present value.
    ChangeType {
        entity: String,
        field: String,
        transform: TransformFn,
    },
    /// Arbitrary record rewrite, optionally scoped by a filter.
    TransformData {
        entity: String,
        transform: RecordTransformFn,
        filter: Option<RecordFilterFn>,
    },
}

/// A versioned migration: `up` moves the schema forward, `down` reverts it.
#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub description: String,
    pub up: Vec<MigrationOp>,
    pub down: Vec<MigrationOp>,
}

impl Migration {
    pub fn new(version: u32, description: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            up: Vec::new(),
            down: Vec::new(),
        }
    }

    pub fn up(mut self, op: MigrationOp) -> Self {
        self.up.push(op);
        self
    }

    pub fn down(mut self, op: MigrationOp) -> Self {
        self.down.push(op);
        self
    }
}

/// Outcome of a `migrate` call. Operation failures land in `errors`
/// rather than failing the call; the version stops at the last fully
/// applied migration.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub migrations_run: usize,
    pub from_version: u32,
    pub to_version: u32,
    pub applied_migrations: Vec<u32>,
    pub errors: Vec<String>,
}

// ============================================================================
// Executor
// ============================================================================

/// Runs migrations against a provider.
pub struct Migrator<'p, P: Provider> {
    provider: &'p P,
}

impl<'p, P: Provider> Migrator<'p, P> {
    pub fn new(provider: &'p P) -> Self {
        Self { provider }
    }

    /// The currently applied version; 0 when never migrated.
    pub async fn current_version(&self) -> Result<u32> {
        let record = self.provider.get(VERSION_TYPE, VERSION_ID).await?;
        Ok(record
            .and_then(|r| r.get("version").and_then(Value::as_u64))
            .unwrap_or(0) as u32)
    }

    /// Apply (or revert) migrations toward `target`, defaulting to the
    /// highest provided version.
    ///
    /// Versions must be strictly sequential starting at 1. Upward, each
    /// pending migration's `up` ops run in ascending order, bumping the
    /// version after each; downward, `down` ops run in descending order.
    /// The first failing operation halts the run.
    pub async fn migrate(
        &self,
        migrations: &[Migration],
        target: Option<u32>,
    ) -> Result<MigrationReport> {
        let mut ordered: Vec<&Migration> = migrations.iter().collect();
        ordered.sort_by_key(|m| m.version);
        for (index, migration) in ordered.iter().enumerate() {
            let expected = index as u32 + 1;
            if migration.version != expected {
                return Err(Error::Validation(format!(
                    "migration versions must be sequential from 1; found {} at position {}",
                    migration.version, expected
                )));
            }
        }

        let from_version = self.current_version().await?;
        let max_version = ordered.len() as u32;
        let target = target.unwrap_or(max_version);
        if target > max_version {
            return Err(Error::Validation(format!(
                "target version {target} exceeds highest migration {max_version}"
            )));
        }

        let mut report = MigrationReport {
            from_version,
            to_version: from_version,
            ..Default::default()
        };

        if target > from_version {
            for migration in ordered
                .iter()
                .filter(|m| m.version > from_version && m.version <= target)
            {
                debug!(version = migration.version, "applying migration");
                if let Err(err) = self.apply_ops(&migration.up).await {
                    warn!(version = migration.version, error = %err, "migration failed");
                    report
                        .errors
                        .push(format!("migration {} failed: {err}", migration.version));
                    break;
                }
                self.set_version(migration.version, &migration.description)
                    .await?;
                report.applied_migrations.push(migration.version);
                report.migrations_run += 1;
                report.to_version = migration.version;
            }
        } else if target < from_version {
            for migration in ordered
                .iter()
                .rev()
                .filter(|m| m.version <= from_version && m.version > target)
            {
                debug!(version = migration.version, "reverting migration");
                if let Err(err) = self.apply_ops(&migration.down).await {
                    warn!(version = migration.version, error = %err, "revert failed");
                    report
                        .errors
                        .push(format!("revert of {} failed: {err}", migration.version));
                    break;
                }
                let next = migration.version - 1;
                self.set_version(next, &format!("revert of: {}", migration.description))
                    .await?;
                report.applied_migrations.push(migration.version);
                report.migrations_run += 1;
                report.to_version = next;
            }
        }

        Ok(report)
    }

    async fn apply_ops(&self, ops: &[MigrationOp]) -> Result<()> {
        for op in ops {
            self.apply_op(op).await?;
        }
        Ok(())
    }

    async fn apply_op(&self, op: &MigrationOp) -> Result<()> {
        match op {
            MigrationOp::AddEntity { name } => {
                crate::validate::validate_type_name(name)?;
            }
            MigrationOp::RemoveEntity { name, delete_data } => {
                if *delete_data {
                    for id in self.entity_ids(name).await? {
                        self.provider.delete(name, &id).await?;
                    }
                }
            }
            MigrationOp::AddField {
                entity,
                field,
                default,
            } => {
                crate::validate::validate_field_name(field)?;
                for (id, fields) in self.entity_fields(entity).await? {
                    if fields.contains_key(field) {
                        continue;
                    }
                    let mut patch = Record::new();
                    patch.insert(field.clone(), default.clone().unwrap_or(Value::Null));
                    self.provider.update(entity, &id, patch).await?;
                }
            }
            MigrationOp::RemoveField { entity, field } => {
                for (id, mut fields) in self.entity_fields(entity).await? {
                    if fields.shift_remove(field).is_some() {
                        self.provider.replace(entity, &id, fields).await?;
                    }
                }
            }
            MigrationOp::RenameField { entity, from, to } => {
                crate::validate::validate_field_name(to)?;
                for (id, mut fields) in self.entity_fields(entity).await? {
                    let Some(value) = fields.shift_remove(from) else { continue };
                    fields.insert(to.clone(), value);
                    self.provider.replace(entity, &id, fields).await?;
                }
            }
            MigrationOp::ChangeType {
                entity,
                field,
                transform,
            } => {
                for (id, fields) in self.entity_fields(entity).await? {
                    let Some(value) = fields.get(field) else { continue };
                    let mut patch = Record::new();
                    patch.insert(field.clone(), transform(value.clone()));
                    self.provider.update(entity, &id, patch).await?;
                }
            }
            MigrationOp::TransformData {
                entity,
                transform,
                filter,
            } => {
                for (id, fields) in self.entity_fields(entity).await? {
                    if let Some(filter) = filter {
                        if !filter(&fields) {
                            continue;
                        }
                    }
                    let next = transform(fields);
                    self.provider.replace(entity, &id, next).await?;
                }
            }
        }
        Ok(())
    }

    async fn entity_ids(&self, entity: &str) -> Result<Vec<String>> {
        let records = self.provider.list(entity, ListOptions::default()).await?;
        Ok(records
            .iter()
            .filter_map(|r| r.get("$id").and_then(Value::as_str).map(String::from))
            .collect())
    }

    /// All records of the type as `(id, bare fields)` pairs.
    async fn entity_fields(&self, entity: &str) -> Result<Vec<(String, Record)>> {
        let records = self.provider.list(entity, ListOptions::default()).await?;
        Ok(records
            .into_iter()
            .filter_map(|mut record| {
                let id = record.get("$id").and_then(Value::as_str)?.to_string();
                for key in RESERVED_KEYS {
                    record.shift_remove(*key);
                }
                record.shift_remove("createdAt");
                record.shift_remove("updatedAt");
                Some((id, record))
            })
            .collect())
    }

    async fn set_version(&self, version: u32, description: &str) -> Result<()> {
        let mut fields = Record::new();
        fields.insert("version".into(), Value::from(version));
        fields.insert("description".into(), Value::from(description));
        fields.insert("appliedAt".into(), Value::from(Utc::now().to_rfc3339()));
        if self.provider.get(VERSION_TYPE, VERSION_ID).await?.is_some() {
            self.provider.replace(VERSION_TYPE, VERSION_ID, fields).await?;
        } else {
            self.provider
                .create(VERSION_TYPE, Some(VERSION_ID), fields)
                .await?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
