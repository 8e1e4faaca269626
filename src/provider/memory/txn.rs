//! Buffered-write transactions.
//!
//! A transaction stages creates/updates/deletes without touching the
//! store; `commit` replays the operation log against the provider in
//! insertion order, each replayed operation running its full side-effect
//! chain (events, embeddings, artifact invalidation). `rollback` discards
//! everything. Reads are tombstone-aware and read through to the store.

use async_trait::async_trait;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::Value;

use crate::model::Record;
use crate::provider::{RelateOptions, StoreTransaction};
use crate::{Error, Result};

use super::MemoryProvider;

// ============================================================================
// Transaction state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
enum TxnOp {
    Create {
        entity_type: String,
        id: String,
        data: Record,
    },
    Update {
        entity_type: String,
        id: String,
        patch: Record,
    },
    Delete {
        entity_type: String,
        id: String,
    },
    Relate {
        from_type: String,
        from_id: String,
        relation: String,
        to_type: String,
        to_id: String,
        options: RelateOptions,
    },
}

#[derive(Default)]
struct TxnState {
    /// type → (id → staged fields).
    staged: IndexMap<String, IndexMap<String, Record>>,
    /// type → ids deleted within the transaction.
    tombstones: IndexMap<String, IndexSet<String>>,
    operations: Vec<TxnOp>,
    temp_counter: u64,
}

/// One buffered transaction over a [`MemoryProvider`].
pub struct MemoryTransaction {
    provider: MemoryProvider,
    status: Mutex<TxnStatus>,
    state: Mutex<TxnState>,
}

impl MemoryTransaction {
    pub(crate) fn new(provider: MemoryProvider) -> Self {
        Self {
            provider,
            status: Mutex::new(TxnStatus::Active),
            state: Mutex::new(TxnState::default()),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match *self.status.lock() {
            TxnStatus::Active => Ok(()),
            _ => Err(Error::TransactionClosed),
        }
    }

    /// Reads resolve tombstones first, then the staged buffer, then the
    /// underlying store.
    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Record>> {
        self.ensure_active()?;
        {
            let state = self.state.lock();
            if state
                .tombstones
                .get(entity_type)
                .is_some_and(|ids| ids.contains(id))
            {
                return Ok(None);
            }
            if let Some(fields) = state.staged.get(entity_type).and_then(|map| map.get(id)) {
                return Ok(Some(project(entity_type, id, fields)));
            }
        }
        self.provider.get(entity_type, id).await
    }

    /// Stage a create. Unspecified ids get a transaction-temporary
    /// `txn-temp-N` id that survives commit.
    pub async fn create(
        &self,
        entity_type: &str,
        id: Option<&str>,
        data: Record,
    ) -> Result<Record> {
        self.ensure_active()?;
        let mut state = self.state.lock();
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                state.temp_counter += 1;
                format!("txn-temp-{}", state.temp_counter)
            }
        };
        if let Some(ids) = state.tombstones.get_mut(entity_type) {
            ids.shift_remove(&id);
        }
        state
            .staged
            .entry(entity_type.to_string())
            .or_default()
            .insert(id.clone(), data.clone());
        state.operations.push(TxnOp::Create {
            entity_type: entity_type.to_string(),
            id: id.clone(),
            data: data.clone(),
        });
        Ok(project(entity_type, &id, &data))
    }

    /// Stage an update over the current (staged or stored) state.
    pub async fn update(&self, entity_type: &str, id: &str, patch: Record) -> Result<Record> {
        self.ensure_active()?;
        let current = self
            .get(entity_type, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type}/{id}")))?;

        let mut merged = strip_projection(current);
        for (key, value) in &patch {
            merged.insert(key.clone(), value.clone());
        }

        let mut state = self.state.lock();
        state
            .staged
            .entry(entity_type.to_string())
            .or_default()
            .insert(id.to_string(), merged.clone());
        state.operations.push(TxnOp::Update {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            patch,
        });
        Ok(project(entity_type, id, &merged))
    }

    /// Stage a delete: removes any staged copy and tombstones the id.
    pub async fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        self.ensure_active()?;
        if self.get(entity_type, id).await?.is_none() {
            return Ok(false);
        }
        let mut state = self.state.lock();
        if let Some(map) = state.staged.get_mut(entity_type) {
            map.shift_remove(id);
        }
        state
            .tombstones
            .entry(entity_type.to_string())
            .or_default()
            .insert(id.to_string());
        state.operations.push(TxnOp::Delete {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        });
        Ok(true)
    }

    /// Relations are logged only; they apply at commit.
    pub async fn relate(
        &self,
        from_type: &str,
        from_id: &str,
        relation: &str,
        to_type: &str,
        to_id: &str,
        options: RelateOptions,
    ) -> Result<()> {
        self.ensure_active()?;
        self.state.lock().operations.push(TxnOp::Relate {
            from_type: from_type.to_string(),
            from_id: from_id.to_string(),
            relation: relation.to_string(),
            to_type: to_type.to_string(),
            to_id: to_id.to_string(),
            options,
        });
        Ok(())
    }

    /// Replay the operation log against the store in insertion order.
    ///
    /// The transaction transitions to committed up front; a failing
    /// operation stops the replay and propagates, leaving the operations
    /// already applied in place (no rollback of applied effects).
    pub async fn commit(&self) -> Result<()> {
        let operations = {
            let mut status = self.status.lock();
            if *status != TxnStatus::Active {
                return Err(Error::TransactionClosed);
            }
            *status = TxnStatus::Committed;
            std::mem::take(&mut self.state.lock().operations)
        };

        for op in operations {
            match op {
                TxnOp::Create {
                    entity_type,
                    id,
                    data,
                } => {
                    self.provider.create(&entity_type, Some(&id), data).await?;
                }
                TxnOp::Update {
                    entity_type,
                    id,
                    patch,
                } => {
                    self.provider.update(&entity_type, &id, patch).await?;
                }
                TxnOp::Delete { entity_type, id } => {
                    self.provider.delete(&entity_type, &id).await?;
                }
                TxnOp::Relate {
                    from_type,
                    from_id,
                    relation,
                    to_type,
                    to_id,
                    options,
                } => {
                    self.provider
                        .relate(&from_type, &from_id, &relation, &to_type, &to_id, options)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Discard every buffer. Nothing reached the store.
    pub async fn rollback(&self) -> Result<()> {
        let mut status = self.status.lock();
        if *status != TxnStatus::Active {
            return Err(Error::TransactionClosed);
        }
        *status = TxnStatus::RolledBack;
        let mut state = self.state.lock();
        state.staged.clear();
        state.tombstones.clear();
        state.operations.clear();
        Ok(())
    }
}

// ============================================================================
// StoreTransaction impl
// ============================================================================

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Record>> {
        MemoryTransaction::get(self, entity_type, id).await
    }

    async fn create(&self, entity_type: &str, id: Option<&str>, data: Record) -> Result<Record> {
        MemoryTransaction::create(self, entity_type, id, data).await
    }

    async fn update(&self, entity_type: &str, id: &str, patch: Record) -> Result<Record> {
        MemoryTransaction::update(self, entity_type, id, patch).await
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        MemoryTransaction::delete(self, entity_type, id).await
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
        MemoryTransaction::relate(self, from_type, from_id, relation, to_type, to_id, options)
            .await
    }

    async fn commit(&self) -> Result<()> {
        MemoryTransaction::commit(self).await
    }

    async fn rollback(&self) -> Result<()> {
        MemoryTransaction::rollback(self).await
    }
}

// ============================================================================
// Projection helpers
// ============================================================================

fn project(entity_type: &str, id: &str, fields: &Record) -> Record {
    let mut record = fields.clone();
    record.insert("$id".into(), Value::String(id.to_string()));
    record.insert("$type".into(), Value::String(entity_type.to_string()));
    record
}

fn strip_projection(mut record: Record) -> Record {
    for key in crate::model::RESERVED_KEYS {
        record.shift_remove(*key);
    }
    record.shift_remove("createdAt");
    record.shift_remove("updatedAt");
    record
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_record;
    use crate::provider::EventFilter;

    #[tokio::test]
    async fn test_staged_create_invisible_until_commit() {
        let db = MemoryProvider::new();
        let txn = MemoryTransaction::new(db.clone());

        let staged = txn
            .create("Post", Some("p1"), json_record!({"title": "draft"}))
            .await
            .unwrap();
        assert_eq!(staged["$id"], "p1");

        // Visible inside the transaction, not outside.
        assert!(txn.get("Post", "p1").await.unwrap().is_some());
        assert!(db.get("Post", "p1").await.unwrap().is_none());

        txn.commit().await.unwrap();
        assert!(db.get("Post", "p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_temp_ids_are_sequential() {
        let db = MemoryProvider::new();
        let txn = MemoryTransaction::new(db.clone());
        let a = txn.create("Post", None, Record::new()).await.unwrap();
        let b = txn.create("Post", None, Record::new()).await.unwrap();
        assert_eq!(a["$id"], "txn-temp-1");
        assert_eq!(b["$id"], "txn-temp-2");
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let db = MemoryProvider::new();
        let txn = MemoryTransaction::new(db.clone());
        txn.create("Post", Some("p1"), json_record!({"title": "x"}))
            .await
            .unwrap();
        txn.rollback().await.unwrap();

        assert!(db.get("Post", "p1").await.unwrap().is_none());
        // No created events were appended.
        let events = db
            .list_events(EventFilter {
                event: Some("*.created".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_closed_transaction_refuses_calls() {
        let db = MemoryProvider::new();
        let txn = MemoryTransaction::new(db.clone());
        txn.commit().await.unwrap();

        for result in [
            txn.create("Post", Some("x"), Record::new()).await.err(),
            txn.get("Post", "x").await.err(),
            txn.delete("Post", "x").await.err(),
            txn.commit().await.err(),
            txn.rollback().await.err(),
        ] {
            assert!(matches!(result, Some(Error::TransactionClosed)));
        }
    }

    #[tokio::test]
    async fn test_update_reads_through_store() {
        let db = MemoryProvider::new();
        db.create("Post", Some("p1"), json_record!({"title": "old", "views": 1}))
            .await
            .unwrap();

        let txn = MemoryTransaction::new(db.clone());
        let staged = txn
            .update("Post", "p1", json_record!({"title": "new"}))
            .await
            .unwrap();
        assert_eq!(staged["title"], "new");
        assert_eq!(staged["views"], 1);

        // Store still has the old value until commit.
        assert_eq!(db.get("Post", "p1").await.unwrap().unwrap()["title"], "old");
        txn.commit().await.unwrap();
        assert_eq!(db.get("Post", "p1").await.unwrap().unwrap()["title"], "new");
    }

    #[tokio::test]
    async fn test_update_missing_entity_errors() {
        let db = MemoryProvider::new();
        let txn = MemoryTransaction::new(db.clone());
        let err = txn
            .update("Post", "ghost", json_record!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_tombstone_hides_stored_entity() {
        let db = MemoryProvider::new();
        db.create("Post", Some("p1"), Record::new()).await.unwrap();

        let txn = MemoryTransaction::new(db.clone());
        assert!(txn.delete("Post", "p1").await.unwrap());
        assert!(txn.get("Post", "p1").await.unwrap().is_none());
        // Still present outside until commit.
        assert!(db.get("Post", "p1").await.unwrap().is_some());

        txn.commit().await.unwrap();
        assert!(db.get("Post", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_returns_false() {
        let db = MemoryProvider::new();
        let txn = MemoryTransaction::new(db.clone());
        assert!(!txn.delete("Post", "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_replays_in_insertion_order() {
        let db = MemoryProvider::new();
        let txn = MemoryTransaction::new(db.clone());
        txn.create("Author", Some("a1"), json_record!({"name": "ada"}))
            .await
            .unwrap();
        txn.create("Post", Some("p1"), json_record!({"title": "t"}))
            .await
            .unwrap();
        txn.relate("Author", "a1", "posts", "Post", "p1", RelateOptions::default())
            .await
            .unwrap();
        txn.commit().await.unwrap();

        // The relate succeeded because both creates replayed before it.
        let related = db.related("Author", "a1", "posts").await.unwrap();
        assert_eq!(related.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_earlier_ops_applied() {
        let db = MemoryProvider::new();
        db.create("Post", Some("taken"), Record::new()).await.unwrap();

        let txn = MemoryTransaction::new(db.clone());
        txn.create("Post", Some("fresh"), Record::new()).await.unwrap();
        // Will collide with the pre-existing id at replay time.
        txn.create("Post", Some("taken"), Record::new()).await.unwrap();
        txn.create("Post", Some("never"), Record::new()).await.unwrap();

        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        // First op applied, the one after the failure never ran, and the
        // transaction is closed regardless.
        assert!(db.get("Post", "fresh").await.unwrap().is_some());
        assert!(db.get("Post", "never").await.unwrap().is_none());
        assert!(matches!(
            txn.get("Post", "fresh").await,
            Err(Error::TransactionClosed)
        ));
    }

    #[tokio::test]
    async fn test_commit_runs_side_effect_chain() {
        let db = MemoryProvider::new();
        let txn = MemoryTransaction::new(db.clone());
        txn.create("Post", Some("p1"), json_record!({"title": "evented"}))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let events = db.list_events(EventFilter::default()).await.unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["Post.created", "entity:created"]);
        // Embedding was generated during replay.
        assert!(db
            .get_artifact("Post/p1", super::super::artifacts::EMBEDDING_KIND)
            .await
            .unwrap()
            .is_some());
    }
}
