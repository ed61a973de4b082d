//! Per-connection transaction state for the in-memory table: a read
//! snapshot, a lazily created pending layer, and the ordered savepoint
//! snapshots.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{QuereusError, Result};
use crate::vtab::VtabConnection;

use super::layer::{BaseLayer, LayerKey, TransactionLayer};
use super::TableCore;
use crate::vtab::Row;

struct ConnState {
    /// Snapshot a consistent read sees when no pending layer exists.
    read_layer: Arc<BaseLayer>,
    pending: Option<TransactionLayer>,
    explicit: bool,
    /// Immutable snapshots, ordered by savepoint index.
    savepoints: Vec<(u32, TransactionLayer)>,
}

pub struct MemoryTableConnection {
    core: Arc<TableCore>,
    name: String,
    state: Mutex<ConnState>,
}

impl MemoryTableConnection {
    pub fn new(core: Arc<TableCore>) -> Self {
        let read_layer = core.current();
        let name = core.table_name();
        Self {
            core,
            name,
            state: Mutex::new(ConnState {
                read_layer,
                pending: None,
                explicit: false,
                savepoints: Vec::new(),
            }),
        }
    }

    pub fn in_explicit_txn(&self) -> bool {
        self.state.lock().explicit
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Re-snapshot an idle auto-commit connection so each statement reads
    /// the latest committed state. A no-op once a transaction is underway.
    pub fn refresh_snapshot(&self) {
        let mut state = self.state.lock();
        if !state.explicit && state.pending.is_none() {
            state.read_layer = self.core.current();
        }
    }

    /// Run `f` against the pending layer, creating it over the table's
    /// current committed snapshot on the first write.
    pub fn with_pending<T>(&self, f: impl FnOnce(&mut TransactionLayer) -> T) -> T {
        let mut state = self.state.lock();
        let parent = self.core.current();
        let pending = state
            .pending
            .get_or_insert_with(|| TransactionLayer::over(parent));
        f(pending)
    }

    /// Point read through the connection's view.
    pub fn read_get(&self, key: &LayerKey) -> Option<Row> {
        let state = self.state.lock();
        match &state.pending {
            Some(pending) => pending.get(key),
            None => state.read_layer.rows.get(key).cloned(),
        }
    }

    pub fn read_contains(&self, key: &LayerKey) -> bool {
        let state = self.state.lock();
        match &state.pending {
            Some(pending) => pending.contains(key),
            None => state.read_layer.rows.contains_key(key),
        }
    }

    /// Full snapshot-consistent scan in key order.
    pub fn read_all(&self) -> Vec<Row> {
        let state = self.state.lock();
        match &state.pending {
            Some(pending) => pending.merged_rows(),
            None => state.read_layer.rows.values().cloned().collect(),
        }
    }

    /// Effective secondary-index lookup through the connection's view.
    pub fn read_index(&self, index_name: &str, key: &LayerKey) -> Option<LayerKey> {
        let state = self.state.lock();
        match &state.pending {
            Some(pending) => pending.index_get(index_name, key),
            None => state
                .read_layer
                .indexes
                .get(index_name)
                .and_then(|tree| tree.get(key).cloned()),
        }
    }

    fn commit_inner(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.take() {
            if !pending.is_empty() {
                // Commit gate: serialize folding so at most one connection
                // publishes at a time (held only for the fold).
                let _gate = self.core.commit_gate.lock();
                let current = self.core.current();
                let next = Arc::new(pending.fold_into(&current));
                self.core.publish(Arc::clone(&next));
                debug!(table = %self.core.table_name(), epoch = next.epoch, "committed layer");
            }
        }
        state.savepoints.clear();
        state.explicit = false;
        state.read_layer = self.core.current();
        Ok(())
    }

    fn rollback_inner(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pending = None;
        state.savepoints.clear();
        state.explicit = false;
        state.read_layer = self.core.current();
        Ok(())
    }
}

#[async_trait]
impl VtabConnection for MemoryTableConnection {
    fn table_name(&self) -> &str {
        &self.name
    }

    fn refresh(&self) {
        self.refresh_snapshot();
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending.is_none() {
            state.read_layer = self.core.current();
        }
        state.explicit = true;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.commit_inner()
    }

    async fn rollback(&self) -> Result<()> {
        self.rollback_inner()
    }

    async fn savepoint(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        let parent = self.core.current();
        // Opening a savepoint upgrades an auto-transaction to explicit so a
        // following statement does not auto-commit and strand the snapshot.
        state.explicit = true;
        let snapshot = state
            .pending
            .get_or_insert_with(|| TransactionLayer::over(parent))
            .snapshot();
        state.savepoints.retain(|(i, _)| *i < index);
        state.savepoints.push((index, snapshot));
        Ok(())
    }

    async fn release(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.savepoints.retain(|(i, _)| *i < index);
        Ok(())
    }

    async fn rollback_to(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        let snapshot = state
            .savepoints
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, layer)| layer.snapshot())
            .ok_or_else(|| {
                QuereusError::Internal(format!("no savepoint snapshot at index {index}"))
            })?;
        state.pending = Some(snapshot);
        state.savepoints.retain(|(i, _)| *i <= index);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.rollback_inner()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layer::primary_key_of;
    use crate::schema::{ColumnSchema, PrimaryKeyPart, TableSchema};
    use crate::types::{Affinity, SqlValue};

    fn core() -> Arc<TableCore> {
        let mut schema = TableSchema::new(
            "t",
            vec![
                ColumnSchema::new("id", Affinity::Integer).not_null(),
                ColumnSchema::new("v", Affinity::Text),
            ],
        );
        schema.primary_key = vec![PrimaryKeyPart {
            column_index: 0,
            desc: false,
        }];
        Arc::new(TableCore::new(Arc::new(schema)))
    }

    fn row(id: i64, v: &str) -> Row {
        vec![SqlValue::Integer(id), SqlValue::Text(v.into())]
    }

    #[tokio::test]
    async fn test_read_your_own_writes() {
        let core = core();
        let conn = MemoryTableConnection::new(Arc::clone(&core));
        conn.begin().await.unwrap();

        let schema = core.schema();
        let r = row(1, "a");
        let key = primary_key_of(&schema, &r).unwrap();
        conn.with_pending(|layer| layer.upsert(&schema, key.clone(), r.clone()));

        assert!(conn.read_contains(&key));

        // A second connection opened before the commit does not see the row.
        let other = MemoryTableConnection::new(Arc::clone(&core));
        assert!(!other.read_contains(&key));

        conn.commit().await.unwrap();
        other.refresh_snapshot();
        assert!(other.read_contains(&key));
    }

    #[tokio::test]
    async fn test_rollback_discards_pending() {
        let core = core();
        let conn = MemoryTableConnection::new(Arc::clone(&core));
        conn.begin().await.unwrap();

        let schema = core.schema();
        let r = row(1, "a");
        let key = primary_key_of(&schema, &r).unwrap();
        conn.with_pending(|layer| layer.upsert(&schema, key.clone(), r));
        conn.rollback().await.unwrap();

        assert!(!conn.read_contains(&key));
        assert_eq!(core.current().epoch, 0);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_to_is_idempotent() {
        let core = core();
        let conn = MemoryTableConnection::new(Arc::clone(&core));
        let schema = core.schema();

        let r1 = row(1, "a");
        let k1 = primary_key_of(&schema, &r1).unwrap();
        conn.with_pending(|layer| layer.upsert(&schema, k1.clone(), r1));

        conn.savepoint(1).await.unwrap();

        let r2 = row(2, "b");
        let k2 = primary_key_of(&schema, &r2).unwrap();
        conn.with_pending(|layer| layer.upsert(&schema, k2.clone(), r2));
        assert!(conn.read_contains(&k2));

        conn.rollback_to(1).await.unwrap();
        assert!(conn.read_contains(&k1));
        assert!(!conn.read_contains(&k2));

        // The savepoint survives rollback-to; a second rollback is a no-op.
        conn.rollback_to(1).await.unwrap();
        assert!(conn.read_contains(&k1));
    }

    #[tokio::test]
    async fn test_release_drops_higher_savepoints() {
        let core = core();
        let conn = MemoryTableConnection::new(Arc::clone(&core));
        conn.savepoint(1).await.unwrap();
        conn.savepoint(2).await.unwrap();
        conn.savepoint(3).await.unwrap();
        conn.release(2).await.unwrap();
        assert!(conn.rollback_to(1).await.is_ok());
        assert!(conn.rollback_to(3).await.is_err());
    }
}
