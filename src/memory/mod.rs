//! In-memory virtual table backed by the layered MVCC overlay. The module
//! keeps one `TableCore` per table: an `Arc`-published committed snapshot, a
//! commit gate serializing layer folds, and a change-event channel.

pub mod connection;
pub mod layer;

pub use connection::MemoryTableConnection;
pub use layer::{BaseLayer, LayerKey, TransactionLayer};

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{QuereusError, Result};
use crate::schema::{function, IndexSchema, TableSchema};
use crate::types::SqlValue;
use crate::vtab::{
    AccessPlan, AccessPlanRequest, ChangeEvent, ConflictPolicy, ConstraintOp, DmlOp,
    EvaluatedConstraint, FilterArgs, OrderingTerm, Row, RowStream, VirtualTable, VtabConnection,
    VtabModule,
};

use layer::{index_key_of, primary_key_from_values, primary_key_of};

/// Shared state of one in-memory table.
pub struct TableCore {
    schema: RwLock<Arc<TableSchema>>,
    current: RwLock<Arc<BaseLayer>>,
    /// Serializes layer folding; held only for the fold.
    pub(crate) commit_gate: Mutex<()>,
    events: broadcast::Sender<ChangeEvent>,
}

impl TableCore {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            schema: RwLock::new(schema),
            current: RwLock::new(Arc::new(BaseLayer::empty())),
            commit_gate: Mutex::new(()),
            events,
        }
    }

    pub fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema.read())
    }

    pub fn table_name(&self) -> String {
        self.schema.read().name.clone()
    }

    pub fn current(&self) -> Arc<BaseLayer> {
        Arc::clone(&self.current.read())
    }

    pub fn publish(&self, next: Arc<BaseLayer>) {
        *self.current.write() = next;
    }

    fn publish_event(&self, op: DmlOp, key: Vec<SqlValue>) {
        let _ = self.events.send(ChangeEvent {
            table: self.table_name(),
            op,
            key,
        });
    }

    /// Rebuild with an additional secondary index over committed data.
    pub fn add_index(&self, index: IndexSchema) -> Result<()> {
        let _gate = self.commit_gate.lock();
        let mut schema = (*self.schema.read()).as_ref().clone();
        if schema.indexes.iter().any(|i| i.name == index.name) {
            return Err(QuereusError::planning(format!(
                "index {} already exists",
                index.name
            )));
        }
        schema.indexes.push(index.clone());
        let schema = Arc::new(schema);

        let current = self.current();
        let mut next = (*current).clone();
        let mut tree = std::collections::BTreeMap::new();
        for (pk, row) in &next.rows {
            let ikey = index_key_of(&schema, &index, row, pk);
            if index.unique && tree.contains_key(&ikey) {
                return Err(QuereusError::Constraint(format!(
                    "UNIQUE constraint failed: index {}",
                    index.name
                )));
            }
            tree.insert(ikey, pk.clone());
        }
        next.indexes.insert(index.name.clone(), tree);
        next.epoch += 1;

        *self.schema.write() = Arc::clone(&schema);
        self.publish(Arc::new(next));
        Ok(())
    }
}

pub struct MemoryTable {
    core: Arc<TableCore>,
}

impl MemoryTable {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            core: Arc::new(TableCore::new(schema)),
        }
    }

    pub fn core(&self) -> Arc<TableCore> {
        Arc::clone(&self.core)
    }

    fn downcast_conn<'a>(
        conn: Option<&'a dyn VtabConnection>,
    ) -> Option<&'a MemoryTableConnection> {
        conn.and_then(|c| c.as_any().downcast_ref::<MemoryTableConnection>())
    }

    /// Snapshot-consistent row set for the given view, in primary-key order.
    fn visible_rows(&self, conn: Option<&MemoryTableConnection>) -> Vec<Row> {
        match conn {
            Some(conn) => conn.read_all(),
            None => self.core.current().rows.values().cloned().collect(),
        }
    }

    fn point_get(&self, conn: Option<&MemoryTableConnection>, key: &LayerKey) -> Option<Row> {
        match conn {
            Some(conn) => conn.read_get(key),
            None => self.core.current().rows.get(key).cloned(),
        }
    }

    fn constraint_matches(
        schema: &TableSchema,
        row: &Row,
        constraint: &EvaluatedConstraint,
    ) -> bool {
        let column = &schema.columns[constraint.column_index];
        let cell = &row[constraint.column_index];
        match constraint.op {
            ConstraintOp::IsNull => cell.is_null(),
            ConstraintOp::IsNotNull => !cell.is_null(),
            ConstraintOp::Like | ConstraintOp::Match => {
                !cell.is_null()
                    && function::like_match(&constraint.value.to_string(), &cell.to_string(), None)
            }
            ConstraintOp::Glob => {
                !cell.is_null()
                    && function::glob_match(&constraint.value.to_string(), &cell.to_string())
            }
            ConstraintOp::In | ConstraintOp::NotIn => false,
            op => {
                let coerced = constraint.value.clone().apply_affinity(column.affinity);
                match cell.compare(&coerced, column.collation) {
                    None => false,
                    Some(ord) => match op {
                        ConstraintOp::Eq => ord == CmpOrdering::Equal,
                        ConstraintOp::Gt => ord == CmpOrdering::Greater,
                        ConstraintOp::Ge => ord != CmpOrdering::Less,
                        ConstraintOp::Lt => ord == CmpOrdering::Less,
                        ConstraintOp::Le => ord != CmpOrdering::Greater,
                        _ => false,
                    },
                }
            }
        }
    }

    /// Full-primary-key equality detection: one Eq constraint per key part.
    fn full_pk_probe(
        schema: &TableSchema,
        constraints: &[EvaluatedConstraint],
    ) -> Option<Vec<SqlValue>> {
        let pk = schema.effective_primary_key();
        let mut values = Vec::with_capacity(pk.len());
        for part in &pk {
            let found = constraints.iter().find(|c| {
                c.op == ConstraintOp::Eq && c.column_index == part.column_index
            })?;
            values.push(found.value.clone());
        }
        Some(values)
    }

    /// Find a row other than `pk` (and other than `exclude`, the row an
    /// UPDATE is rewriting) holding one of the new row's unique-index keys.
    fn find_unique_conflict(
        &self,
        schema: &TableSchema,
        conn: Option<&MemoryTableConnection>,
        row: &Row,
        pk: &LayerKey,
        exclude: Option<&LayerKey>,
    ) -> Option<(String, LayerKey)> {
        for index in schema.indexes.iter().filter(|i| i.unique) {
            let ikey = index_key_of(schema, index, row, pk);
            let existing = match conn {
                Some(conn) => conn.read_index(&index.name, &ikey),
                None => self
                    .core
                    .current()
                    .indexes
                    .get(&index.name)
                    .and_then(|tree| tree.get(&ikey).cloned()),
            };
            if let Some(existing_pk) = existing {
                if existing_pk != *pk && Some(&existing_pk) != exclude {
                    return Some((index.name.clone(), existing_pk));
                }
            }
        }
        None
    }

    /// Enforce secondary unique indexes per the statement's conflict
    /// policy: IGNORE skips the row (returns false), REPLACE deletes each
    /// conflicting row and retries, anything else is a constraint error.
    fn resolve_unique_conflicts(
        &self,
        schema: &TableSchema,
        conn: Option<&MemoryTableConnection>,
        row: &Row,
        pk: &LayerKey,
        exclude: Option<&LayerKey>,
        on_conflict: ConflictPolicy,
    ) -> Result<bool> {
        while let Some((index_name, existing_pk)) =
            self.find_unique_conflict(schema, conn, row, pk, exclude)
        {
            match on_conflict {
                ConflictPolicy::Ignore => return Ok(false),
                ConflictPolicy::Replace => {
                    self.write_delete(conn, schema, existing_pk)?;
                }
                _ => {
                    return Err(QuereusError::Constraint(format!(
                        "UNIQUE constraint failed: index {index_name}"
                    )))
                }
            }
        }
        Ok(true)
    }

    /// Apply one mutation through the connection's pending layer, or as an
    /// immediately committed single-statement layer when the table is used
    /// without a connection.
    async fn apply(
        &self,
        conn: Option<&MemoryTableConnection>,
        op: DmlOp,
        new_row: Option<Row>,
        old_key: Option<Vec<SqlValue>>,
        on_conflict: ConflictPolicy,
    ) -> Result<Option<Row>> {
        let schema = self.core.schema();
        match op {
            DmlOp::Insert => {
                let mut row = new_row.ok_or_else(|| {
                    QuereusError::Internal("insert without a new row".into())
                })?;
                for (cell, column) in row.iter_mut().zip(&schema.columns) {
                    *cell = cell.clone().apply_affinity(column.affinity);
                }
                let key = primary_key_of(&schema, &row)?;
                let exists = match conn {
                    Some(conn) => conn.read_contains(&key),
                    None => self.core.current().rows.contains_key(&key),
                };
                if exists {
                    match on_conflict {
                        ConflictPolicy::Ignore => return Ok(None),
                        ConflictPolicy::Replace => {
                            self.write_delete(conn, &schema, key.clone())?;
                        }
                        _ => {
                            return Err(QuereusError::Constraint(format!(
                                "UNIQUE constraint failed: {}",
                                schema.name
                            )))
                        }
                    }
                }
                if !self.resolve_unique_conflicts(&schema, conn, &row, &key, None, on_conflict)? {
                    return Ok(None);
                }
                self.write_upsert(conn, &schema, key.clone(), row.clone())?;
                self.core.publish_event(DmlOp::Insert, key.values());
                Ok(Some(row))
            }
            DmlOp::Update => {
                let old_key = old_key.ok_or_else(|| {
                    QuereusError::Internal("update without an old key".into())
                })?;
                let mut row = new_row.ok_or_else(|| {
                    QuereusError::Internal("update without a new row".into())
                })?;
                for (cell, column) in row.iter_mut().zip(&schema.columns) {
                    *cell = cell.clone().apply_affinity(column.affinity);
                }
                let old = primary_key_from_values(&schema, &old_key)?;
                let new = primary_key_of(&schema, &row)?;
                if new != old {
                    let exists = match conn {
                        Some(conn) => conn.read_contains(&new),
                        None => self.core.current().rows.contains_key(&new),
                    };
                    if exists {
                        match on_conflict {
                            ConflictPolicy::Ignore => return Ok(None),
                            ConflictPolicy::Replace => {
                                self.write_delete(conn, &schema, new.clone())?;
                            }
                            _ => {
                                return Err(QuereusError::Constraint(format!(
                                    "UNIQUE constraint failed: {}",
                                    schema.name
                                )))
                            }
                        }
                    }
                }
                if !self.resolve_unique_conflicts(
                    &schema,
                    conn,
                    &row,
                    &new,
                    Some(&old),
                    on_conflict,
                )? {
                    return Ok(None);
                }
                self.write_delete(conn, &schema, old)?;
                self.write_upsert(conn, &schema, new.clone(), row.clone())?;
                self.core.publish_event(DmlOp::Update, new.values());
                Ok(Some(row))
            }
            DmlOp::Delete => {
                let old_key = old_key.ok_or_else(|| {
                    QuereusError::Internal("delete without an old key".into())
                })?;
                let key = primary_key_from_values(&schema, &old_key)?;
                let old = self.point_get(conn, &key);
                self.write_delete(conn, &schema, key.clone())?;
                self.core.publish_event(DmlOp::Delete, key.values());
                Ok(old)
            }
        }
    }

    fn write_upsert(
        &self,
        conn: Option<&MemoryTableConnection>,
        schema: &TableSchema,
        key: LayerKey,
        row: Row,
    ) -> Result<()> {
        match conn {
            Some(conn) => {
                conn.with_pending(|layer| layer.upsert(schema, key, row));
                Ok(())
            }
            None => self.autocommit(|layer| layer.upsert(schema, key, row)),
        }
    }

    fn write_delete(
        &self,
        conn: Option<&MemoryTableConnection>,
        schema: &TableSchema,
        key: LayerKey,
    ) -> Result<()> {
        match conn {
            Some(conn) => {
                conn.with_pending(|layer| layer.delete(schema, key));
                Ok(())
            }
            None => self.autocommit(|layer| layer.delete(schema, key)),
        }
    }

    /// Connection-less write: a single-mutation layer folded immediately.
    fn autocommit(&self, f: impl FnOnce(&mut TransactionLayer)) -> Result<()> {
        let _gate = self.core.commit_gate.lock();
        let current = self.core.current();
        let mut layer = TransactionLayer::over(Arc::clone(&current));
        f(&mut layer);
        self.core.publish(Arc::new(layer.fold_into(&current)));
        Ok(())
    }
}

#[async_trait]
impl VirtualTable for MemoryTable {
    fn schema(&self) -> Arc<TableSchema> {
        self.core.schema()
    }

    async fn query(
        &self,
        conn: Option<&dyn VtabConnection>,
        filters: FilterArgs,
    ) -> Result<RowStream> {
        let schema = self.core.schema();
        let conn = Self::downcast_conn(conn);

        let mut rows = if let Some(values) = Self::full_pk_probe(&schema, &filters.constraints) {
            let key = primary_key_from_values(&schema, &values)?;
            self.point_get(conn, &key).into_iter().collect()
        } else {
            self.visible_rows(conn)
        };

        rows.retain(|row| {
            filters
                .constraints
                .iter()
                .all(|c| Self::constraint_matches(&schema, row, c))
        });
        if let Some(limit) = filters.limit {
            rows.truncate(limit as usize);
        }

        Ok(Box::pin(stream::iter(rows.into_iter().map(Ok))))
    }

    async fn update(
        &self,
        conn: Option<&dyn VtabConnection>,
        op: DmlOp,
        new_row: Option<Row>,
        old_key: Option<Vec<SqlValue>>,
        on_conflict: ConflictPolicy,
    ) -> Result<Option<Row>> {
        let conn = Self::downcast_conn(conn);
        self.apply(conn, op, new_row, old_key, on_conflict).await
    }

    fn create_connection(&self, _session: &str) -> Result<Option<Arc<dyn VtabConnection>>> {
        Ok(Some(Arc::new(MemoryTableConnection::new(self.core()))))
    }

    fn create_index(&self, index: &IndexSchema) -> Result<()> {
        self.core.add_index(index.clone())
    }

    fn committed_row_count(&self) -> Option<u64> {
        Some(self.core.current().rows.len() as u64)
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.core.events.subscribe())
    }
}

/// The built-in `memory` module.
pub struct MemoryModule {
    tables: DashMap<String, Arc<MemoryTable>>,
}

impl MemoryModule {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }
}

impl Default for MemoryModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VtabModule for MemoryModule {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        let key = schema.name.to_ascii_lowercase();
        let table = Arc::new(MemoryTable::new(schema));
        self.tables.insert(key, Arc::clone(&table));
        Ok(table)
    }

    async fn connect(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        self.tables
            .get(&schema.name.to_ascii_lowercase())
            .map(|t| Arc::clone(t.value()) as Arc<dyn VirtualTable>)
            .ok_or_else(|| {
                QuereusError::Internal(format!("memory table {} not created", schema.name))
            })
    }

    fn best_access_plan(
        &self,
        schema: &TableSchema,
        request: &AccessPlanRequest,
    ) -> Result<AccessPlan> {
        let committed_rows = self
            .tables
            .get(&schema.name.to_ascii_lowercase())
            .map(|t| t.core.current().rows.len() as f64)
            .unwrap_or(0.0)
            .max(1.0);

        let mut handled = vec![false; request.filters.len()];
        let pk = schema.effective_primary_key();

        // Consume an equality per key part, left to right.
        let mut eq_parts = 0usize;
        for part in &pk {
            let found = request.filters.iter().position(|f| {
                f.usable && f.op == ConstraintOp::Eq && f.column_index == part.column_index
            });
            match found {
                Some(i) => {
                    handled[i] = true;
                    eq_parts += 1;
                }
                None => break,
            }
        }

        // After the equality prefix, range constraints on the next key part
        // narrow the scan further.
        let mut ranged = false;
        if eq_parts < pk.len() {
            let next = pk[eq_parts].column_index;
            for (i, f) in request.filters.iter().enumerate() {
                if f.usable
                    && f.column_index == next
                    && matches!(
                        f.op,
                        ConstraintOp::Gt | ConstraintOp::Ge | ConstraintOp::Lt | ConstraintOp::Le
                    )
                {
                    handled[i] = true;
                    ranged = true;
                }
            }
        }

        // Unique secondary index as a fallback point path.
        let mut index_path = None;
        if eq_parts == 0 && !ranged {
            for index in schema.indexes.iter().filter(|i| i.unique) {
                let all_eq: Option<Vec<usize>> = index
                    .columns
                    .iter()
                    .map(|part| {
                        request.filters.iter().position(|f| {
                            f.usable
                                && f.op == ConstraintOp::Eq
                                && f.column_index == part.column_index
                        })
                    })
                    .collect();
                if let Some(positions) = all_eq {
                    for i in positions {
                        handled[i] = true;
                    }
                    index_path = Some(index.name.clone());
                    break;
                }
            }
        }

        let (rows, explains) = if eq_parts == pk.len() {
            (1.0, "primary key point lookup".to_string())
        } else if let Some(index) = &index_path {
            (1.0, format!("unique index {index} lookup"))
        } else if eq_parts > 0 {
            (
                (committed_rows / 10.0_f64.powi(eq_parts as i32)).max(1.0),
                "primary key prefix scan".to_string(),
            )
        } else if ranged {
            (committed_rows / 4.0, "primary key range scan".to_string())
        } else {
            (committed_rows, "full scan".to_string())
        };

        // The merged layer scan always yields primary-key order.
        let provides_ordering = Some(
            pk.iter()
                .map(|part| OrderingTerm {
                    column_index: part.column_index,
                    desc: part.desc,
                })
                .collect(),
        );

        let plan = AccessPlan {
            handled_filters: handled,
            cost: rows + 1.0,
            rows: Some(rows),
            provides_ordering,
            is_set: true,
            explains: Some(explains),
        };
        plan.validate(request)?;
        debug!(table = %schema.name, cost = plan.cost, "memory access plan");
        Ok(plan)
    }

    fn provides_access_planner(&self) -> bool {
        true
    }

    async fn destroy(&self, schema: Arc<TableSchema>) -> Result<()> {
        self.tables.remove(&schema.name.to_ascii_lowercase());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, PrimaryKeyPart};
    use crate::types::Affinity;
    use futures::StreamExt;

    fn schema() -> Arc<TableSchema> {
        let mut s = TableSchema::new(
            "t",
            vec![
                ColumnSchema::new("id", Affinity::Integer).not_null(),
                ColumnSchema::new("v", Affinity::Text),
            ],
        );
        s.primary_key = vec![PrimaryKeyPart {
            column_index: 0,
            desc: false,
        }];
        Arc::new(s)
    }

    fn row(id: i64, v: &str) -> Row {
        vec![SqlValue::Integer(id), SqlValue::Text(v.into())]
    }

    async fn collect(stream: RowStream) -> Vec<Row> {
        stream.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_insert_then_scan_in_pk_order() {
        let table = MemoryTable::new(schema());
        for (id, v) in [(2, "b"), (1, "a"), (3, "c")] {
            table
                .update(None, DmlOp::Insert, Some(row(id, v)), None, ConflictPolicy::Abort)
                .await
                .unwrap();
        }
        let rows = collect(table.query(None, FilterArgs::default()).await.unwrap()).await;
        let ids: Vec<i64> = rows
            .iter()
            .map(|r| match r[0] {
                SqlValue::Integer(i) => i,
                _ => panic!("non-integer id"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_pk_conflict_policies() {
        let table = MemoryTable::new(schema());
        table
            .update(None, DmlOp::Insert, Some(row(1, "a")), None, ConflictPolicy::Abort)
            .await
            .unwrap();

        let dup = table
            .update(None, DmlOp::Insert, Some(row(1, "x")), None, ConflictPolicy::Abort)
            .await;
        assert!(matches!(dup, Err(QuereusError::Constraint(_))));

        let ignored = table
            .update(None, DmlOp::Insert, Some(row(1, "x")), None, ConflictPolicy::Ignore)
            .await
            .unwrap();
        assert!(ignored.is_none());

        table
            .update(None, DmlOp::Insert, Some(row(1, "x")), None, ConflictPolicy::Replace)
            .await
            .unwrap();
        let rows = collect(table.query(None, FilterArgs::default()).await.unwrap()).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1].to_string(), "x");
    }

    fn schema_with_unique_v() -> Arc<TableSchema> {
        let mut s = (*schema()).clone();
        s.indexes.push(IndexSchema {
            name: "t_v_unique".to_string(),
            columns: vec![PrimaryKeyPart {
                column_index: 1,
                desc: false,
            }],
            unique: true,
        });
        Arc::new(s)
    }

    #[tokio::test]
    async fn test_secondary_unique_index_conflict_policies() {
        let table = MemoryTable::new(schema_with_unique_v());
        table
            .update(None, DmlOp::Insert, Some(row(1, "a")), None, ConflictPolicy::Abort)
            .await
            .unwrap();

        // A different primary key colliding on the unique index.
        let dup = table
            .update(None, DmlOp::Insert, Some(row(2, "a")), None, ConflictPolicy::Abort)
            .await;
        assert!(matches!(dup, Err(QuereusError::Constraint(_))));

        let ignored = table
            .update(None, DmlOp::Insert, Some(row(2, "a")), None, ConflictPolicy::Ignore)
            .await
            .unwrap();
        assert!(ignored.is_none());

        // REPLACE deletes the index-conflicting row and retries.
        table
            .update(None, DmlOp::Insert, Some(row(2, "a")), None, ConflictPolicy::Replace)
            .await
            .unwrap();
        let rows = collect(table.query(None, FilterArgs::default()).await.unwrap()).await;
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0][0], SqlValue::Integer(2)));

        // The UPDATE path honors the same policies.
        table
            .update(None, DmlOp::Insert, Some(row(3, "b")), None, ConflictPolicy::Abort)
            .await
            .unwrap();
        let conflict = table
            .update(
                None,
                DmlOp::Update,
                Some(row(3, "a")),
                Some(vec![SqlValue::Integer(3)]),
                ConflictPolicy::Abort,
            )
            .await;
        assert!(matches!(conflict, Err(QuereusError::Constraint(_))));

        let ignored = table
            .update(
                None,
                DmlOp::Update,
                Some(row(3, "a")),
                Some(vec![SqlValue::Integer(3)]),
                ConflictPolicy::Ignore,
            )
            .await
            .unwrap();
        assert!(ignored.is_none());
        let rows = collect(table.query(None, FilterArgs::default()).await.unwrap()).await;
        assert_eq!(rows.len(), 2, "ignored update leaves both rows");

        table
            .update(
                None,
                DmlOp::Update,
                Some(row(3, "a")),
                Some(vec![SqlValue::Integer(3)]),
                ConflictPolicy::Replace,
            )
            .await
            .unwrap();
        let rows = collect(table.query(None, FilterArgs::default()).await.unwrap()).await;
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0][0], SqlValue::Integer(3)));
        assert_eq!(rows[0][1].to_string(), "a");
    }

    #[tokio::test]
    async fn test_unique_update_keeps_own_value() {
        // Rewriting a row without changing its unique column must not
        // conflict with itself, even when the primary key changes.
        let table = MemoryTable::new(schema_with_unique_v());
        table
            .update(None, DmlOp::Insert, Some(row(1, "a")), None, ConflictPolicy::Abort)
            .await
            .unwrap();
        table
            .update(
                None,
                DmlOp::Update,
                Some(row(2, "a")),
                Some(vec![SqlValue::Integer(1)]),
                ConflictPolicy::Abort,
            )
            .await
            .unwrap();
        let rows = collect(table.query(None, FilterArgs::default()).await.unwrap()).await;
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0][0], SqlValue::Integer(2)));
    }

    #[tokio::test]
    async fn test_point_lookup_via_constraints() {
        let table = MemoryTable::new(schema());
        for id in 1..=5 {
            table
                .update(None, DmlOp::Insert, Some(row(id, "v")), None, ConflictPolicy::Abort)
                .await
                .unwrap();
        }
        let args = FilterArgs {
            constraints: vec![EvaluatedConstraint {
                column_index: 0,
                op: ConstraintOp::Eq,
                value: SqlValue::Integer(3),
            }],
            ..FilterArgs::default()
        };
        let rows = collect(table.query(None, args).await.unwrap()).await;
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0][0], SqlValue::Integer(3)));
    }

    #[test]
    fn test_access_plan_full_pk_equality() {
        let module = MemoryModule::new();
        let schema = schema();
        let request = AccessPlanRequest {
            columns: schema.columns.clone(),
            filters: vec![
                FilterConstraintHelper::eq(0),
                FilterConstraintHelper::like(1),
            ],
            required_ordering: None,
            limit: None,
            estimated_rows: None,
        };
        let plan = module.best_access_plan(&schema, &request).unwrap();
        assert_eq!(plan.handled_filters, vec![true, false]);
        assert_eq!(plan.rows, Some(1.0));
        assert!(plan.is_set);
    }

    struct FilterConstraintHelper;

    impl FilterConstraintHelper {
        fn eq(column_index: usize) -> crate::vtab::FilterConstraint {
            crate::vtab::FilterConstraint {
                column_index,
                op: ConstraintOp::Eq,
                value: Some(SqlValue::Integer(1)),
                usable: true,
            }
        }

        fn like(column_index: usize) -> crate::vtab::FilterConstraint {
            crate::vtab::FilterConstraint {
                column_index,
                op: ConstraintOp::Like,
                value: Some(SqlValue::Text("a%".into())),
                usable: true,
            }
        }
    }
}
