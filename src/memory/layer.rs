//! Layered storage for the in-memory table: an immutable committed snapshot
//! (`BaseLayer`) published behind an `Arc`, plus per-connection
//! `TransactionLayer` deltas of upserts and tombstones. A layer's parent is
//! fixed at construction; commits publish a new snapshot rather than
//! mutating the one readers hold.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{QuereusError, Result};
use crate::schema::{IndexSchema, PrimaryKeyPart, TableSchema};
use crate::types::{Collation, SqlValue};
use crate::vtab::Row;

/// One component of an ordered tree key. The collation is folded into the
/// comparison and `desc` reverses it, so a single `Ord` drives every tree.
#[derive(Debug, Clone)]
pub struct KeyPart {
    pub value: SqlValue,
    pub desc: bool,
    pub collation: Collation,
}

#[derive(Debug, Clone)]
pub struct LayerKey {
    pub parts: Vec<KeyPart>,
}

impl LayerKey {
    pub fn values(&self) -> Vec<SqlValue> {
        self.parts.iter().map(|p| p.value.clone()).collect()
    }
}

impl PartialEq for LayerKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LayerKey {}

impl PartialOrd for LayerKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LayerKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.parts.iter().zip(other.parts.iter()) {
            let mut ord = a.value.canonical_cmp(&b.value, a.collation);
            if a.desc {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.parts.len().cmp(&other.parts.len())
    }
}

/// Extract the primary-key tree key from a full row. Total on well-formed
/// rows; a row of the wrong arity is an internal error.
pub fn primary_key_of(schema: &TableSchema, row: &Row) -> Result<LayerKey> {
    if row.len() != schema.columns.len() {
        return Err(QuereusError::Internal(format!(
            "row arity {} does not match table {} ({} columns)",
            row.len(),
            schema.name,
            schema.columns.len()
        )));
    }
    let parts = schema
        .effective_primary_key()
        .iter()
        .map(|part| key_part(schema, *part, &row[part.column_index]))
        .collect();
    Ok(LayerKey { parts })
}

/// Build a primary-key tree key from bare key values in key-part order.
pub fn primary_key_from_values(schema: &TableSchema, values: &[SqlValue]) -> Result<LayerKey> {
    let pk = schema.effective_primary_key();
    if values.len() != pk.len() {
        return Err(QuereusError::Internal(format!(
            "key arity {} does not match table {} key ({} parts)",
            values.len(),
            schema.name,
            pk.len()
        )));
    }
    let parts = pk
        .iter()
        .zip(values)
        .map(|(part, v)| key_part(schema, *part, v))
        .collect();
    Ok(LayerKey { parts })
}

/// Key for a secondary-index tree entry. Unique indexes key on the index
/// columns alone; non-unique indexes append the primary key to keep entries
/// distinct per row.
pub fn index_key_of(
    schema: &TableSchema,
    index: &IndexSchema,
    row: &Row,
    pk: &LayerKey,
) -> LayerKey {
    let mut parts: Vec<KeyPart> = index
        .columns
        .iter()
        .map(|part| key_part(schema, *part, &row[part.column_index]))
        .collect();
    if !index.unique {
        parts.extend(pk.parts.iter().cloned());
    }
    LayerKey { parts }
}

fn key_part(schema: &TableSchema, part: PrimaryKeyPart, value: &SqlValue) -> KeyPart {
    let column = &schema.columns[part.column_index];
    KeyPart {
        value: value.clone().apply_affinity(column.affinity),
        desc: part.desc,
        collation: column.collation,
    }
}

/// The committed state of a table: the primary tree plus one parallel tree
/// per secondary index, stamped with a commit epoch. Published as an `Arc`
/// and never mutated in place.
#[derive(Debug, Clone)]
pub struct BaseLayer {
    pub rows: BTreeMap<LayerKey, Row>,
    /// index name → (index key → primary key).
    pub indexes: HashMap<String, BTreeMap<LayerKey, LayerKey>>,
    pub epoch: u64,
}

impl BaseLayer {
    pub fn empty() -> Self {
        Self {
            rows: BTreeMap::new(),
            indexes: HashMap::new(),
            epoch: 0,
        }
    }
}

/// A delta over a committed snapshot: each primary-key slot is an upserted
/// row (`Some`) or a tombstone (`None`), with mirrored index deltas.
#[derive(Debug, Clone)]
pub struct TransactionLayer {
    pub parent: Arc<BaseLayer>,
    pub mods: BTreeMap<LayerKey, Option<Row>>,
    pub index_mods: HashMap<String, BTreeMap<LayerKey, Option<LayerKey>>>,
}

impl TransactionLayer {
    pub fn over(parent: Arc<BaseLayer>) -> Self {
        Self {
            parent,
            mods: BTreeMap::new(),
            index_mods: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    /// Point read through this layer: the first layer with an entry decides.
    pub fn get(&self, key: &LayerKey) -> Option<Row> {
        match self.mods.get(key) {
            Some(Some(row)) => Some(row.clone()),
            Some(None) => None,
            None => self.parent.rows.get(key).cloned(),
        }
    }

    pub fn contains(&self, key: &LayerKey) -> bool {
        match self.mods.get(key) {
            Some(entry) => entry.is_some(),
            None => self.parent.rows.contains_key(key),
        }
    }

    /// Record an upsert, maintaining index deltas against the previous
    /// effective row under the same key.
    pub fn upsert(&mut self, schema: &TableSchema, key: LayerKey, row: Row) {
        if let Some(old) = self.get(&key) {
            self.unindex_row(schema, &old, &key);
        }
        self.index_row(schema, &row, &key);
        self.mods.insert(key, Some(row));
    }

    /// Record a deletion as a tombstone.
    pub fn delete(&mut self, schema: &TableSchema, key: LayerKey) {
        if let Some(old) = self.get(&key) {
            self.unindex_row(schema, &old, &key);
        }
        self.mods.insert(key, None);
    }

    /// Effective lookup in a secondary index: delta first, then parent.
    pub fn index_get(&self, index_name: &str, key: &LayerKey) -> Option<LayerKey> {
        if let Some(mods) = self.index_mods.get(index_name) {
            match mods.get(key) {
                Some(Some(pk)) => return Some(pk.clone()),
                Some(None) => return None,
                None => {}
            }
        }
        self.parent
            .indexes
            .get(index_name)
            .and_then(|tree| tree.get(key).cloned())
    }

    fn index_row(&mut self, schema: &TableSchema, row: &Row, pk: &LayerKey) {
        for index in &schema.indexes {
            let ikey = index_key_of(schema, index, row, pk);
            self.index_mods
                .entry(index.name.clone())
                .or_default()
                .insert(ikey, Some(pk.clone()));
        }
    }

    fn unindex_row(&mut self, schema: &TableSchema, row: &Row, pk: &LayerKey) {
        for index in &schema.indexes {
            let ikey = index_key_of(schema, index, row, pk);
            self.index_mods
                .entry(index.name.clone())
                .or_default()
                .insert(ikey, None);
        }
    }

    /// Stream-wise merge of this delta with its parent snapshot, in key
    /// order: a tombstone suppresses the committed row, an upsert with an
    /// equal key replaces it.
    pub fn merged_rows(&self) -> Vec<Row> {
        let mut out = Vec::with_capacity(self.parent.rows.len() + self.mods.len());
        let mut base = self.parent.rows.iter().peekable();
        let mut delta = self.mods.iter().peekable();
        loop {
            match (base.peek(), delta.peek()) {
                (Some((bk, brow)), Some((dk, dmod))) => match bk.cmp(dk) {
                    Ordering::Less => {
                        out.push((*brow).clone());
                        base.next();
                    }
                    Ordering::Greater => {
                        if let Some(row) = dmod {
                            out.push(row.clone());
                        }
                        delta.next();
                    }
                    Ordering::Equal => {
                        if let Some(row) = dmod {
                            out.push(row.clone());
                        }
                        base.next();
                        delta.next();
                    }
                },
                (Some((_, brow)), None) => {
                    out.push((*brow).clone());
                    base.next();
                }
                (None, Some((_, dmod))) => {
                    if let Some(row) = dmod {
                        out.push(row.clone());
                    }
                    delta.next();
                }
                (None, None) => break,
            }
        }
        out
    }

    /// Fold this delta into its parent, yielding the next committed
    /// snapshot. The parent itself is left untouched.
    pub fn fold_into(&self, current: &BaseLayer) -> BaseLayer {
        let mut next = current.clone();
        next.epoch = current.epoch + 1;
        for (key, entry) in &self.mods {
            match entry {
                Some(row) => {
                    next.rows.insert(key.clone(), row.clone());
                }
                None => {
                    next.rows.remove(key);
                }
            }
        }
        for (index_name, mods) in &self.index_mods {
            let tree = next.indexes.entry(index_name.clone()).or_default();
            for (ikey, entry) in mods {
                match entry {
                    Some(pk) => {
                        tree.insert(ikey.clone(), pk.clone());
                    }
                    None => {
                        tree.remove(ikey);
                    }
                }
            }
        }
        next
    }

    /// Materialize this layer's effective delta into a fresh immutable layer
    /// with the same parent — the savepoint-snapshot construction.
    pub fn snapshot(&self) -> TransactionLayer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;
    use crate::types::Affinity;

    fn schema() -> TableSchema {
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
        s
    }

    fn row(id: i64, v: &str) -> Row {
        vec![SqlValue::Integer(id), SqlValue::Text(v.into())]
    }

    #[test]
    fn test_point_read_tombstone_decides() {
        let schema = schema();
        let mut base = BaseLayer::empty();
        let k1 = primary_key_of(&schema, &row(1, "a")).unwrap();
        base.rows.insert(k1.clone(), row(1, "a"));

        let mut layer = TransactionLayer::over(Arc::new(base));
        assert!(layer.contains(&k1));
        layer.delete(&schema, k1.clone());
        assert!(!layer.contains(&k1));
        assert!(layer.get(&k1).is_none());
    }

    #[test]
    fn test_merged_rows_overlay_wins() {
        let schema = schema();
        let mut base = BaseLayer::empty();
        for (id, v) in [(1, "a"), (2, "b"), (3, "c")] {
            let r = row(id, v);
            let k = primary_key_of(&schema, &r).unwrap();
            base.rows.insert(k, r);
        }
        let mut layer = TransactionLayer::over(Arc::new(base));
        let k2 = primary_key_of(&schema, &row(2, "b")).unwrap();
        layer.upsert(&schema, k2, row(2, "B"));
        let k3 = primary_key_of(&schema, &row(3, "c")).unwrap();
        layer.delete(&schema, k3);
        let k4 = primary_key_of(&schema, &row(4, "d")).unwrap();
        layer.upsert(&schema, k4, row(4, "d"));

        let merged = layer.merged_rows();
        let values: Vec<String> = merged.iter().map(|r| r[1].to_string()).collect();
        assert_eq!(values, vec!["a", "B", "d"]);
    }

    #[test]
    fn test_fold_advances_epoch_without_touching_parent() {
        let schema = schema();
        let base = Arc::new(BaseLayer::empty());
        let mut layer = TransactionLayer::over(Arc::clone(&base));
        let k = primary_key_of(&schema, &row(1, "a")).unwrap();
        layer.upsert(&schema, k, row(1, "a"));

        let folded = layer.fold_into(&base);
        assert_eq!(folded.epoch, 1);
        assert_eq!(folded.rows.len(), 1);
        assert!(base.rows.is_empty());
    }

    #[test]
    fn test_desc_key_part_reverses_order() {
        let a = LayerKey {
            parts: vec![KeyPart {
                value: SqlValue::Integer(1),
                desc: true,
                collation: Collation::Binary,
            }],
        };
        let b = LayerKey {
            parts: vec![KeyPart {
                value: SqlValue::Integer(2),
                desc: true,
                collation: Collation::Binary,
            }],
        };
        assert_eq!(a.cmp(&b), Ordering::Greater);
    }
}
