//! The `generate_series` eponymous virtual table: the engine's
//! table-valued-function surface. Its arguments are hidden columns
//! (`start`, `stop`, `step`) the optimizer pushes equality constraints
//! into, in the manner of SQLite's series extension.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;

use crate::error::{QuereusError, Result};
use crate::schema::{Catalog, ColumnSchema, TableSchema};
use crate::types::{Affinity, SqlValue};

use super::{
    AccessPlan, AccessPlanRequest, ConflictPolicy, ConstraintOp, DmlOp, FilterArgs,
    OrderingTerm, Row, RowStream, VirtualTable, VtabConnection, VtabModule,
};

pub const SERIES_TABLE: &str = "generate_series";

/// Schema for the eponymous table: one visible column plus the hidden
/// argument columns.
pub fn series_schema() -> TableSchema {
    let hidden = |name: &str| {
        let mut column = ColumnSchema::new(name, Affinity::Integer);
        column.hidden = true;
        column
    };
    let mut schema = TableSchema::new(
        SERIES_TABLE,
        vec![
            ColumnSchema::new("value", Affinity::Integer).not_null(),
            hidden("start"),
            hidden("stop"),
            hidden("step"),
        ],
    );
    schema.module = "series".to_string();
    // The value column alone identifies a row.
    schema.primary_key = vec![crate::schema::PrimaryKeyPart {
        column_index: 0,
        desc: false,
    }];
    schema
}

/// Register the module and its eponymous table on a fresh database.
pub fn install(registry: &super::ModuleRegistry, catalog: &Catalog) -> Result<()> {
    registry.register(Arc::new(SeriesModule));
    catalog.create_table(series_schema())?;
    Ok(())
}

pub struct SeriesModule;

struct SeriesTable {
    schema: Arc<TableSchema>,
}

#[async_trait]
impl VtabModule for SeriesModule {
    fn name(&self) -> &str {
        "series"
    }

    async fn create(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        Ok(Arc::new(SeriesTable { schema }))
    }

    async fn connect(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        Ok(Arc::new(SeriesTable { schema }))
    }

    fn best_access_plan(
        &self,
        _schema: &TableSchema,
        request: &AccessPlanRequest,
    ) -> Result<AccessPlan> {
        let mut handled = vec![false; request.filters.len()];
        let mut bounded = false;
        for (i, filter) in request.filters.iter().enumerate() {
            // Equality on the hidden argument columns supplies the series
            // parameters; everything else stays residual.
            if filter.usable && filter.op == ConstraintOp::Eq && filter.column_index >= 1 {
                handled[i] = true;
                if filter.column_index == 2 {
                    bounded = true;
                }
            }
        }
        if !bounded {
            return Err(QuereusError::planning(
                "generate_series requires a stop bound (WHERE stop = ...)",
            ));
        }
        Ok(AccessPlan {
            handled_filters: handled,
            cost: 10.0,
            rows: None,
            provides_ordering: Some(vec![OrderingTerm {
                column_index: 0,
                desc: false,
            }]),
            is_set: true,
            explains: Some("series generator".to_string()),
        })
    }

    fn provides_access_planner(&self) -> bool {
        true
    }

    async fn destroy(&self, _schema: Arc<TableSchema>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VirtualTable for SeriesTable {
    fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema)
    }

    async fn query(
        &self,
        _conn: Option<&dyn VtabConnection>,
        filters: FilterArgs,
    ) -> Result<RowStream> {
        let mut start: i64 = 1;
        let mut stop: Option<i64> = None;
        let mut step: i64 = 1;
        for constraint in &filters.constraints {
            let value = match constraint.value.clone().cast(Affinity::Integer) {
                SqlValue::Integer(i) => i,
                _ => continue,
            };
            match constraint.column_index {
                1 => start = value,
                2 => stop = Some(value),
                3 => step = value,
                _ => {}
            }
        }
        let stop = stop.ok_or_else(|| {
            QuereusError::Runtime("generate_series requires a stop bound".into())
        })?;
        if step == 0 {
            return Err(QuereusError::Runtime(
                "generate_series step must not be zero".into(),
            ));
        }

        let mut rows: Vec<Result<Row>> = Vec::new();
        let mut value = start;
        while (step > 0 && value <= stop) || (step < 0 && value >= stop) {
            rows.push(Ok(vec![
                SqlValue::Integer(value),
                SqlValue::Integer(start),
                SqlValue::Integer(stop),
                SqlValue::Integer(step),
            ]));
            value = match value.checked_add(step) {
                Some(next) => next,
                None => break,
            };
            if let Some(limit) = filters.limit {
                if rows.len() as u64 >= limit {
                    break;
                }
            }
        }
        Ok(Box::pin(stream::iter(rows)))
    }

    async fn update(
        &self,
        _conn: Option<&dyn VtabConnection>,
        _op: DmlOp,
        _new_row: Option<Row>,
        _old_key: Option<Vec<SqlValue>>,
        _on_conflict: ConflictPolicy,
    ) -> Result<Option<Row>> {
        Err(QuereusError::Runtime(
            "generate_series is read-only".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtab::EvaluatedConstraint;
    use futures::StreamExt;

    fn eq(column_index: usize, value: i64) -> EvaluatedConstraint {
        EvaluatedConstraint {
            column_index,
            op: ConstraintOp::Eq,
            value: SqlValue::Integer(value),
        }
    }

    #[tokio::test]
    async fn test_series_generates_bounded_range() {
        let table = SeriesTable {
            schema: Arc::new(series_schema()),
        };
        let args = FilterArgs {
            constraints: vec![eq(1, 2), eq(2, 5)],
            ..FilterArgs::default()
        };
        let rows: Vec<Row> = table
            .query(None, args)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        let values: Vec<String> = rows.iter().map(|r| r[0].to_string()).collect();
        assert_eq!(values, vec!["2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_series_without_stop_is_error() {
        let table = SeriesTable {
            schema: Arc::new(series_schema()),
        };
        let err = match table.query(None, FilterArgs::default()).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, QuereusError::Runtime(_)));
    }

    #[test]
    fn test_access_plan_requires_stop() {
        let module = SeriesModule;
        let schema = series_schema();
        let request = AccessPlanRequest {
            columns: schema.columns.clone(),
            filters: vec![],
            required_ordering: None,
            limit: None,
            estimated_rows: None,
        };
        assert!(module.best_access_plan(&schema, &request).is_err());
    }
}
