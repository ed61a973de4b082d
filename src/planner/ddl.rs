//! DDL statement conversion: CREATE/DROP TABLE, INDEX, VIEW, ALTER TABLE
//! ADD CONSTRAINT, plus transaction and pragma statements.

use sqlparser::ast::{
    AlterTableOperation, ColumnOption, CreateIndex as AstCreateIndex,
    CreateTable as AstCreateTable, Expr as SqlExpr, ObjectType, Statement,
    TableConstraint, Value as AstValue,
};

use crate::error::{QuereusError, Result};
use crate::plan::{DdlStatement, PragmaStatement, TxStatement};
use crate::schema::{
    CheckConstraint, ColumnSchema, IndexSchema, PrimaryKeyPart, TableSchema, ViewSchema,
};
use crate::types::{Affinity, SqlValue};

use super::{object_name_str, StatementBuilder};

impl StatementBuilder {
    pub(crate) fn build_create_table(&mut self, create: &AstCreateTable) -> Result<DdlStatement> {
        let name = object_name_str(&create.name);
        let mut columns: Vec<ColumnSchema> = Vec::with_capacity(create.columns.len());
        let mut primary_key: Vec<PrimaryKeyPart> = Vec::new();
        let mut checks: Vec<CheckConstraint> = Vec::new();
        let mut indexes: Vec<IndexSchema> = Vec::new();

        for (index, column_def) in create.columns.iter().enumerate() {
            let mut column = ColumnSchema::new(
                column_def.name.value.clone(),
                Affinity::from_type_name(&column_def.data_type.to_string()),
            );
            for option in &column_def.options {
                match &option.option {
                    ColumnOption::NotNull => column.nullable = false,
                    ColumnOption::Null => column.nullable = true,
                    ColumnOption::Default(expr) => {
                        column.default_sql = Some(expr.to_string());
                    }
                    ColumnOption::Unique { is_primary, .. } => {
                        if *is_primary {
                            column.nullable = false;
                            primary_key.push(PrimaryKeyPart {
                                column_index: index,
                                desc: false,
                            });
                        } else {
                            indexes.push(IndexSchema {
                                name: format!("{}_{}_unique", name, column.name),
                                columns: vec![PrimaryKeyPart {
                                    column_index: index,
                                    desc: false,
                                }],
                                unique: true,
                            });
                        }
                    }
                    ColumnOption::Check(expr) => {
                        checks.push(CheckConstraint {
                            name: None,
                            expr_sql: expr.to_string(),
                        });
                    }
                    // Remaining column options don't affect the engine's
                    // storage model.
                    _ => {}
                }
            }
            columns.push(column);
        }

        for constraint in &create.constraints {
            match constraint {
                TableConstraint::PrimaryKey { columns: pk, .. } => {
                    for ident in pk {
                        let column_index = columns
                            .iter()
                            .position(|c| c.name.eq_ignore_ascii_case(&ident.value))
                            .ok_or_else(|| {
                                QuereusError::planning(format!(
                                    "no such column in PRIMARY KEY: {}",
                                    ident.value
                                ))
                            })?;
                        columns[column_index].nullable = false;
                        primary_key.push(PrimaryKeyPart {
                            column_index,
                            desc: false,
                        });
                    }
                }
                TableConstraint::Unique { columns: unique, .. } => {
                    let parts = unique
                        .iter()
                        .map(|ident| {
                            columns
                                .iter()
                                .position(|c| c.name.eq_ignore_ascii_case(&ident.value))
                                .map(|column_index| PrimaryKeyPart {
                                    column_index,
                                    desc: false,
                                })
                                .ok_or_else(|| {
                                    QuereusError::planning(format!(
                                        "no such column in UNIQUE: {}",
                                        ident.value
                                    ))
                                })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    indexes.push(IndexSchema {
                        name: format!("{}_unique_{}", name, indexes.len()),
                        columns: parts,
                        unique: true,
                    });
                }
                TableConstraint::Check { name: check_name, expr } => {
                    checks.push(CheckConstraint {
                        name: check_name.as_ref().map(|i| i.value.clone()),
                        expr_sql: expr.to_string(),
                    });
                }
                other => {
                    return Err(QuereusError::planning(format!(
                        "unsupported table constraint: {other}"
                    )))
                }
            }
        }

        let mut schema = TableSchema::new(name, columns);
        schema.primary_key = primary_key;
        schema.checks = checks;
        schema.indexes = indexes;
        Ok(DdlStatement::CreateTable {
            schema,
            if_not_exists: create.if_not_exists,
        })
    }

    pub(crate) fn build_create_virtual_table(
        &mut self,
        name: &sqlparser::ast::ObjectName,
        if_not_exists: bool,
        module_name: &sqlparser::ast::Ident,
        module_args: &[sqlparser::ast::Ident],
    ) -> Result<DdlStatement> {
        // Virtual tables declare their columns through module args of the
        // form `name type`.
        let mut columns = Vec::new();
        for arg in module_args {
            let text = arg.value.trim().to_string();
            let mut parts = text.splitn(2, char::is_whitespace);
            let column_name = parts
                .next()
                .ok_or_else(|| QuereusError::planning("empty virtual table column"))?;
            let affinity = parts
                .next()
                .map(Affinity::from_type_name)
                .unwrap_or(Affinity::Blob);
            columns.push(ColumnSchema::new(column_name, affinity));
        }
        let mut schema = TableSchema::new(object_name_str(name), columns);
        schema.module = module_name.value.clone();
        schema.module_args = module_args.iter().map(|a| a.value.clone()).collect();
        Ok(DdlStatement::CreateTable {
            schema,
            if_not_exists,
        })
    }

    pub(crate) fn build_create_index(&mut self, create: &AstCreateIndex) -> Result<DdlStatement> {
        let index_name = create
            .name
            .as_ref()
            .map(object_name_str)
            .ok_or_else(|| QuereusError::planning("CREATE INDEX requires a name"))?;
        let table_name = object_name_str(&create.table_name);
        let table = self.catalog.get_table(&table_name)?;

        let columns = create
            .columns
            .iter()
            .map(|item| {
                let SqlExpr::Identifier(ident) = &item.expr else {
                    return Err(QuereusError::planning(
                        "expression indexes are not supported",
                    ));
                };
                let column_index = table.column_index(&ident.value).ok_or_else(|| {
                    QuereusError::planning(format!(
                        "table {table_name} has no column named {}",
                        ident.value
                    ))
                })?;
                Ok(PrimaryKeyPart {
                    column_index,
                    desc: item.asc == Some(false),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DdlStatement::CreateIndex {
            table: table_name,
            index: IndexSchema {
                name: index_name,
                columns,
                unique: create.unique,
            },
            if_not_exists: create.if_not_exists,
        })
    }

    pub(crate) fn build_drop(&mut self, stmt: &Statement) -> Result<DdlStatement> {
        let Statement::Drop {
            object_type,
            if_exists,
            names,
            ..
        } = stmt
        else {
            return Err(QuereusError::Internal("build_drop on non-DROP".into()));
        };
        let [name] = names.as_slice() else {
            return Err(QuereusError::planning(
                "DROP supports exactly one object at a time",
            ));
        };
        let name = object_name_str(name);
        match object_type {
            ObjectType::Table => Ok(DdlStatement::DropTable {
                name,
                if_exists: *if_exists,
            }),
            ObjectType::View => Ok(DdlStatement::DropView {
                name,
                if_exists: *if_exists,
            }),
            other => Err(QuereusError::planning(format!(
                "unsupported DROP object: {other}"
            ))),
        }
    }

    pub(crate) fn build_alter_table(
        &mut self,
        name: &sqlparser::ast::ObjectName,
        operations: &[AlterTableOperation],
    ) -> Result<DdlStatement> {
        let table = object_name_str(name);
        let [operation] = operations else {
            return Err(QuereusError::planning(
                "ALTER TABLE supports exactly one operation",
            ));
        };
        match operation {
            AlterTableOperation::AddConstraint(TableConstraint::Check {
                name: check_name,
                expr,
            }) => Ok(DdlStatement::AddConstraint {
                table,
                check: CheckConstraint {
                    name: check_name.as_ref().map(|i| i.value.clone()),
                    expr_sql: expr.to_string(),
                },
            }),
            other => Err(QuereusError::planning(format!(
                "unsupported ALTER TABLE operation: {other}"
            ))),
        }
    }

    pub(crate) fn build_create_view(&mut self, stmt: &Statement) -> Result<DdlStatement> {
        let Statement::CreateView {
            name,
            columns,
            query,
            ..
        } = stmt
        else {
            return Err(QuereusError::Internal("build_create_view misuse".into()));
        };
        Ok(DdlStatement::CreateView {
            view: ViewSchema {
                name: object_name_str(name),
                sql: query.to_string(),
                columns: columns.iter().map(|c| c.name.value.clone()).collect(),
            },
        })
    }

    pub(crate) fn build_tx(&mut self, stmt: &Statement) -> Result<TxStatement> {
        Ok(match stmt {
            Statement::StartTransaction { .. } => TxStatement::Begin,
            Statement::Commit { .. } => TxStatement::Commit,
            Statement::Rollback { savepoint, .. } => match savepoint {
                Some(name) => TxStatement::RollbackTo(name.value.clone()),
                None => TxStatement::Rollback,
            },
            Statement::Savepoint { name } => TxStatement::Savepoint(name.value.clone()),
            Statement::ReleaseSavepoint { name } => TxStatement::Release(name.value.clone()),
            other => {
                return Err(QuereusError::Internal(format!(
                    "build_tx on non-transaction statement: {other}"
                )))
            }
        })
    }

    pub(crate) fn build_pragma(
        &mut self,
        name: &sqlparser::ast::ObjectName,
        value: Option<&AstValue>,
    ) -> Result<PragmaStatement> {
        let value = match value {
            None => None,
            Some(AstValue::Number(n, _)) => Some(match n.parse::<i64>() {
                Ok(i) => SqlValue::Integer(i),
                Err(_) => SqlValue::Real(n.parse::<f64>().map_err(|_| {
                    QuereusError::Parse(format!("malformed pragma value: {n}"))
                })?),
            }),
            Some(AstValue::SingleQuotedString(s)) | Some(AstValue::DoubleQuotedString(s)) => {
                Some(SqlValue::Text(s.clone()))
            }
            Some(AstValue::Boolean(b)) => Some(SqlValue::from(*b)),
            Some(other) => {
                return Err(QuereusError::planning(format!(
                    "unsupported pragma value: {other}"
                )))
            }
        };
        Ok(PragmaStatement {
            name: object_name_str(name),
            value,
        })
    }
}
