//! Statement compilation boundary.
//!
//! The flush executor describes each write as a [`WriteOp`] and asks a
//! [`StatementCompiler`] for the SQL text and ordered parameters. The
//! bundled [`DialectCompiler`] covers placeholder style and identifier
//! quoting for the three supported dialects.

use crate::connection::{Dialect, Statement};
use crate::error::{Error, Result};
use crate::value::Value;

/// A write to be compiled into one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert one or more rows sharing a column list.
    Insert {
        table: &'static str,
        columns: Vec<&'static str>,
        rows: Vec<Vec<Value>>,
        /// Column whose generated value must be reported back.
        returning: Option<&'static str>,
    },
    /// Update one row.
    Update {
        table: &'static str,
        assignments: Vec<(&'static str, Value)>,
        /// Equality conditions; `Null` renders as `IS NULL`.
        conditions: Vec<(&'static str, Value)>,
    },
    /// Delete one or more rows, each identified by its own conditions.
    Delete {
        table: &'static str,
        rows: Vec<Vec<(&'static str, Value)>>,
    },
}

impl WriteOp {
    pub fn table(&self) -> &'static str {
        match self {
            WriteOp::Insert { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Delete { table, .. } => table,
        }
    }

    /// Number of rows the statement targets.
    pub fn row_count(&self) -> usize {
        match self {
            WriteOp::Insert { rows, .. } => rows.len(),
            WriteOp::Delete { rows, .. } => rows.len(),
            WriteOp::Update { .. } => 1,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            WriteOp::Insert { .. } => "INSERT",
            WriteOp::Update { .. } => "UPDATE",
            WriteOp::Delete { .. } => "DELETE",
        }
    }
}

/// Turns a [`WriteOp`] into SQL text plus parameters.
pub trait StatementCompiler: Send + Sync {
    #[allow(clippy::result_large_err)]
    fn compile(&self, op: &WriteOp) -> Result<Statement>;
}

/// Default compiler: ANSI-style SQL with per-dialect placeholders and quoting.
#[derive(Debug, Clone, Copy, Default)]
pub struct DialectCompiler {
    dialect: Dialect,
}

impl DialectCompiler {
    pub const fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn push_param(&self, params: &mut Vec<Value>, value: Value) -> String {
        params.push(value);
        self.dialect.placeholder(params.len())
    }

    fn conditions_sql(
        &self,
        conditions: &[(&'static str, Value)],
        params: &mut Vec<Value>,
    ) -> String {
        conditions
            .iter()
            .map(|(col, value)| {
                if value.is_null() {
                    format!("{} IS NULL", self.quote(col))
                } else {
                    let p = self.push_param(params, value.clone());
                    format!("{} = {}", self.quote(col), p)
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn compile_insert(
        &self,
        table: &str,
        columns: &[&'static str],
        rows: &[Vec<Value>],
        returning: Option<&'static str>,
    ) -> Result<Statement> {
        if rows.is_empty() {
            return Err(Error::invalid_request(format!(
                "INSERT into '{}' has no rows",
                table
            )));
        }

        let mut params = Vec::with_capacity(columns.len() * rows.len());
        let mut sql = format!("INSERT INTO {} ", self.quote(table));
        if columns.is_empty() {
            if rows.len() > 1 {
                return Err(Error::invalid_request(format!(
                    "multi-row INSERT into '{}' needs at least one column",
                    table
                )));
            }
            sql.push_str("DEFAULT VALUES");
        } else {
            let col_list: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
            sql.push('(');
            sql.push_str(&col_list.join(", "));
            sql.push_str(") VALUES ");

            for (i, row) in rows.iter().enumerate() {
                if row.len() != columns.len() {
                    return Err(Error::invalid_request(format!(
                        "INSERT into '{}' has {} columns but row {} has {} values",
                        table,
                        columns.len(),
                        i,
                        row.len()
                    )));
                }
                if i > 0 {
                    sql.push_str(", ");
                }
                let placeholders: Vec<String> = row
                    .iter()
                    .map(|v| self.push_param(&mut params, v.clone()))
                    .collect();
                sql.push('(');
                sql.push_str(&placeholders.join(", "));
                sql.push(')');
            }
        }

        let mut statement = match returning {
            Some(col) if self.dialect.supports_returning() => {
                sql.push_str(" RETURNING ");
                sql.push_str(&self.quote(col));
                Statement::new(sql, params)
            }
            _ => Statement::new(sql, params),
        };
        statement.returning = returning.map(str::to_string);
        Ok(statement)
    }

    fn compile_update(
        &self,
        table: &str,
        assignments: &[(&'static str, Value)],
        conditions: &[(&'static str, Value)],
    ) -> Result<Statement> {
        if assignments.is_empty() {
            return Err(Error::invalid_request(format!(
                "UPDATE of '{}' has no assignments",
                table
            )));
        }
        if conditions.is_empty() {
            return Err(Error::invalid_request(format!(
                "UPDATE of '{}' has no WHERE conditions",
                table
            )));
        }

        let mut params = Vec::with_capacity(assignments.len() + conditions.len());
        let set_clause: Vec<String> = assignments
            .iter()
            .map(|(col, v)| {
                let p = self.push_param(&mut params, v.clone());
                format!("{} = {}", self.quote(col), p)
            })
            .collect();
        let where_clause = self.conditions_sql(conditions, &mut params);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.quote(table),
            set_clause.join(", "),
            where_clause
        );
        Ok(Statement::new(sql, params))
    }

    fn compile_delete(&self, table: &str, rows: &[Vec<(&'static str, Value)>]) -> Result<Statement> {
        if rows.is_empty() || rows.iter().any(Vec::is_empty) {
            return Err(Error::invalid_request(format!(
                "DELETE from '{}' without row conditions",
                table
            )));
        }

        let mut params = Vec::new();

        // DELETE FROM t WHERE "id" IN ($1, $2, ...) for single-column keys
        let single_column = rows[0][0].0;
        let in_list = rows.len() > 1
            && rows
                .iter()
                .all(|r| r.len() == 1 && r[0].0 == single_column && !r[0].1.is_null());

        let where_clause = if in_list {
            let placeholders: Vec<String> = rows
                .iter()
                .map(|r| self.push_param(&mut params, r[0].1.clone()))
                .collect();
            format!(
                "{} IN ({})",
                self.quote(single_column),
                placeholders.join(", ")
            )
        } else if rows.len() == 1 {
            self.conditions_sql(&rows[0], &mut params)
        } else {
            rows.iter()
                .map(|r| format!("({})", self.conditions_sql(r, &mut params)))
                .collect::<Vec<_>>()
                .join(" OR ")
        };

        let sql = format!("DELETE FROM {} WHERE {}", self.quote(table), where_clause);
        Ok(Statement::new(sql, params))
    }
}

impl StatementCompiler for DialectCompiler {
    fn compile(&self, op: &WriteOp) -> Result<Statement> {
        match op {
            WriteOp::Insert {
                table,
                columns,
                rows,
                returning,
            } => self.compile_insert(table, columns, rows, *returning),
            WriteOp::Update {
                table,
                assignments,
                conditions,
            } => self.compile_update(table, assignments, conditions),
            WriteOp::Delete { table, rows } => self.compile_delete(table, rows),
        }
    }
}
