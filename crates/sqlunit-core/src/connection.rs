//! The execution boundary consumed by the flush engine.
//!
//! The session never talks to a driver directly. It hands compiled
//! [`Statement`]s to a [`Connection`] inside a transaction identified by a
//! [`TransactionId`], and reads back an [`ExecuteResult`]. All operations
//! take a `Cx` and return an asupersync `Outcome` so cancellation flows
//! through the same path as driver failures.

use crate::error::Error;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::fmt;

/// SQL dialect, used for placeholder and identifier quoting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Whether `INSERT ... RETURNING` is available for generated keys.
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }
}

/// A compiled statement: SQL text plus ordered parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Column whose generated value the driver must report back.
    pub returning: Option<String>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            returning: None,
        }
    }

    #[must_use]
    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning = Some(column.into());
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// What a driver reports after executing one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    /// Generated key, when the statement asked for one.
    pub generated_key: Option<Value>,
}

impl ExecuteResult {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            generated_key: None,
        }
    }

    pub fn with_key(rows_affected: u64, key: impl Into<Value>) -> Self {
        Self {
            rows_affected,
            generated_key: Some(key.into()),
        }
    }
}

/// Opaque handle for a transaction opened by [`Connection::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// A connection to the backing store.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
/// A failed `execute` is treated as fatal to the surrounding transaction.
pub trait Connection: Send + Sync {
    /// Dialect used by the default statement compiler.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<TransactionId, Error>> + Send;

    /// Commit a transaction.
    fn commit(
        &self,
        cx: &Cx,
        tx: TransactionId,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back a transaction.
    fn rollback(
        &self,
        cx: &Cx,
        tx: TransactionId,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Create a savepoint inside `tx`.
    fn savepoint(
        &self,
        cx: &Cx,
        tx: TransactionId,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back to a savepoint, keeping the transaction open.
    fn rollback_to(
        &self,
        cx: &Cx,
        tx: TransactionId,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Release a savepoint.
    fn release(
        &self,
        cx: &Cx,
        tx: TransactionId,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Execute one statement within `tx`.
    fn execute(
        &self,
        cx: &Cx,
        tx: TransactionId,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecuteResult, Error>> + Send;
}
