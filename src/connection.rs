//! Database connection seam.
//!
//! The migration engine only talks to databases through [`Connection`];
//! [`ConnectionResolver`] turns a symbolic connection name into one.

use async_trait::async_trait;

use crate::dialect::Dialect;
use crate::error::MigrateResult;
use crate::value::SqlValue;

/// Rows returned by a select, with their column names in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { columns, rows }
    }

    /// First column of the first row, if any.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|row| row.first())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A single live database connection.
///
/// Statements run in autocommit mode unless [`Connection::begin`] has been
/// called; the open transaction then lasts until `commit` or `rollback`.
#[async_trait]
pub trait Connection: Send {
    /// The symbolic name this connection was resolved from.
    fn name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Run a select with positional bind parameters.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<RowSet>;

    /// Run a statement without parameters, returning rows affected.
    async fn execute(&mut self, sql: &str) -> MigrateResult<u64>;

    async fn begin(&mut self) -> MigrateResult<()>;

    async fn commit(&mut self) -> MigrateResult<()>;

    async fn rollback(&mut self) -> MigrateResult<()>;

    /// Release the connection. An open transaction is rolled back.
    async fn close(self: Box<Self>) -> MigrateResult<()>;
}

/// Resolves connection names to live connections.
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> MigrateResult<Box<dyn Connection>>;
}
