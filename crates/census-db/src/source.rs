//! The seam between the connection manager and a concrete database pool.
//!
//! [`ConnectionSource`] hands out [`PooledConnection`]s. A pooled connection
//! goes back to its pool when it is dropped, so ownership alone guarantees
//! that every acquired connection is released exactly once.
//!
//! The manager never builds SQL: callers supply fully-formed query text
//! and positional [`QueryParam`] values, and get a [`RowSet`] back.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DbError;

/// One positional query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryParam {
    /// SQL `NULL`.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Text value.
    Text(String),
    /// JSON document.
    Json(serde_json::Value),
    /// UUID value.
    Uuid(Uuid),
    /// Timestamp with time zone.
    Timestamp(DateTime<Utc>),
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Uuid> for QueryParam {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<DateTime<Utc>> for QueryParam {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A single result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows returned by a statement plus the number of rows it affected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    /// Returned rows in result order.
    pub rows: Vec<Row>,
    /// Rows inserted, updated, or deleted by the statement.
    pub rows_affected: u64,
}

impl RowSet {
    /// A result with no rows and the given affected-row count.
    pub const fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// Whether the statement returned no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First returned row, if any.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// A physical database connection checked out of a pool.
///
/// Dropping the connection returns it to the pool. Implementations must
/// not return a connection with an open transaction to the pool.
pub trait PooledConnection: Send + 'static {
    /// Run one statement with positional parameters.
    fn execute(
        &mut self,
        query: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = Result<RowSet, DbError>> + Send;

    /// Open a transaction on this connection.
    fn begin(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Commit the open transaction.
    fn commit(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    /// Check that the connection is still alive.
    fn ping(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;
}

/// A pool of database connections.
pub trait ConnectionSource: Send + Sync + 'static {
    /// The connection type handed out by this source.
    type Connection: PooledConnection;

    /// Check out a validated connection.
    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, DbError>> + Send;

    /// Stop handing out connections. Sources without a pool to drain
    /// need not override this.
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_params_map_to_null() {
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some("x")), QueryParam::Text(String::from("x")));
    }

    #[test]
    fn affected_rowset_is_empty() {
        let set = RowSet::affected(7);
        assert!(set.is_empty());
        assert_eq!(set.rows_affected, 7);
        assert!(set.first().is_none());
    }
}
