//! Boundary between the provisioning workflow and whatever executes SQL.

use crate::error::Result;
use crate::provisioning::model::{Credentials, RequestContext};
use async_trait::async_trait;

/// One result row. Catalog queries select text columns, so every cell is an
/// optional string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlRow {
    columns: Vec<(String, Option<String>)>,
}

impl SqlRow {
    pub fn new(columns: Vec<(String, Option<String>)>) -> Self {
        Self { columns }
    }

    /// Value of the named column; `None` for SQL NULL or an unknown column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub affected: u64,
    pub rows: Vec<SqlRow>,
}

/// An open transaction on a single connection.
///
/// Statements issued concurrently through `&self` are pipelined on that one
/// connection, so they still execute in submission order.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Runs one statement. `params` bind `$1..$n` as text and are only ever
    /// used for data values, never identifiers.
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<QueryOutcome>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Hands out transactions bound to a database, authenticated as the caller.
#[async_trait]
pub trait ConnectionProvisioner: Send + Sync {
    async fn begin(
        &self,
        ctx: &RequestContext,
        database: &str,
        admin: &Credentials,
    ) -> Result<Box<dyn Transaction>>;
}
