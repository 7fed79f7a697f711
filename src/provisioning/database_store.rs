//! Database listing, read through a maintenance database.

use crate::error::Result;
use crate::provisioning::executor::Transaction;
use crate::provisioning::model::RequestContext;
use tracing::trace;

const DATABASE_LIST_SQL: &str = "SELECT d.datname::text AS datname \
     FROM pg_catalog.pg_database d \
     WHERE d.datistemplate = false \
     AND d.datallowconn = true \
     ORDER BY d.datname";

#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseStore;

impl DatabaseStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn list(&self, ctx: &RequestContext, tx: &dyn Transaction) -> Result<Vec<String>> {
        let outcome = tx.execute(DATABASE_LIST_SQL, &[]).await?;
        let names: Vec<String> = outcome
            .rows
            .iter()
            .filter_map(|row| row.get("datname").map(str::to_string))
            .collect();
        trace!(tracer = %ctx.tracer, "Found {} databases", names.len());
        Ok(names)
    }
}
