use crate::error::{GatewayError, Result};
use crate::provisioning::{QueryOutcome, SqlRow, Transaction};
use async_trait::async_trait;
use deadpool_postgres::Object;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::warn;

/// A transaction held open on one pooled connection.
///
/// If it is dropped before `commit` or `rollback` succeeded, the connection
/// is detached from its pool instead of being recycled mid-transaction.
pub struct PgTransaction {
    client: Option<Object>,
    database: String,
    finished: bool,
}

impl PgTransaction {
    pub async fn begin(client: Object, database: &str) -> Result<Self> {
        client.batch_execute("BEGIN").await?;
        Ok(Self {
            client: Some(client),
            database: database.to_string(),
            finished: false,
        })
    }

    fn client(&self) -> Result<&Object> {
        match (&self.client, self.finished) {
            (Some(client), false) => Ok(client),
            _ => Err(GatewayError::Unexpected(format!(
                "Transaction on '{}' is already finished",
                self.database
            ))),
        }
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<QueryOutcome> {
        let client = self.client()?;

        if returns_rows(sql) {
            let bound: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let rows = client.query(sql, &bound).await?;
            let rows = rows.iter().map(text_row).collect::<Result<Vec<_>>>()?;
            return Ok(QueryOutcome {
                affected: rows.len() as u64,
                rows,
            });
        }

        if params.is_empty() {
            // Utility statements go through the simple protocol
            client.batch_execute(sql).await?;
            return Ok(QueryOutcome::default());
        }

        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let affected = client.execute(sql, &bound).await?;
        Ok(QueryOutcome {
            affected,
            rows: Vec::new(),
        })
    }

    async fn commit(&mut self) -> Result<()> {
        self.client()?.batch_execute("COMMIT").await?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client()?.batch_execute("ROLLBACK").await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(client) = self.client.take() {
            warn!(
                "Transaction on '{}' dropped while open, discarding its connection",
                self.database
            );
            drop(Object::take(client));
        }
    }
}

fn returns_rows(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("SELECT"))
}

fn text_row(row: &Row) -> Result<SqlRow> {
    let mut columns = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value: Option<String> = row.try_get(idx)?;
        columns.push((column.name().to_string(), value));
    }
    Ok(SqlRow::new(columns))
}
