//! Catalog operations on a single tenant schema.

use crate::error::{GatewayError, Result};
use crate::provisioning::executor::Transaction;
use crate::provisioning::model::{Credentials, RequestContext, Schema, Strictness};
use crate::provisioning::tolerate;
use crate::provisioning::validator::validate_identifier;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, trace, warn};

const SCHEMA_EXISTS_SQL: &str = "SELECT n.nspname::text AS schema_name \
     FROM pg_catalog.pg_namespace n \
     WHERE n.nspname = $1 \
     AND n.nspname !~ '^pg_' \
     AND n.nspname <> 'information_schema' \
     AND n.nspname <> 'public'";

const SCHEMA_READ_SQL: &str = "SELECT n.nspname::text AS schema_name, \
     r.rolname::text AS owner_username, \
     n.nspacl::text AS schema_acl \
     FROM pg_catalog.pg_namespace n \
     LEFT JOIN pg_catalog.pg_roles r ON n.nspowner = r.oid \
     WHERE n.nspname = $1 \
     AND n.nspname !~ '^pg_' \
     AND n.nspname <> 'information_schema' \
     AND n.nspname <> 'public'";

const SCHEMA_LIST_SQL: &str = "SELECT n.nspname::text AS schema_name \
     FROM pg_catalog.pg_namespace n \
     WHERE n.nspname !~ '^pg_' \
     AND n.nspname <> 'information_schema' \
     AND n.nspname <> 'public' \
     ORDER BY n.nspname";

/// Persistence operations for tenant schemas.
///
/// Every method runs inside the caller's transaction and re-reads the catalog;
/// nothing is cached between calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaStore;

impl SchemaStore {
    pub fn new() -> Self {
        Self
    }

    pub async fn exists(&self, tx: &dyn Transaction, name: &str) -> Result<bool> {
        let outcome = tx.execute(SCHEMA_EXISTS_SQL, &[name]).await?;
        Ok(!outcome.rows.is_empty())
    }

    pub async fn ensure_exists(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        name: &str,
    ) -> Result<()> {
        if !self.exists(tx, name).await? {
            return Err(GatewayError::NotFound {
                kind: "Schema",
                name: name.to_string(),
            });
        }
        debug!(tracer = %ctx.tracer, "Schema {} exists", name);
        Ok(())
    }

    pub async fn ensure_absent(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        name: &str,
    ) -> Result<()> {
        if self.exists(tx, name).await? {
            return Err(GatewayError::AlreadyExists {
                kind: "Schema",
                name: name.to_string(),
            });
        }
        debug!(tracer = %ctx.tracer, "Schema {} does not exist", name);
        Ok(())
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        name: &str,
        strictness: Strictness,
    ) -> Result<()> {
        validate_identifier(name, "name")?;

        let created = async {
            self.ensure_absent(ctx, tx, name).await?;
            tx.execute(&format!("CREATE SCHEMA {}", name), &[]).await?;
            trace!(tracer = %ctx.tracer, "Schema {} created", name);
            Ok::<(), GatewayError>(())
        }
        .await;

        tolerate(ctx, strictness, created)
    }

    pub async fn drop(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        name: &str,
        strictness: Strictness,
    ) -> Result<()> {
        validate_identifier(name, "name")?;

        let dropped = async {
            self.ensure_exists(ctx, tx, name).await?;
            tx.execute(&format!("DROP SCHEMA {}", name), &[]).await?;
            trace!(tracer = %ctx.tracer, "Dropped schema {}", name);
            Ok::<(), GatewayError>(())
        }
        .await;

        tolerate(ctx, strictness, dropped)
    }

    /// Rebuilds a [`Schema`] from the catalog: the owner becomes the admin and
    /// the single grantee holding exactly USAGE (`U`) becomes the user.
    pub async fn read(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        name: &str,
    ) -> Result<Schema> {
        validate_identifier(name, "schema")?;

        let outcome = tx.execute(SCHEMA_READ_SQL, &[name]).await?;
        let row = match outcome.rows.as_slice() {
            [] => {
                return Err(GatewayError::NotFound {
                    kind: "Schema",
                    name: name.to_string(),
                })
            }
            [row] => row,
            _ => {
                return Err(GatewayError::Unexpected(format!(
                    "Multiple schemas found with name {}",
                    name
                )))
            }
        };

        let owner = row.get("owner_username").unwrap_or_default();
        let acl = row.get("schema_acl").unwrap_or_default();
        debug!(tracer = %ctx.tracer, "Schema {} owned by {} with acl {}", name, owner, acl);

        let mut grantees = usage_only_grantees(acl);
        if grantees.len() > 1 {
            return Err(GatewayError::MultipleUsersFound {
                schema: name.to_string(),
            });
        }
        let user = grantees.pop().unwrap_or_default();
        if user.is_empty() {
            warn!(tracer = %ctx.tracer, "Schema {} has no user role grant", name);
        }

        Ok(Schema::new(
            row.get("schema_name").unwrap_or(name),
            Credentials::username_only(owner),
            Credentials::username_only(user),
        ))
    }

    /// Names of all tenant schemas, alphabetically. Under `TolerateMissing` a
    /// failed listing yields an empty list instead of an error.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        strictness: Strictness,
    ) -> Result<Vec<String>> {
        match tx.execute(SCHEMA_LIST_SQL, &[]).await {
            Ok(outcome) => {
                let names: Vec<String> = outcome
                    .rows
                    .iter()
                    .filter_map(|row| row.get("schema_name").map(str::to_string))
                    .collect();
                trace!(tracer = %ctx.tracer, "Found {} schemas", names.len());
                Ok(names)
            }
            Err(e) if !strictness.is_enforced() => {
                warn!(tracer = %ctx.tracer, "Listing schemas failed, returning none: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

/// Grantees whose privileges on the schema are exactly `U`.
///
/// This is not a general ACL parser. It relies on the provisioning model:
/// the admin owns the schema (`UC`) and exactly one user role is granted
/// USAGE. The PUBLIC pseudo-role (empty grantee) is ignored. Entries look like
/// `grantee=U/grantor` inside `{...}`; quoting rules for exotic role names are
/// not handled since provisioned names are always snake_case.
pub(crate) fn usage_only_grantees(acl: &str) -> Vec<String> {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    let entry = ENTRY.get_or_init(|| {
        Regex::new(r"^(?P<username>[^=]*)=U/.*$").expect("ACL entry pattern is valid")
    });

    acl.trim_matches(|c| c == '{' || c == '}')
        .split(',')
        .filter_map(|item| entry.captures(item.trim()))
        .filter_map(|caps| caps.name("username").map(|m| m.as_str().to_string()))
        .filter(|username| !username.is_empty())
        .collect()
}
