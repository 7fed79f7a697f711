//! Catalog operations on single database roles.

use crate::error::{GatewayError, Result};
use crate::provisioning::executor::Transaction;
use crate::provisioning::model::{Credentials, RequestContext, RoleRecord, Strictness};
use crate::provisioning::schema_store::SchemaStore;
use crate::provisioning::tolerate;
use crate::provisioning::validator::{validate_identifier, validate_secret};
use tracing::{debug, trace, warn};

const ROLE_EXISTS_SQL: &str = "SELECT r.rolname::text AS username \
     FROM pg_catalog.pg_roles r \
     WHERE r.rolname = $1";

/// Roles whose only setting is `search_path=<schema>`, excluding anything with
/// superuser, CREATEDB or BYPASSRLS so teardown never touches administrators.
const USERS_BY_SCHEMA_SQL: &str = "SELECT u.usesysid::text AS id, u.usename::text AS username \
     FROM pg_catalog.pg_user u \
     WHERE array_to_string(u.useconfig, ',') = $1 \
     AND u.usecreatedb = false \
     AND u.usesuper = false \
     AND u.usebypassrls = false \
     ORDER BY u.usename";

#[derive(Debug, Clone, Copy, Default)]
pub struct RoleStore {
    schemas: SchemaStore,
}

impl RoleStore {
    pub fn new(schemas: SchemaStore) -> Self {
        Self { schemas }
    }

    pub async fn exists(&self, tx: &dyn Transaction, name: &str) -> Result<bool> {
        let outcome = tx.execute(ROLE_EXISTS_SQL, &[name]).await?;
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
                kind: "User",
                name: name.to_string(),
            });
        }
        debug!(tracer = %ctx.tracer, "User {} exists", name);
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
                kind: "User",
                name: name.to_string(),
            });
        }
        debug!(tracer = %ctx.tracer, "User {} does not exist", name);
        Ok(())
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        credentials: &Credentials,
        strictness: Strictness,
    ) -> Result<()> {
        let username = credentials.username();
        validate_identifier(username, "username")?;
        validate_secret(credentials.secret(), "password")?;

        let created = async {
            self.ensure_absent(ctx, tx, username).await?;
            let sql = format!(
                "CREATE USER {} WITH PASSWORD '{}'",
                username,
                credentials.secret()
            );
            tx.execute(&sql, &[]).await?;
            trace!(tracer = %ctx.tracer, "Created user {}", username);
            Ok::<(), GatewayError>(())
        }
        .await;

        tolerate(ctx, strictness, created)
    }

    /// Drops `username` after handing everything it owns to `admin`.
    ///
    /// Order matters: `admin` must first become a member of the role (REASSIGN
    /// OWNED needs the acting session to hold the source role), then ownership
    /// moves. With nothing left to own, `DROP OWNED` only revokes the
    /// privileges still granted to the role, such as those on `public`, and
    /// only then can the role be dropped. Membership granted here lives in the
    /// same transaction as the DROP, so it never outlives a failure and
    /// disappears together with the role on success.
    pub async fn drop(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        username: &str,
        admin: &str,
        strictness: Strictness,
    ) -> Result<()> {
        validate_identifier(username, "username")?;
        validate_identifier(admin, "username")?;

        match self.ensure_exists(ctx, tx, username).await {
            Ok(()) => {}
            Err(e) if !strictness.is_enforced() && e.is_precondition_conflict() => {
                warn!(tracer = %ctx.tracer, "Tolerated: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.grant_membership(ctx, tx, username, admin).await?;
        self.reassign_owned(ctx, tx, username, admin).await?;
        tx.execute(&format!("DROP OWNED BY {}", username), &[]).await?;
        tx.execute(&format!("DROP ROLE {}", username), &[]).await?;
        trace!(tracer = %ctx.tracer, "Dropped user {}", username);
        Ok(())
    }

    /// `GRANT <role> TO <grantee>`
    pub async fn grant_membership(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        role: &str,
        grantee: &str,
    ) -> Result<()> {
        validate_identifier(role, "role")?;
        validate_identifier(grantee, "username")?;

        tx.execute(&format!("GRANT {} TO {}", role, grantee), &[])
            .await?;
        trace!(tracer = %ctx.tracer, "Role {} granted to {}", role, grantee);
        Ok(())
    }

    async fn reassign_owned(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        from: &str,
        to: &str,
    ) -> Result<()> {
        tx.execute(&format!("REASSIGN OWNED BY {} TO {}", from, to), &[])
            .await?;
        trace!(tracer = %ctx.tracer, "Re-assigned object ownership from {} to {}", from, to);
        Ok(())
    }

    pub async fn update_search_path(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        schema: &str,
        username: &str,
    ) -> Result<()> {
        validate_identifier(schema, "schema")?;
        validate_identifier(username, "username")?;

        self.ensure_exists(ctx, tx, username).await?;
        self.schemas.ensure_exists(ctx, tx, schema).await?;

        tx.execute(
            &format!("ALTER ROLE {} SET search_path TO {}", username, schema),
            &[],
        )
        .await?;
        trace!(tracer = %ctx.tracer, "Search path of {} set to {}", username, schema);
        Ok(())
    }

    /// Non-administrative roles whose default search path is `schema`.
    pub async fn select_users_by_schema(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        schema: &str,
        strictness: Strictness,
    ) -> Result<Vec<RoleRecord>> {
        validate_identifier(schema, "schema")?;

        let setting = format!("search_path={}", schema);
        let outcome = tx.execute(USERS_BY_SCHEMA_SQL, &[setting.as_str()]).await?;
        let users: Vec<RoleRecord> = outcome
            .rows
            .iter()
            .filter_map(|row| {
                Some(RoleRecord {
                    id: row.get("id")?.to_string(),
                    username: row.get("username")?.to_string(),
                })
            })
            .collect();

        if strictness.is_enforced() && users.is_empty() {
            return Err(GatewayError::NoUsersFound {
                schema: schema.to_string(),
            });
        }

        debug!(tracer = %ctx.tracer, "Found {} users for schema {}", users.len(), schema);
        Ok(users)
    }
}
