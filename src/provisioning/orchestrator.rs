//! Two-phase schema provisioning with compensating teardown.
//!
//! Phase one creates the schema and both roles in a single transaction. Phase
//! two, in a fresh transaction, wires up search paths, ownership and grants.
//! Phase one has already committed by then, so a phase-two failure is undone by
//! tearing down everything phase one created.

use crate::error::{GatewayError, Result};
use crate::provisioning::database_store::DatabaseStore;
use crate::provisioning::executor::{ConnectionProvisioner, Transaction};
use crate::provisioning::model::{Credentials, RequestContext, Schema, Strictness};
use crate::provisioning::role_store::RoleStore;
use crate::provisioning::schema_store::SchemaStore;
use crate::provisioning::validator::{validate_identifier, validate_secret};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Schemas are provisioned with exactly one admin and one user role.
const MAX_ROLES_PER_SCHEMA: usize = 2;

pub struct ProvisioningOrchestrator {
    provisioner: Arc<dyn ConnectionProvisioner>,
    schemas: SchemaStore,
    roles: RoleStore,
    databases: DatabaseStore,
}

impl ProvisioningOrchestrator {
    pub fn new(provisioner: Arc<dyn ConnectionProvisioner>) -> Self {
        let schemas = SchemaStore::new();
        Self {
            provisioner,
            schemas,
            roles: RoleStore::new(schemas),
            databases: DatabaseStore::new(),
        }
    }

    /// Creates `schema` and its two roles in `database`, then grants them
    /// their permissions. On success the input value is returned unchanged.
    pub async fn initialise_schema(
        &self,
        ctx: &RequestContext,
        node: &str,
        database: &str,
        admin: &Credentials,
        schema: &Schema,
    ) -> Result<Schema> {
        validate_new_schema(admin, schema)?;
        info!(
            tracer = %ctx.tracer,
            "Initialising schema {} in database {} on node {}",
            schema.name(),
            database,
            node
        );

        let tx = self.provisioner.begin(ctx, database, admin).await?;
        let created = self.create_objects(ctx, tx.as_ref(), schema).await;
        self.finish(ctx, tx, created).await?;
        debug!(tracer = %ctx.tracer, "Phase one committed for schema {}", schema.name());

        if let Err(e) = self.grant_in_new_transaction(ctx, database, admin, schema).await {
            error!(
                tracer = %ctx.tracer,
                "Granting permissions for schema {} failed, removing it again: {}",
                schema.name(),
                e
            );
            let known_roles = [schema.admin().username(), schema.user().username()];
            if let Err(teardown_err) = self
                .teardown(ctx, database, admin, schema.name(), &known_roles)
                .await
            {
                error!(
                    tracer = %ctx.tracer,
                    "Compensating teardown of schema {} failed: {}",
                    schema.name(),
                    teardown_err
                );
            }
            return Err(e);
        }

        info!(tracer = %ctx.tracer, "Schema {} initialised", schema.name());
        Ok(schema.clone())
    }

    /// Drops the schema and the roles whose search path points at it. Missing
    /// objects are tolerated, so removing twice is harmless.
    pub async fn remove_schema(
        &self,
        ctx: &RequestContext,
        node: &str,
        database: &str,
        admin: &Credentials,
        schema_name: &str,
    ) -> Result<()> {
        validate_identifier(schema_name, "schema")?;
        validate_identifier(admin.username(), "username")?;
        info!(
            tracer = %ctx.tracer,
            "Removing schema {} from database {} on node {}",
            schema_name,
            database,
            node
        );

        self.teardown(ctx, database, admin, schema_name, &[]).await
    }

    pub async fn get_schema(
        &self,
        ctx: &RequestContext,
        node: &str,
        database: &str,
        admin: &Credentials,
        schema_name: &str,
    ) -> Result<Schema> {
        validate_identifier(schema_name, "schema")?;
        trace!(tracer = %ctx.tracer, "Reading schema {} from {} on node {}", schema_name, database, node);

        let mut tx = self.provisioner.begin(ctx, database, admin).await?;
        let schema = self.schemas.read(ctx, tx.as_ref(), schema_name).await;
        self.handle_rollback(ctx, tx.as_mut()).await;
        schema
    }

    pub async fn list_schemas(
        &self,
        ctx: &RequestContext,
        node: &str,
        database: &str,
        admin: &Credentials,
    ) -> Result<Vec<String>> {
        trace!(tracer = %ctx.tracer, "Listing schemas of {} on node {}", database, node);

        let mut tx = self.provisioner.begin(ctx, database, admin).await?;
        let names = self
            .schemas
            .list(ctx, tx.as_ref(), Strictness::Enforce)
            .await;
        self.handle_rollback(ctx, tx.as_mut()).await;
        names
    }

    /// Connectable, non-template databases visible from `maintenance_db`.
    pub async fn list_databases(
        &self,
        ctx: &RequestContext,
        node: &str,
        maintenance_db: &str,
        admin: &Credentials,
    ) -> Result<Vec<String>> {
        trace!(tracer = %ctx.tracer, "Listing databases on node {}", node);

        let mut tx = self.provisioner.begin(ctx, maintenance_db, admin).await?;
        let names = self.databases.list(ctx, tx.as_ref()).await;
        self.handle_rollback(ctx, tx.as_mut()).await;
        names
    }

    async fn create_objects(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        schema: &Schema,
    ) -> Result<()> {
        let (schema_taken, admin_taken, user_taken) = futures::try_join!(
            self.schemas.exists(tx, schema.name()),
            self.roles.exists(tx, schema.admin().username()),
            self.roles.exists(tx, schema.user().username()),
        )?;
        if schema_taken {
            return Err(GatewayError::AlreadyExists {
                kind: "Schema",
                name: schema.name().to_string(),
            });
        }
        for (taken, role) in [(admin_taken, schema.admin()), (user_taken, schema.user())] {
            if taken {
                return Err(GatewayError::AlreadyExists {
                    kind: "User",
                    name: role.username().to_string(),
                });
            }
        }

        self.schemas
            .create(ctx, tx, schema.name(), Strictness::Enforce)
            .await?;
        self.roles
            .create(ctx, tx, schema.admin(), Strictness::Enforce)
            .await?;
        self.roles
            .create(ctx, tx, schema.user(), Strictness::Enforce)
            .await?;
        Ok(())
    }

    async fn grant_in_new_transaction(
        &self,
        ctx: &RequestContext,
        database: &str,
        admin: &Credentials,
        schema: &Schema,
    ) -> Result<()> {
        let mut tx = self.provisioner.begin(ctx, database, admin).await?;
        match self.grant_permissions(ctx, tx.as_ref(), admin, schema).await {
            Ok(()) => tx.commit().await,
            Err(e) => {
                // Rolled back before compensating: this transaction holds row
                // locks on the roles that teardown is about to drop.
                self.handle_rollback(ctx, tx.as_mut()).await;
                Err(e)
            }
        }
    }

    async fn grant_permissions(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        caller: &Credentials,
        schema: &Schema,
    ) -> Result<()> {
        let name = schema.name();
        let admin_role = schema.admin().username();
        let user_role = schema.user().username();

        self.roles
            .update_search_path(ctx, tx, name, admin_role)
            .await?;
        run(ctx, tx, format!("GRANT ALL ON ALL TABLES IN SCHEMA {} TO {}", name, admin_role)).await?;
        self.roles
            .grant_membership(ctx, tx, admin_role, caller.username())
            .await?;
        run(ctx, tx, format!("ALTER SCHEMA {} OWNER TO {}", name, admin_role)).await?;
        run(ctx, tx, format!("GRANT CREATE, USAGE ON SCHEMA public TO {}", admin_role)).await?;
        run(ctx, tx, format!("GRANT ALL ON ALL TABLES IN SCHEMA public TO {}", admin_role)).await?;
        run(ctx, tx, format!("GRANT ALL ON ALL SEQUENCES IN SCHEMA public TO {}", admin_role)).await?;
        run(ctx, tx, format!("GRANT ALL ON ALL FUNCTIONS IN SCHEMA public TO {}", admin_role)).await?;

        self.roles
            .update_search_path(ctx, tx, name, user_role)
            .await?;
        run(ctx, tx, format!("GRANT USAGE ON SCHEMA {} TO {}", name, user_role)).await?;
        run(
            ctx,
            tx,
            format!(
                "GRANT INSERT, SELECT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {} TO {}",
                name, user_role
            ),
        )
        .await?;
        Ok(())
    }

    /// Shared by `remove_schema` and compensation. `known_roles` are dropped in
    /// addition to whatever the search-path lookup finds; compensation needs
    /// this because phase two's search paths were rolled back.
    async fn teardown(
        &self,
        ctx: &RequestContext,
        database: &str,
        admin: &Credentials,
        schema_name: &str,
        known_roles: &[&str],
    ) -> Result<()> {
        let tx = self.provisioner.begin(ctx, database, admin).await?;
        let removed = self
            .drop_objects(ctx, tx.as_ref(), admin, schema_name, known_roles)
            .await;
        self.finish(ctx, tx, removed).await?;
        info!(tracer = %ctx.tracer, "Schema {} removed", schema_name);
        Ok(())
    }

    async fn drop_objects(
        &self,
        ctx: &RequestContext,
        tx: &dyn Transaction,
        admin: &Credentials,
        schema_name: &str,
        known_roles: &[&str],
    ) -> Result<()> {
        let discovered = self
            .roles
            .select_users_by_schema(ctx, tx, schema_name, Strictness::TolerateMissing)
            .await?;
        if discovered.len() > MAX_ROLES_PER_SCHEMA {
            return Err(GatewayError::TooManyUsersFound {
                schema: schema_name.to_string(),
                found: discovered.len(),
            });
        }

        let mut targets: Vec<String> = discovered.into_iter().map(|u| u.username).collect();
        for role in known_roles {
            if !targets.iter().any(|t| t == role) {
                targets.push(role.to_string());
            }
        }
        // The acting role is never a teardown target.
        targets.retain(|role| role != admin.username());

        self.schemas
            .drop(ctx, tx, schema_name, Strictness::TolerateMissing)
            .await?;

        try_join_all(targets.iter().map(|role| {
            self.roles
                .drop(ctx, tx, role, admin.username(), Strictness::TolerateMissing)
        }))
        .await?;
        debug!(tracer = %ctx.tracer, "Dropped {} roles of schema {}", targets.len(), schema_name);
        Ok(())
    }

    /// Commits on success; on failure rolls back and hands back the original
    /// error.
    async fn finish(
        &self,
        ctx: &RequestContext,
        mut tx: Box<dyn Transaction>,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => tx.commit().await,
            Err(e) => {
                self.handle_rollback(ctx, tx.as_mut()).await;
                Err(e)
            }
        }
    }

    async fn handle_rollback(&self, ctx: &RequestContext, tx: &mut dyn Transaction) {
        if let Err(e) = tx.rollback().await {
            warn!(tracer = %ctx.tracer, "Ignoring rollback failure: {}", e);
        }
    }
}

async fn run(ctx: &RequestContext, tx: &dyn Transaction, sql: String) -> Result<()> {
    tx.execute(&sql, &[]).await?;
    trace!(tracer = %ctx.tracer, "{}", sql);
    Ok(())
}

/// Everything `initialise_schema` will splice into SQL, checked before any
/// connection is opened.
fn validate_new_schema(admin: &Credentials, schema: &Schema) -> Result<()> {
    validate_identifier(schema.name(), "name")?;
    validate_identifier(admin.username(), "username")?;
    for role in [schema.admin(), schema.user()] {
        validate_identifier(role.username(), "username")?;
        validate_secret(role.secret(), "password")?;
    }

    if schema.admin().username() == schema.user().username() {
        return Err(GatewayError::InvalidRequest {
            message: "Admin and user roles must have different names".to_string(),
        });
    }
    if schema.admin().username() == admin.username() || schema.user().username() == admin.username() {
        return Err(GatewayError::InvalidRequest {
            message: "Schema roles must differ from the authenticated role".to_string(),
        });
    }
    Ok(())
}
