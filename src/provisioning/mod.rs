//! Tenant schema provisioning
//!
//! Creates a PostgreSQL schema together with an admin role that owns it and a
//! user role restricted to CRUD on its tables, and tears all three down again.
//!
//! ```text
//! ProvisioningOrchestrator
//!   ├── SchemaStore   (CREATE/DROP SCHEMA, catalog reads)
//!   └── RoleStore     (CREATE USER, DROP ROLE, search_path)
//!         └── validator (every identifier and secret)
//! ```

pub mod database_store;
pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod role_store;
pub mod schema_store;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use database_store::DatabaseStore;
pub use executor::{ConnectionProvisioner, QueryOutcome, SqlRow, Transaction};
pub use model::{Credentials, RequestContext, RoleRecord, Schema, Strictness};
pub use orchestrator::ProvisioningOrchestrator;
pub use role_store::RoleStore;
pub use schema_store::SchemaStore;

use crate::error::Result;
use tracing::warn;

/// Applies `strictness` to the outcome of a create/drop step: precondition
/// conflicts become no-ops under `TolerateMissing`, everything else passes
/// through untouched.
pub(crate) fn tolerate(
    ctx: &RequestContext,
    strictness: Strictness,
    result: Result<()>,
) -> Result<()> {
    match result {
        Err(e) if !strictness.is_enforced() && e.is_precondition_conflict() => {
            warn!(tracer = %ctx.tracer, "Tolerated: {}", e);
            Ok(())
        }
        other => other,
    }
}
