//! Schema API endpoints
//!
//! - GET    /v1/nodes/{node}/databases/{database}/schemas          - List tenant schemas
//! - POST   /v1/nodes/{node}/databases/{database}/schemas          - Create a schema and its roles
//! - GET    /v1/nodes/{node}/databases/{database}/schemas/{schema} - Read one schema
//! - DELETE /v1/nodes/{node}/databases/{database}/schemas/{schema} - Remove a schema and its roles

use crate::api::{AppState, RequestTrace};
use crate::credentials::{decode_password, AdminCredentials};
use crate::error::{GatewayError, Result};
use crate::provisioning::{Credentials, Schema};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const MIN_FIELD_LENGTH: usize = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateSchemaRequest {
    pub name: String,
    pub admin: String,
    pub user: String,
    pub admin_password: String,
    pub user_password: String,
}

impl CreateSchemaRequest {
    fn into_schema(self) -> Result<Schema> {
        let fields = [
            ("name", &self.name),
            ("admin", &self.admin),
            ("user", &self.user),
            ("adminPassword", &self.admin_password),
            ("userPassword", &self.user_password),
        ];
        for (field, value) in fields {
            if value.chars().count() < MIN_FIELD_LENGTH {
                return Err(GatewayError::InvalidRequest {
                    message: format!(
                        "{} must be at least {} characters long",
                        field, MIN_FIELD_LENGTH
                    ),
                });
            }
        }

        let admin_password = decode_password(&self.admin_password, "adminPassword")?;
        let user_password = decode_password(&self.user_password, "userPassword")?;

        Ok(Schema::new(
            self.name,
            Credentials::new(self.admin, admin_password),
            Credentials::new(self.user, user_password),
        ))
    }
}

/// A schema as returned to callers: role names only, never secrets.
#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub name: String,
    pub admin: String,
    pub user: String,
}

impl From<&Schema> for SchemaResponse {
    fn from(schema: &Schema) -> Self {
        Self {
            name: schema.name().to_string(),
            admin: schema.admin().username().to_string(),
            user: schema.user().username().to_string(),
        }
    }
}

pub async fn list_schemas(
    State(state): State<Arc<AppState>>,
    Path((node, database)): Path<(String, String)>,
    RequestTrace(ctx): RequestTrace,
    AdminCredentials(admin): AdminCredentials,
) -> Result<Json<Vec<String>>> {
    let names = state
        .orchestrator
        .list_schemas(&ctx, &node, &database, &admin)
        .await?;

    Ok(Json(names))
}

pub async fn create_schema(
    State(state): State<Arc<AppState>>,
    Path((node, database)): Path<(String, String)>,
    RequestTrace(ctx): RequestTrace,
    AdminCredentials(admin): AdminCredentials,
    body: std::result::Result<Json<CreateSchemaRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(request) = body.map_err(|rejection| GatewayError::InvalidRequest {
        message: rejection.body_text(),
    })?;
    let schema = request.into_schema()?;

    let created = state
        .orchestrator
        .initialise_schema(&ctx, &node, &database, &admin, &schema)
        .await?;

    info!(tracer = %ctx.tracer, "Schema {} created in {} by {}", created.name(), database, admin.username());

    Ok((StatusCode::CREATED, Json(SchemaResponse::from(&created))))
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    Path((node, database, schema_name)): Path<(String, String, String)>,
    RequestTrace(ctx): RequestTrace,
    AdminCredentials(admin): AdminCredentials,
) -> Result<Json<SchemaResponse>> {
    let schema = state
        .orchestrator
        .get_schema(&ctx, &node, &database, &admin, &schema_name)
        .await?;

    Ok(Json(SchemaResponse::from(&schema)))
}

pub async fn delete_schema(
    State(state): State<Arc<AppState>>,
    Path((node, database, schema_name)): Path<(String, String, String)>,
    RequestTrace(ctx): RequestTrace,
    AdminCredentials(admin): AdminCredentials,
) -> Result<StatusCode> {
    state
        .orchestrator
        .remove_schema(&ctx, &node, &database, &admin, &schema_name)
        .await?;

    info!(tracer = %ctx.tracer, "Schema {} removed from {} by {}", schema_name, database, admin.username());

    Ok(StatusCode::NO_CONTENT)
}
