//! Database API endpoints
//!
//! - GET /v1/nodes/{node}/databases - Databases a tenant schema can live in

use crate::api::{AppState, RequestTrace};
use crate::credentials::AdminCredentials;
use crate::error::Result;
use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

pub async fn list_databases(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
    RequestTrace(ctx): RequestTrace,
    AdminCredentials(admin): AdminCredentials,
) -> Result<Json<Vec<String>>> {
    let databases = state
        .orchestrator
        .list_databases(&ctx, &node, &state.config.maintenance_database, &admin)
        .await?;

    Ok(Json(databases))
}
