mod database;
mod schemas;
mod status;

pub use database::list_databases;
pub use schemas::{create_schema, delete_schema, get_schema, list_schemas, CreateSchemaRequest, SchemaResponse};
pub use status::status;

use crate::config::Config;
use crate::pool::PoolManager;
use crate::provisioning::{ProvisioningOrchestrator, RequestContext};
use crate::security::IpFilterLayer;
use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    routing::get,
    Router,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state for every endpoint.
pub struct AppState {
    pub orchestrator: Arc<ProvisioningOrchestrator>,
    pub config: Config,
    pub start_time: Instant,
    pool_manager: Option<Arc<PoolManager>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ProvisioningOrchestrator>, config: Config) -> Self {
        Self {
            orchestrator,
            config,
            start_time: Instant::now(),
            pool_manager: None,
        }
    }

    /// Exposes the pool cache to `/status`.
    pub fn with_pool_manager(mut self, pool_manager: Arc<PoolManager>) -> Self {
        self.pool_manager = Some(pool_manager);
        self
    }

    pub fn active_pools(&self) -> usize {
        self.pool_manager
            .as_ref()
            .map(|pools| pools.active_pools())
            .unwrap_or(0)
    }
}

/// Correlation id of the current request: `X-Request-Id` when the caller sent
/// one, otherwise a fresh UUID.
#[derive(Debug, Clone)]
pub struct RequestTrace(pub RequestContext);

impl<S> FromRequestParts<S> for RequestTrace
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(RequestContext::new)
            .unwrap_or_else(RequestContext::generate);

        Ok(RequestTrace(ctx))
    }
}

/// All endpoints, mounted under the configured API root. Everything except
/// `/status` is restricted to the allowed networks.
pub fn app(state: Arc<AppState>) -> Router {
    let api_root = state.config.api_root.clone();
    let allowed_networks = state.config.allowed_networks.clone();
    let trusted_proxies = state.config.trusted_proxies.clone();

    let provisioning = Router::new()
        .route("/v1/nodes/{node}/databases", get(list_databases))
        .route(
            "/v1/nodes/{node}/databases/{database}/schemas",
            get(list_schemas).post(create_schema),
        )
        .route(
            "/v1/nodes/{node}/databases/{database}/schemas/{schema}",
            get(get_schema).delete(delete_schema),
        )
        .layer(IpFilterLayer::new(allowed_networks, trusted_proxies));

    let routes = Router::new()
        .route("/status", get(status))
        .merge(provisioning)
        .with_state(state);

    if api_root.is_empty() {
        routes
    } else {
        Router::new().nest(&api_root, routes)
    }
}
