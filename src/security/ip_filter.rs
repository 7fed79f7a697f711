use crate::error::ErrorResponse;
use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ipnetwork::IpNetwork;
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

/// Rejects requests whose client address is outside the allowed networks.
/// Loopback is always allowed.
///
/// The client is the connection peer. `X-Forwarded-For` is only consulted
/// when that peer is one of the trusted proxies.
#[derive(Clone)]
pub struct IpFilterLayer {
    allowed_networks: Arc<Vec<IpNetwork>>,
    trusted_proxies: Arc<Vec<IpNetwork>>,
}

impl IpFilterLayer {
    pub fn new(allowed_networks: Vec<IpNetwork>, trusted_proxies: Vec<IpNetwork>) -> Self {
        Self {
            allowed_networks: Arc::new(allowed_networks),
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }
}

impl<S> Layer<S> for IpFilterLayer {
    type Service = IpFilterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpFilterService {
            inner,
            allowed_networks: self.allowed_networks.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct IpFilterService<S> {
    inner: S,
    allowed_networks: Arc<Vec<IpNetwork>>,
    trusted_proxies: Arc<Vec<IpNetwork>>,
}

impl<S> Service<Request> for IpFilterService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let allowed_networks = self.allowed_networks.clone();
        let trusted_proxies = self.trusted_proxies.clone();
        // Take the service that was polled ready, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match client_ip(&req, &trusted_proxies) {
                Some(ip) if is_allowed(&allowed_networks, ip) => inner.call(req).await,
                Some(ip) => {
                    warn!("Rejected request from {} to {}", ip, req.uri().path());
                    Ok(forbidden(format!("Access denied for IP address: {}", ip)))
                }
                None => {
                    warn!("Rejected request to {}: client IP unknown", req.uri().path());
                    Ok(forbidden("Could not determine client IP".to_string()))
                }
            }
        })
    }
}

/// The peer address, or for a trusted proxy peer the nearest
/// `X-Forwarded-For` hop that is not itself a trusted proxy.
fn client_ip(req: &Request, trusted_proxies: &[IpNetwork]) -> Option<IpAddr> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())?;

    if !is_listed(trusted_proxies, peer) {
        return Some(peer);
    }

    let hops: Vec<IpAddr> = req
        .headers()
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .map(|hop| hop.parse::<IpAddr>().ok())
        .collect::<Option<Vec<_>>>()?;

    // Proxies append, so the right end is the part we can vouch for
    let client = hops
        .iter()
        .rev()
        .find(|hop| !is_listed(trusted_proxies, **hop))
        .or_else(|| hops.first())
        .copied();

    Some(client.unwrap_or(peer))
}

fn forbidden(message: String) -> Response {
    let body = ErrorResponse {
        error: "forbidden".to_string(),
        message,
        cause: None,
    };
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

fn is_allowed(allowed_networks: &[IpNetwork], ip: IpAddr) -> bool {
    ip.is_loopback() || is_listed(allowed_networks, ip)
}

fn is_listed(networks: &[IpNetwork], ip: IpAddr) -> bool {
    networks.iter().any(|network| network.contains(ip))
}
