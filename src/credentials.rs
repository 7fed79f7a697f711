//! Caller credentials carried over HTTP.
//!
//! The acting database role arrives as `Authorization: Basic base64(user:secret)`;
//! the passwords of the roles to create arrive base64-encoded in the body.

use crate::error::{GatewayError, Result};
use crate::provisioning::Credentials;
use axum::{extract::FromRequestParts, http::request::Parts};
use base64::{engine::general_purpose::STANDARD, Engine};

/// The database role a request acts as.
#[derive(Debug, Clone)]
pub struct AdminCredentials(pub Credentials);

impl<S> FromRequestParts<S> for AdminCredentials
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or_else(|| unauthorized("Authorization header is missing"))?
            .to_str()
            .map_err(|_| unauthorized("Authorization header is not valid text"))?;

        parse_basic(header).map(AdminCredentials)
    }
}

/// Parses an `Authorization` header value of the `Basic` scheme.
pub fn parse_basic(header: &str) -> Result<Credentials> {
    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
        .ok_or_else(|| unauthorized("only the Basic scheme is supported"))?;

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| unauthorized("credentials are not valid base64"))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| unauthorized("credentials are not valid UTF-8"))?;

    let (username, secret) = decoded
        .split_once(':')
        .ok_or_else(|| unauthorized("credentials must be 'username:password'"))?;

    if username.is_empty() {
        return Err(unauthorized("username is empty"));
    }

    Ok(Credentials::new(username, secret))
}

/// Decodes a base64-encoded password taken from a request body.
pub fn decode_password(encoded: &str, field: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| GatewayError::InvalidRequest {
            message: format!("{} is not valid base64", field),
        })?;

    String::from_utf8(bytes).map_err(|_| GatewayError::InvalidRequest {
        message: format!("{} does not decode to UTF-8 text", field),
    })
}

fn unauthorized(message: &str) -> GatewayError {
    GatewayError::Unauthorized {
        message: message.to_string(),
    }
}
