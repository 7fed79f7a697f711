//! Gate for every value substituted into DDL/DCL text.
//!
//! PostgreSQL cannot bind identifiers as statement parameters, so schema and
//! role names (and role passwords) are spliced into fixed templates. Nothing
//! reaches a template without passing through here first.

use crate::error::{GatewayError, Result};

const FORBIDDEN_SECRET_CHARS: [char; 5] = [':', ';', '\\', '"', '`'];

/// Accepts only non-empty lowercase snake_case tokens (`^[a-z0-9_]+$`).
pub fn validate_identifier(value: &str, kind: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidIdentifier {
            kind: kind.to_string(),
            value: value.to_string(),
        })
    }
}

/// Rejects secrets that could terminate the quoted password literal or smuggle
/// in a statement separator.
pub fn validate_secret(value: &str, kind: &str) -> Result<()> {
    if value.contains(&FORBIDDEN_SECRET_CHARS[..]) || value.contains('\'') {
        return Err(GatewayError::InvalidSecret {
            kind: kind.to_string(),
        });
    }
    Ok(())
}
