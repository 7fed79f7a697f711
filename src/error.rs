use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tokio_postgres::error::SqlState;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid {kind} '{value}' provided, only snake_case is allowed.")]
    InvalidIdentifier { kind: String, value: String },

    #[error("Provided {kind} contains invalid character(s).")]
    InvalidSecret { kind: String },

    #[error("{kind} with name '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} with name '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Multiple users with UPDATE privilege found on schema {schema}")]
    MultipleUsersFound { schema: String },

    #[error("Too many users found for schema {schema}: expected at most 2, found {found}")]
    TooManyUsersFound { schema: String, found: usize },

    #[error("No users found for schema {schema}")]
    NoUsersFound { schema: String },

    #[error("Missing or malformed authorization: {message}")]
    Unauthorized { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Connection failed to {database}: {cause}")]
    ConnectionFailed { database: String, cause: String },

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidIdentifier { .. }
            | GatewayError::InvalidSecret { .. }
            | GatewayError::InvalidRequest { .. }
            | GatewayError::NoUsersFound { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::AlreadyExists { .. } => StatusCode::CONFLICT,
            GatewayError::MultipleUsersFound { .. }
            | GatewayError::TooManyUsersFound { .. }
            | GatewayError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ConnectionFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidIdentifier { .. } => "invalid_identifier",
            GatewayError::InvalidSecret { .. } => "invalid_secret",
            GatewayError::AlreadyExists { .. } => "already_exists",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::MultipleUsersFound { .. } => "multiple_users_found",
            GatewayError::TooManyUsersFound { .. } => "too_many_users_found",
            GatewayError::NoUsersFound { .. } => "no_users_found",
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::ConnectionFailed { .. } => "connection_failed",
            GatewayError::Unexpected(_) => "unexpected_error",
        }
    }

    /// Classifies a server-side error. Losing a concurrent `CREATE SCHEMA` or
    /// `CREATE USER` is a conflict, not a failure.
    pub fn from_db_error(code: &SqlState, message: &str) -> Self {
        let kind = if *code == SqlState::DUPLICATE_SCHEMA {
            "Schema"
        } else if *code == SqlState::DUPLICATE_OBJECT {
            "User"
        } else {
            return GatewayError::Unexpected(message.to_string());
        };

        // Messages read `schema "name" already exists`
        let name = message
            .split('"')
            .nth(1)
            .filter(|name| !name.is_empty())
            .unwrap_or(message);

        GatewayError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }

    /// True for the conflicts a `TolerateMissing` caller may swallow.
    pub fn is_precondition_conflict(&self) -> bool {
        matches!(
            self,
            GatewayError::AlreadyExists { .. } | GatewayError::NotFound { .. }
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = match &self {
            GatewayError::ConnectionFailed { database, cause } => ErrorResponse {
                error: self.code().to_string(),
                message: format!("Failed to connect to database '{}'", database),
                cause: Some(cause.clone()),
            },
            GatewayError::Unexpected(cause) => ErrorResponse {
                error: self.code().to_string(),
                message: "Unexpected error occurred".to_string(),
                cause: Some(cause.clone()),
            },
            _ => ErrorResponse {
                error: self.code().to_string(),
                message: self.to_string(),
                cause: None,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

impl From<tokio_postgres::Error> for GatewayError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db_err) => GatewayError::from_db_error(db_err.code(), db_err.message()),
            None => GatewayError::Unexpected(err.to_string()),
        }
    }
}

impl From<deadpool_postgres::PoolError> for GatewayError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        GatewayError::Unexpected(format!("Pool error: {}", err))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Unexpected(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
