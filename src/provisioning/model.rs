//! Values passed through the provisioning workflow.

use std::fmt;
use uuid::Uuid;

/// A role name paired with its secret.
///
/// The same type carries both decoded request credentials and the at-rest name
/// of a database role, so nothing is validated on construction. Only the
/// username is ever printed; `Debug` redacts the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Credentials known only by name, as reconstructed from the catalog.
    pub fn username_only(username: impl Into<String>) -> Self {
        Self::new(username, String::new())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A tenant schema together with the admin role that owns it and the user role
/// that consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    admin: Credentials,
    user: Credentials,
}

impl Schema {
    pub fn new(name: impl Into<String>, admin: Credentials, user: Credentials) -> Self {
        Self {
            name: name.into(),
            admin,
            user,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn admin(&self) -> &Credentials {
        &self.admin
    }

    pub fn user(&self) -> &Credentials {
        &self.user
    }
}

/// A non-administrative role found through its default search path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRecord {
    pub id: String,
    pub username: String,
}

/// How a store reacts when an object it expects to be present is missing (or
/// one it is about to create already exists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// The conflict is a hard failure.
    Enforce,
    /// The conflict is logged and the operation becomes a no-op.
    TolerateMissing,
}

impl Strictness {
    pub fn is_enforced(self) -> bool {
        matches!(self, Strictness::Enforce)
    }
}

/// Correlation data threaded through one request for logging only.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tracer: String,
}

impl RequestContext {
    pub fn new(tracer: impl Into<String>) -> Self {
        Self {
            tracer: tracer.into(),
        }
    }

    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}
