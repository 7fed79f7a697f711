//! Tenant Schema Gateway Library
//!
//! Provisions tenant-isolated PostgreSQL schemas, each with an owning admin
//! role and a CRUD-only user role, and exposes them over HTTP.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod pool;
pub mod provisioning;
pub mod security;
