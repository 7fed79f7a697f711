use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::pool::transaction::PgTransaction;
use crate::provisioning::{ConnectionProvisioner, Credentials, RequestContext, Transaction};
use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_postgres::{Config as PoolConfig, Pool, PoolError, Runtime};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::{debug, info, trace};

struct PoolEntry {
    pool: Pool,
    fingerprint: String,
    last_used: RwLock<Instant>,
}

/// Caches one pool per `(role, database)` pair. Pools authenticate as the
/// calling role, so a pool is only reused when the caller presents the same
/// secret it was built with.
pub struct PoolManager {
    pools: DashMap<String, Arc<PoolEntry>>,
    config: Config,
    total_connections: AtomicU32,
}

impl PoolManager {
    pub fn new(config: Config) -> Self {
        Self {
            pools: DashMap::new(),
            config,
            total_connections: AtomicU32::new(0),
        }
    }

    pub async fn get_pool(&self, database: &str, credentials: &Credentials) -> Result<Pool> {
        let key = pool_key(database, credentials.username());
        let fingerprint = secret_fingerprint(credentials.secret());

        // Clone the entry out so no map guard is held across an await
        let cached = self.pools.get(&key).map(|entry| entry.value().clone());
        if let Some(entry) = cached {
            if entry.fingerprint == fingerprint {
                *entry.last_used.write().await = Instant::now();
                return Ok(entry.pool.clone());
            }
            debug!("Credentials changed for {}, rebuilding pool", key);
            self.remove_pool(&key);
        }

        self.create_pool_for(&key, database, credentials, fingerprint)
            .await
    }

    async fn create_pool_for(
        &self,
        key: &str,
        database: &str,
        credentials: &Credentials,
        fingerprint: String,
    ) -> Result<Pool> {
        // Check if we'd exceed max connections
        let current = self.total_connections.load(Ordering::Relaxed);
        if current + self.config.max_connections_per_pool > self.config.max_total_connections {
            self.evict_lru_pool().await;
        }

        let pool = create_pool(
            &self.database_url_for(database, credentials),
            &self.config,
        )?;

        // Test the connection before caching it
        drop(
            pool.get()
                .await
                .map_err(|e| connection_error(database, e))?,
        );

        let entry = Arc::new(PoolEntry {
            pool: pool.clone(),
            fingerprint,
            last_used: RwLock::new(Instant::now()),
        });

        self.pools.insert(key.to_string(), entry);
        self.total_connections
            .fetch_add(self.config.max_connections_per_pool, Ordering::Relaxed);

        info!("Created pool for {}", key);

        Ok(pool)
    }

    fn database_url_for(&self, database: &str, credentials: &Credentials) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            urlencoding::encode(credentials.username()),
            urlencoding::encode(credentials.secret()),
            self.config.database_host,
            self.config.database_port,
            urlencoding::encode(database)
        )
    }

    fn remove_pool(&self, key: &str) -> bool {
        if self.pools.remove(key).is_some() {
            self.total_connections
                .fetch_sub(self.config.max_connections_per_pool, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    async fn snapshot(&self) -> Vec<(String, Instant)> {
        let entries: Vec<(String, Arc<PoolEntry>)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut snapshot = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            snapshot.push((key, *entry.last_used.read().await));
        }
        snapshot
    }

    async fn evict_lru_pool(&self) {
        let oldest = self
            .snapshot()
            .await
            .into_iter()
            .min_by_key(|(_, last_used)| *last_used);

        if let Some((key, last_used)) = oldest {
            if self.remove_pool(&key) {
                info!("Evicted pool for {} (idle since {:?} ago)", key, last_used.elapsed());
            }
        }
    }

    pub async fn cleanup_idle_pools(&self) -> usize {
        let idle_timeout = self.config.pool_idle_timeout;
        let now = Instant::now();
        let mut removed = 0;

        for (key, last_used) in self.snapshot().await {
            if now.duration_since(last_used) > idle_timeout && self.remove_pool(&key) {
                removed += 1;
                debug!("Cleaned up idle pool for {}", key);
            }
        }

        if removed > 0 {
            info!("Cleaned up {} idle pools", removed);
        }

        removed
    }

    pub fn active_pools(&self) -> usize {
        self.pools.len()
    }

    pub fn total_connections(&self) -> u32 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionProvisioner for PoolManager {
    async fn begin(
        &self,
        ctx: &RequestContext,
        database: &str,
        admin: &Credentials,
    ) -> Result<Box<dyn Transaction>> {
        let pool = self.get_pool(database, admin).await?;
        let client = pool
            .get()
            .await
            .map_err(|e| connection_error(database, e))?;

        let tx = PgTransaction::begin(client, database).await?;
        trace!(tracer = %ctx.tracer, "Transaction opened on {} as {}", database, admin.username());
        Ok(Box::new(tx))
    }
}

fn create_pool(database_url: &str, config: &Config) -> Result<Pool> {
    let mut cfg = PoolConfig::new();
    cfg.url = Some(database_url.to_string());
    cfg.connect_timeout = Some(config.connection_timeout);
    cfg.application_name = Some(env!("CARGO_PKG_NAME").to_string());

    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: config.max_connections_per_pool as usize,
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(config.connection_timeout),
            create: Some(config.connection_timeout),
            recycle: Some(config.connection_timeout),
        },
        ..Default::default()
    });

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| GatewayError::Unexpected(format!("Failed to create pool: {}", e)))
}

/// Rejected credentials are the caller's problem; anything else means the
/// database is unreachable.
fn connection_error(database: &str, err: PoolError) -> GatewayError {
    if let PoolError::Backend(pg_err) = &err {
        if matches!(
            pg_err.code(),
            Some(code) if *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        ) {
            return GatewayError::Unauthorized {
                message: format!("Database rejected the provided credentials for '{}'", database),
            };
        }
    }

    GatewayError::ConnectionFailed {
        database: database.to_string(),
        cause: err.to_string(),
    }
}

fn pool_key(database: &str, username: &str) -> String {
    format!("{}@{}", username, database)
}

fn secret_fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
