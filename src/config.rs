use ipnetwork::IpNetwork;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_host: String,
    pub gateway_port: u16,
    pub api_root: String,
    pub mode: String,
    pub database_host: String,
    pub database_port: u16,
    pub maintenance_database: String,
    pub max_connections_per_pool: u32,
    pub max_total_connections: u32,
    pub connection_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub allowed_networks: Vec<IpNetwork>,
    pub trusted_proxies: Vec<IpNetwork>,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source. Unparseable
    /// numbers fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let api_root = string("API_ROOT", "/development/operations/api")
            .trim_end_matches('/')
            .to_string();
        if !api_root.is_empty() && !api_root.starts_with('/') {
            anyhow::bail!("API_ROOT must start with '/': {}", api_root);
        }

        let allowed_networks = networks(&string("ALLOWED_NETWORKS", "127.0.0.0/8,::1/128"));
        let trusted_proxies = networks(&string("TRUSTED_PROXIES", ""));

        Ok(Config {
            gateway_host: string("GATEWAY_HOST", "127.0.0.1"),
            gateway_port: u16::try_from(number("GATEWAY_PORT", 9999)).unwrap_or(9999),
            api_root,
            mode: string("MODE", "unknown").to_lowercase(),
            database_host: string("DATABASE_HOST", "localhost"),
            database_port: u16::try_from(number("DATABASE_PORT", 5432)).unwrap_or(5432),
            maintenance_database: string("DATABASE_MAINTENANCE_DB", "postgres"),
            max_connections_per_pool: u32::try_from(number("DATABASE_MAX_POOL_SIZE", 2)).unwrap_or(2),
            max_total_connections: u32::try_from(number("MAX_TOTAL_CONNECTIONS", 100)).unwrap_or(100),
            connection_timeout: Duration::from_millis(number("DATABASE_CONNECTION_TIMEOUT_MILLIS", 1000)),
            pool_idle_timeout: Duration::from_secs(number("POOL_IDLE_TIMEOUT_SECS", 300)),
            allowed_networks,
            trusted_proxies,
            log_dir: PathBuf::from(string("LOG_DIR", "./logs")),
        })
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.gateway_host, self.gateway_port);
        addr.parse().map_err(|e| anyhow::anyhow!("Invalid socket address: {}", e))
    }
}

fn networks(list: &str) -> Vec<IpNetwork> {
    list.split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                IpNetwork::from_str(trimmed).ok()
            }
        })
        .collect()
}
