// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// db/pool.rs.

use std::{net::SocketAddr, time::Duration};

const DEV_JWT_SECRET: &str = "voyage_local_development_jwt_secret_must_be_32_chars";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_LOCK_TTL_SECS: u64 = 30;
const DEFAULT_CONTEXT_SWEEP_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Shared HS256 secret used to verify participant tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. In-memory stores are used when absent.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `voyage_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Time-to-live of a document mutation lock.
    pub lock_ttl: Duration,
    /// Interval between expired-context sweeps.
    pub context_sweep_interval: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `VOYAGE_RELAY_HOST` | `0.0.0.0` |
    /// | `VOYAGE_RELAY_PORT` | `3001` |
    /// | `VOYAGE_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `VOYAGE_RELAY_DATABASE_URL` | *(none, in-memory stores)* |
    /// | `VOYAGE_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `VOYAGE_RELAY_LOG_FILTER` | `info` |
    /// | `VOYAGE_RELAY_LOG_FORMAT` | `text` |
    /// | `VOYAGE_RELAY_LOCK_TTL_SECS` | `30` |
    /// | `VOYAGE_RELAY_CONTEXT_SWEEP_SECS` | `300` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("VOYAGE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("VOYAGE_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("VOYAGE_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("VOYAGE_RELAY_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let cors_origins = env("VOYAGE_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("VOYAGE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("VOYAGE_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let lock_ttl_secs = env("VOYAGE_RELAY_LOCK_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_LOCK_TTL_SECS);
        let context_sweep_secs = env("VOYAGE_RELAY_CONTEXT_SWEEP_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_CONTEXT_SWEEP_SECS);

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            context_sweep_interval: Duration::from_secs(context_sweep_secs),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 3001);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert!(cfg.cors_origins.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.lock_ttl, Duration::from_secs(30));
        assert_eq!(cfg.context_sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("VOYAGE_RELAY_HOST", "127.0.0.1");
        m.insert("VOYAGE_RELAY_PORT", "4000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:4000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("VOYAGE_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 3001);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("VOYAGE_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
        assert_eq!(cfg.jwt_secret, "production_secret_at_least_32_chars!!");
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        let mut m = HashMap::new();
        m.insert("VOYAGE_RELAY_DATABASE_URL", "  ");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());

        let mut m = HashMap::new();
        m.insert("VOYAGE_RELAY_DATABASE_URL", "postgres://u:p@host/db?sslmode=require");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db?sslmode=require"));
    }

    #[test]
    fn log_settings_override() {
        let mut m = HashMap::new();
        m.insert("VOYAGE_RELAY_LOG_FILTER", "debug,tower_http=trace");
        m.insert("VOYAGE_RELAY_LOG_FORMAT", "json");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn lock_ttl_override_ignores_zero() {
        let mut m = HashMap::new();
        m.insert("VOYAGE_RELAY_LOCK_TTL_SECS", "5");
        assert_eq!(RelayConfig::from_env_fn(env_from_map(m)).lock_ttl, Duration::from_secs(5));

        let mut m = HashMap::new();
        m.insert("VOYAGE_RELAY_LOCK_TTL_SECS", "0");
        assert_eq!(RelayConfig::from_env_fn(env_from_map(m)).lock_ttl, Duration::from_secs(30));
    }
}
