use envconfig::Envconfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::token_funnel::{DEFAULT_BUCKET_CAPACITY, DEFAULT_REPLENISH_INTERVAL};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// SQLite database file; empty means no database
    #[envconfig(from = "DATABASE_PATH", default = "")]
    pub database_path: String,

    /// Per-second token quota for routes without an explicit one
    #[envconfig(from = "DEFAULT_TOKEN_QUOTA", default = "100")]
    pub default_token_quota: u32,

    /// Upper bound on tokens queued for a single route
    #[envconfig(from = "TOKEN_BUCKET_CAPACITY", default = "100000")]
    pub token_bucket_capacity: usize,

    #[envconfig(from = "REPLENISH_INTERVAL_MS", default = "1000")]
    pub replenish_interval_ms: u64,

    /// Answer OPTIONS preflights on every route
    #[envconfig(from = "ALLOW_CROSS_DOMAIN", default = "false")]
    pub allow_cross_domain: bool,

    #[envconfig(from = "PRINT_ROUTE_TABLE", default = "false")]
    pub print_route_table: bool,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "MAX_BODY_BYTES", default = "10485760")]
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_bucket_capacity == 0 {
            return Err(ConfigError::Zero("TOKEN_BUCKET_CAPACITY"));
        }
        if self.replenish_interval_ms == 0 {
            return Err(ConfigError::Zero("REPLENISH_INTERVAL_MS"));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Zero("MAX_BODY_BYTES"));
        }
        Ok(())
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        if self.database_path.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.database_path))
        }
    }

    pub fn replenish_interval(&self) -> Duration {
        Duration::from_millis(self.replenish_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database_path: String::new(),
            default_token_quota: 100,
            token_bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            replenish_interval_ms: DEFAULT_REPLENISH_INTERVAL.as_millis() as u64,
            allow_cross_domain: false,
            print_route_table: false,
            log_level: "info".to_string(),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_env() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(config.default_token_quota, 100);
        assert_eq!(config.token_bucket_capacity, 100_000);
        assert_eq!(config.replenish_interval(), Duration::from_secs(1));
        assert!(config.database_path().is_none());
        assert!(!config.allow_cross_domain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("DATABASE_PATH".to_string(), "/tmp/app.db".to_string()),
            ("DEFAULT_TOKEN_QUOTA".to_string(), "2".to_string()),
            ("ALLOW_CROSS_DOMAIN".to_string(), "true".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.database_path(), Some(PathBuf::from("/tmp/app.db")));
        assert_eq!(config.default_token_quota, 2);
        assert!(config.allow_cross_domain);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = Config {
            replenish_interval_ms: 0,
            ..Config::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("REPLENISH_INTERVAL_MS"))
        );
    }
}
