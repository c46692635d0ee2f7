//! Configuration module for txcache.
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::ConfigError;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the shared store, used in logs.
    pub cache_name: String,

    /// Shared store settings.
    pub cache: CacheConfig,

    /// Number of simulated requests the demo binary serves.
    pub worker_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_name: "shared".to_string(),
            cache: CacheConfig::default(),
            worker_requests: 8,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset ones keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("CACHE_NAME").filter(|s| !s.trim().is_empty()) {
            config.cache_name = name.trim().to_string();
        }

        if let Some(capacity) = parse::<u64, _>(&lookup, "CACHE_MAX_CAPACITY")? {
            config.cache.max_capacity = capacity;
        }

        // 0 disables expiry
        match parse::<u64, _>(&lookup, "CACHE_TTL_SECS")? {
            Some(0) => config.cache = config.cache.no_ttl(),
            Some(secs) => config.cache = config.cache.ttl(Duration::from_secs(secs)),
            None => {}
        }

        if let Some(secs) = parse::<u64, _>(&lookup, "CACHE_TTI_SECS")?.filter(|s| *s > 0) {
            config.cache = config.cache.tti(Duration::from_secs(secs));
        }

        if let Some(bytes) = parse::<usize, _>(&lookup, "CACHE_MAX_ENTRY_SIZE")? {
            config.cache = config.cache.max_entry_size(bytes);
        }

        if let Some(requests) = parse::<usize, _>(&lookup, "WORKER_REQUESTS")? {
            config.worker_requests = requests;
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };

    let parsed = raw.trim().parse::<T>();
    parsed
        .map(Some)
        .map_err(|_| ConfigError::Invalid { name, value: raw })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.cache_name, "shared");
        assert_eq!(config.cache.max_capacity, 10_000);
        assert_eq!(config.cache.max_entry_size, 1_000_000);
        assert_eq!(config.cache.ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.worker_requests, 8);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CACHE_NAME", " aplus "),
            ("CACHE_MAX_CAPACITY", "50"),
            ("CACHE_TTL_SECS", "0"),
            ("CACHE_TTI_SECS", "30"),
            ("CACHE_MAX_ENTRY_SIZE", "1024"),
            ("WORKER_REQUESTS", "2"),
        ])
        .unwrap();

        assert_eq!(config.cache_name, "aplus");
        assert_eq!(config.cache.max_capacity, 50);
        assert_eq!(config.cache.ttl, None);
        assert_eq!(config.cache.tti, Some(Duration::from_secs(30)));
        assert_eq!(config.cache.max_entry_size, 1024);
        assert_eq!(config.worker_requests, 2);
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("CACHE_MAX_ENTRY_SIZE", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                name: "CACHE_MAX_ENTRY_SIZE",
                value: "lots".to_string()
            }
        );
    }
}
