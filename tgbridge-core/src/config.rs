use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_LOCATOR_CACHE_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_STALE_STREAM_MAX_AGE_SECONDS: u64 = 14_400;
pub const DEFAULT_STREAM_CLEANUP_INTERVAL_SECONDS: u64 = 600;
pub const DEFAULT_MAX_CONCURRENT_STREAMS_PER_IDENTITY: u32 = 8;

/// Read-only application configuration, resolved once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Public origin used when constructing download/stream URLs.
    pub base_url: String,
    pub bind_address: String,
    pub port: u16,

    /// Origin of the platform's media API, used by the HTTP transport.
    pub api_base: String,

    /// Auth token of the primary identity.
    pub primary_token: String,
    /// Auth tokens of additional worker identities.
    pub additional_client_identities: Vec<String>,

    /// Document store for the bandwidth ledger; ledger persistence and the
    /// user count are disabled when unset.
    pub database_url: Option<String>,
    pub database_name: String,

    /// 0 disables link expiry.
    pub link_expiry_seconds: u64,
    /// 0 disables the monthly ceiling.
    pub monthly_bandwidth_ceiling_bytes: u64,

    pub max_concurrent_streams_per_identity: u32,
    /// Platform-aligned read size. Must be a power of two.
    pub chunk_size: u64,

    pub stale_stream_max_age_seconds: u64,
    pub stream_cleanup_interval_seconds: u64,
    pub locator_cache_max_entries: usize,

    /// Files above this size get their public URLs passed through an
    /// external shortener by the caller. 0 disables.
    pub shorten_threshold_bytes: u64,
    pub video_frontend_url: Option<String>,

    pub cors_allowed_origins: Vec<String>,

    pub rate_limit_max_requests: usize,
    pub rate_limit_window_seconds: u64,

    pub ledger_flush_interval_seconds: u64,
}

fn get_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn get_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn get_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn get_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(default),
    }
}

fn get_list(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            base_url: get_required("BASE_URL")?.trim_end_matches('/').to_string(),
            bind_address: get_or("BIND_ADDRESS", "0.0.0.0"),
            port: get_parsed("PORT", 8080)?,
            api_base: get_required("UPSTREAM_API_BASE")?
                .trim_end_matches('/')
                .to_string(),
            primary_token: get_required("BOT_TOKEN")?,
            additional_client_identities: get_list("ADDITIONAL_BOT_TOKENS"),
            database_url: get_optional("DATABASE_URL"),
            database_name: get_or("DATABASE_NAME", "tgbridge"),
            link_expiry_seconds: get_parsed("LINK_EXPIRY_SECONDS", 86_400)?,
            monthly_bandwidth_ceiling_bytes: get_parsed("BANDWIDTH_LIMIT_BYTES", 0)?,
            max_concurrent_streams_per_identity: get_parsed(
                "MAX_CONCURRENT_STREAMS_PER_IDENTITY",
                DEFAULT_MAX_CONCURRENT_STREAMS_PER_IDENTITY,
            )?,
            chunk_size: get_parsed("CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            stale_stream_max_age_seconds: get_parsed(
                "STALE_STREAM_MAX_AGE_SECONDS",
                DEFAULT_STALE_STREAM_MAX_AGE_SECONDS,
            )?,
            stream_cleanup_interval_seconds: get_parsed(
                "STREAM_CLEANUP_INTERVAL_SECONDS",
                DEFAULT_STREAM_CLEANUP_INTERVAL_SECONDS,
            )?,
            locator_cache_max_entries: get_parsed(
                "LOCATOR_CACHE_MAX_ENTRIES",
                DEFAULT_LOCATOR_CACHE_MAX_ENTRIES,
            )?,
            shorten_threshold_bytes: get_parsed("SHORTEN_THRESHOLD_BYTES", 0)?,
            video_frontend_url: get_optional("VIDEO_FRONTEND_URL"),
            cors_allowed_origins: get_list("CORS_ALLOWED_ORIGINS"),
            rate_limit_max_requests: get_parsed("RATE_LIMIT_MAX_REQUESTS", 15)?,
            rate_limit_window_seconds: get_parsed("RATE_LIMIT_WINDOW_SECONDS", 600)?,
            ledger_flush_interval_seconds: get_parsed("LEDGER_FLUSH_INTERVAL_SECONDS", 30)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(ConfigError::InvalidChunkSize(self.chunk_size));
        }
        if self.max_concurrent_streams_per_identity == 0 {
            return Err(ConfigError::General(
                "MAX_CONCURRENT_STREAMS_PER_IDENTITY must be at least 1".to_string(),
            ));
        }
        if self.locator_cache_max_entries == 0 {
            return Err(ConfigError::General(
                "LOCATOR_CACHE_MAX_ENTRIES must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Stable (id, token) pairs for every configured identity, primary
    /// first. Config order doubles as the dispatcher tie-break order.
    pub fn identity_tokens(&self) -> Vec<(String, String)> {
        let mut out = vec![("primary".to_string(), self.primary_token.clone())];
        for (i, token) in self.additional_client_identities.iter().enumerate() {
            out.push((format!("worker-{}", i), token.clone()));
        }
        out
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            base_url: "https://dl.example.com".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            api_base: "http://localhost:8081".to_string(),
            primary_token: "primary-token".to_string(),
            additional_client_identities: vec!["wt-0".to_string(), "wt-1".to_string()],
            database_url: None,
            database_name: "tgbridge".to_string(),
            link_expiry_seconds: 86_400,
            monthly_bandwidth_ceiling_bytes: 0,
            max_concurrent_streams_per_identity: 8,
            chunk_size: DEFAULT_CHUNK_SIZE,
            stale_stream_max_age_seconds: DEFAULT_STALE_STREAM_MAX_AGE_SECONDS,
            stream_cleanup_interval_seconds: DEFAULT_STREAM_CLEANUP_INTERVAL_SECONDS,
            locator_cache_max_entries: DEFAULT_LOCATOR_CACHE_MAX_ENTRIES,
            shorten_threshold_bytes: 0,
            video_frontend_url: None,
            cors_allowed_origins: vec![],
            rate_limit_max_requests: 15,
            rate_limit_window_seconds: 600,
            ledger_flush_interval_seconds: 30,
        }
    }

    #[test]
    fn identity_order_is_primary_then_workers() {
        let ids: Vec<String> = test_config()
            .identity_tokens()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["primary", "worker-0", "worker-1"]);
    }

    #[test]
    fn rejects_non_power_of_two_chunk_size() {
        let mut config = test_config();
        config.chunk_size = 1_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChunkSize(1_000_000))
        ));
    }
}
