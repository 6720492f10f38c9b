// Client configuration.
//
// Settings are built once by the process entry point (defaults, `from_env`, or by hand)
// and handed to the client; the core only ever reads them.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

const ENV_PREFIX: &str = "PMS_";
const MIN_REQUESTS_PER_SECOND: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub base_url: String,
    pub api_version: String,
    pub user_agent: String,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CacheSettings,
    pub pool: PoolConfig,
    pub enable_monitoring: bool,
    pub monitor_history: usize,
    pub log_level: String,
    pub structured_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: "https://api.oracle-hospitality.com".to_string(),
            api_version: "v1".to_string(),
            user_agent: concat!("pms-gateway-core/", env!("CARGO_PKG_VERSION")).to_string(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheSettings::default(),
            pool: PoolConfig::default(),
            enable_monitoring: true,
            monitor_history: 1000,
            log_level: "info".to_string(),
            structured_logging: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub read_ms: u64,
    pub write_ms: u64,
    pub pool_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            read_ms: 30_000,
            write_ms: 10_000,
            pool_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    // A per-call override may only shorten the configured read timeout.
    pub fn effective_read(&self, requested: Option<Duration>) -> Duration {
        let configured = Duration::from_millis(self.read_ms);
        match requested {
            Some(requested) if requested < configured => requested,
            _ => configured,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst_capacity: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10.0,
            burst_capacity: 20,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_entries: usize,
    pub sweep_interval_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            max_entries: 10_000,
            sweep_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_keepalive_connections: usize,
    pub keepalive_expiry_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            max_keepalive_connections: 20,
            keepalive_expiry_ms: 30_000,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `PMS_*` environment variables.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ApiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("BASE_URL") {
            settings.base_url = v;
        }
        if let Some(v) = var("API_VERSION") {
            settings.api_version = v;
        }
        if let Some(v) = var("LOG_LEVEL") {
            settings.log_level = v;
        }
        set_parsed(&var, "REQUEST_TIMEOUT_MS", &mut settings.timeouts.read_ms)?;
        set_parsed(&var, "CONNECT_TIMEOUT_MS", &mut settings.timeouts.connect_ms)?;
        set_parsed(&var, "WRITE_TIMEOUT_MS", &mut settings.timeouts.write_ms)?;
        set_parsed(&var, "POOL_TIMEOUT_MS", &mut settings.timeouts.pool_ms)?;
        set_parsed(&var, "MAX_RETRIES", &mut settings.retry.max_retries)?;
        set_parsed(&var, "RETRY_BACKOFF_MS", &mut settings.retry.initial_backoff_ms)?;
        set_parsed(&var, "ENABLE_CACHE", &mut settings.cache.enabled)?;
        set_parsed(&var, "CACHE_TTL_SECONDS", &mut settings.cache.ttl_seconds)?;
        set_parsed(&var, "CACHE_MAX_ENTRIES", &mut settings.cache.max_entries)?;
        set_parsed(&var, "ENABLE_RATE_LIMITING", &mut settings.rate_limit.enabled)?;
        set_parsed(&var, "REQUESTS_PER_SECOND", &mut settings.rate_limit.requests_per_second)?;
        set_parsed(&var, "BURST_CAPACITY", &mut settings.rate_limit.burst_capacity)?;
        set_parsed(&var, "STRUCTURED_LOGGING", &mut settings.structured_logging)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        let mut problems = Vec::new();

        if self.base_url.trim().is_empty() {
            problems.push("base_url must not be empty".to_string());
        }
        if !(5_000..=300_000).contains(&self.timeouts.read_ms) {
            problems.push(format!("read timeout {}ms outside 5s..=300s", self.timeouts.read_ms));
        }
        if self.retry.max_retries > 10 {
            problems.push(format!("max_retries {} exceeds 10", self.retry.max_retries));
        }
        if !(100..=60_000).contains(&self.retry.initial_backoff_ms) {
            problems.push(format!(
                "retry backoff {}ms outside 100ms..=60s",
                self.retry.initial_backoff_ms
            ));
        }
        if !(60..=3600).contains(&self.cache.ttl_seconds) {
            problems.push(format!("cache ttl {}s outside 60..=3600", self.cache.ttl_seconds));
        }
        if !(100..=100_000).contains(&self.cache.max_entries) {
            problems.push(format!(
                "cache capacity {} outside 100..=100000",
                self.cache.max_entries
            ));
        }
        let rate = self.rate_limit.requests_per_second;
        if rate.is_nan() || rate < MIN_REQUESTS_PER_SECOND {
            problems.push(format!(
                "requests_per_second must be at least {MIN_REQUESTS_PER_SECOND}"
            ));
        }
        if self.rate_limit.burst_capacity == 0 {
            problems.push("burst_capacity must be at least 1".to_string());
        }
        if self.pool.max_connections == 0 {
            problems.push("pool max_connections must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Configuration(problems.join("; ")))
        }
    }

    pub fn api_base_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }
}

fn set_parsed<T, F>(var: &F, name: &str, slot: &mut T) -> Result<(), ApiError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = raw.trim().parse().map_err(|_| {
            ApiError::Configuration(format!("{ENV_PREFIX}{name}: cannot parse {raw:?}"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.api_base_url(), "https://api.oracle-hospitality.com/v1");
    }

    #[test]
    fn test_lookup_overrides_defaults() -> anyhow::Result<()> {
        let vars: HashMap<&str, &str> = [
            ("PMS_BASE_URL", "https://pms.example.com/"),
            ("PMS_MAX_RETRIES", "5"),
            ("PMS_ENABLE_CACHE", "false"),
            ("PMS_REQUESTS_PER_SECOND", "2.5"),
        ]
        .into_iter()
        .collect();

        let settings = Settings::from_lookup(|k| vars.get(k).map(|v| v.to_string()))?;

        assert_eq!(settings.retry.max_retries, 5);
        assert!(!settings.cache.enabled);
        assert_eq!(settings.rate_limit.requests_per_second, 2.5);
        assert_eq!(settings.api_base_url(), "https://pms.example.com/v1");
        Ok(())
    }

    #[test]
    fn test_unparseable_and_out_of_range_values_are_rejected() {
        let err = Settings::from_lookup(|k| (k == "PMS_MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PMS_MAX_RETRIES"));

        let err = Settings::from_lookup(|k| (k == "PMS_MAX_RETRIES").then(|| "42".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("max_retries"));

        let err = Settings::from_lookup(|k| {
            (k == "PMS_REQUESTS_PER_SECOND").then(|| "1e-20".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("requests_per_second"));
    }

    #[test]
    fn test_override_never_lengthens_read_timeout() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(
            timeouts.effective_read(Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            timeouts.effective_read(Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
        assert_eq!(timeouts.effective_read(None), Duration::from_secs(30));
    }
}
