//! Explicit, fully-enumerated pipeline configuration (spec §6.4, §9 redesign flag
//! against dynamic attribute access on configuration objects).

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Every recognized environment option, with typed defaults. Unknown env keys
/// are simply unread; every *recognized* key is validated at parse time, a
/// failure here is a startup-time `Fatal` per §7.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: String,
    pub history_retention_years: u32,
    pub history_interval_hours: u64,
    pub history_auto_update: bool,
    pub history_batch_size: usize,

    pub price_cache_ttl: Duration,
    pub price_batch_size: usize,
    pub price_rate_limit_delay: Duration,
    pub price_max_retries: u32,
    pub price_retry_base_delay: Duration,

    pub request_timeout: Duration,
    pub connect_timeout: Duration,

    pub aggregator_enabled: bool,
    pub aggregator_cache_ttl: Duration,
    pub fallback_to_chain_driver: bool,

    pub discovery_min_value_usd: f64,
    pub include_zero_balance_default: bool,
    pub manual_token_addition_enabled: bool,
    pub discovery_cache_ttl: Duration,
    pub discovery_max_concurrent: usize,

    pub primary_providers: Vec<String>,
    pub secondary_providers: Vec<String>,
    pub fallback_providers: Vec<String>,
    pub provider_api_keys: std::collections::HashMap<String, String>,

    pub database_url: String,
    pub redis_url: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            data_dir: env::var("PIPELINE_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            history_retention_years: parse_env("HISTORY_RETENTION_YEARS", 2)?,
            history_interval_hours: parse_env("HISTORY_INTERVAL_HOURS", 1)?,
            history_auto_update: parse_bool_env("HISTORY_AUTO_UPDATE", true)?,
            history_batch_size: parse_env("HISTORY_BATCH_SIZE", 50)?,

            price_cache_ttl: Duration::from_secs(parse_env("PRICE_CACHE_TTL_SECONDS", 300)?),
            price_batch_size: parse_env("PRICE_BATCH_SIZE", 10)?,
            price_rate_limit_delay: Duration::from_millis(parse_env(
                "PRICE_RATE_LIMIT_DELAY_MS",
                1200,
            )?),
            price_max_retries: parse_env("PRICE_MAX_RETRIES", 3)?,
            price_retry_base_delay: Duration::from_secs(parse_env(
                "PRICE_RETRY_BASE_DELAY_SECONDS",
                2,
            )?),

            request_timeout: Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECONDS", 30)?),
            connect_timeout: Duration::from_secs(parse_env("CONNECT_TIMEOUT_SECONDS", 10)?),

            aggregator_enabled: parse_bool_env("AGGREGATOR_ENABLED", true)?,
            aggregator_cache_ttl: Duration::from_secs(parse_env(
                "AGGREGATOR_CACHE_TTL_SECONDS",
                300,
            )?),
            fallback_to_chain_driver: parse_bool_env("FALLBACK_TO_CHAIN_DRIVER", true)?,

            discovery_min_value_usd: parse_env("DISCOVERY_MIN_VALUE_USD", 0.01)?,
            include_zero_balance_default: parse_bool_env("INCLUDE_ZERO_BALANCE_DEFAULT", false)?,
            manual_token_addition_enabled: parse_bool_env("MANUAL_TOKEN_ADDITION_ENABLED", true)?,
            discovery_cache_ttl: Duration::from_secs(parse_env("DISCOVERY_CACHE_TTL_SECONDS", 300)?),
            discovery_max_concurrent: parse_env("DISCOVERY_MAX_CONCURRENT", 10)?,

            primary_providers: parse_list_env("PRIMARY_PROVIDERS", &["covalent"]),
            secondary_providers: parse_list_env("SECONDARY_PROVIDERS", &["zerion", "moralis"]),
            fallback_providers: parse_list_env("FALLBACK_PROVIDERS", &["blockvision_sui"]),
            provider_api_keys: parse_keys_env("PROVIDER_API_KEY_"),

            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/portfolio".to_string()),
            redis_url: env::var("REDIS_URL").ok(),
        })
    }
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

fn parse_list_env(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn parse_keys_env(prefix: &str) -> std::collections::HashMap<String, String> {
    env::vars()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix)
                .map(|provider| (provider.to_ascii_lowercase(), v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let cfg = PipelineConfig {
            data_dir: "x".into(),
            history_retention_years: 2,
            history_interval_hours: 1,
            history_auto_update: true,
            history_batch_size: 50,
            price_cache_ttl: Duration::from_secs(300),
            price_batch_size: 10,
            price_rate_limit_delay: Duration::from_millis(1200),
            price_max_retries: 3,
            price_retry_base_delay: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            aggregator_enabled: true,
            aggregator_cache_ttl: Duration::from_secs(300),
            fallback_to_chain_driver: true,
            discovery_min_value_usd: 0.01,
            include_zero_balance_default: false,
            manual_token_addition_enabled: true,
            discovery_cache_ttl: Duration::from_secs(300),
            discovery_max_concurrent: 10,
            primary_providers: vec![],
            secondary_providers: vec![],
            fallback_providers: vec![],
            provider_api_keys: Default::default(),
            database_url: "postgres://localhost/portfolio".into(),
            redis_url: None,
        };
        assert_eq!(cfg.price_max_retries, 3);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        std::env::set_var("TEST_BOOL_FLAG", "yes");
        assert!(parse_bool_env("TEST_BOOL_FLAG", false).unwrap());
        std::env::remove_var("TEST_BOOL_FLAG");
    }

    #[test]
    fn parse_bool_rejects_garbage() {
        std::env::set_var("TEST_BOOL_FLAG_2", "maybe");
        assert!(parse_bool_env("TEST_BOOL_FLAG_2", false).is_err());
        std::env::remove_var("TEST_BOOL_FLAG_2");
    }
}
