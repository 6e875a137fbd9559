//! Data Aggregator (spec §4.3): fan-out/first-success coordinator over the
//! Data Provider Registry, with a per-query TTL cache and circuit-breaking.
//!
//! Grounded on the teacher's original DEX-quote aggregator (`AggregatorError`
//! shape, `once_cell::sync::Lazy` cache pattern, `#[instrument(skip(self))]`
//! style) with its body replaced by `data_aggregator.py::DataAggregatorService`'s
//! provider fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::providers::{status_of, DataProvider, ProviderStatus};

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("no healthy provider returned a result for chain {chain}")]
    NoProviderSucceeded { chain: String },
}

#[derive(Clone)]
enum CachedValue {
    Assets(Vec<crate::chain::DiscoveredToken>),
    Balance(Decimal),
    Price(Option<f64>),
}

struct CacheEntry {
    value: CachedValue,
    written_at: Instant,
    #[allow(dead_code)]
    provider_name: String,
}

/// `(operation, arguments-tuple, chain) -> (result, written-at, provider-name)`
/// per spec §4.3 "Cache".
struct QueryCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl QueryCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn get(&self, key: &str) -> Option<CachedValue> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| {
            if entry.written_at.elapsed() < self.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    async fn set(&self, key: String, value: CachedValue, provider_name: String) {
        self.entries.write().await.insert(
            key,
            CacheEntry {
                value,
                written_at: Instant::now(),
                provider_name,
            },
        );
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

pub struct DataAggregator {
    providers: Vec<Arc<dyn DataProvider>>,
    cache: QueryCache,
    max_errors: u32,
}

impl DataAggregator {
    pub fn new(providers: Vec<Arc<dyn DataProvider>>, cache_ttl: Duration) -> Self {
        Self {
            providers,
            cache: QueryCache::new(cache_ttl),
            max_errors: 5,
        }
    }

    fn compatible_providers(&self, chain: &str) -> Vec<&Arc<dyn DataProvider>> {
        self.providers
            .iter()
            .filter(|p| p.supports_chain(chain) && p.is_healthy())
            .collect()
    }

    /// Sui routes through BlockVision first regardless of configured
    /// priority order (spec §4.3 "Chain-specific routing").
    fn ordered_for_chain<'a>(&self, chain: &str, candidates: Vec<&'a Arc<dyn DataProvider>>) -> Vec<&'a Arc<dyn DataProvider>> {
        if chain != "sui" {
            return candidates;
        }
        let mut ordered = candidates;
        ordered.sort_by_key(|p| {
            if p.kind() == crate::providers::ProviderKind::BlockVisionSui {
                0
            } else {
                1
            }
        });
        ordered
    }

    #[instrument(skip(self))]
    pub async fn get_wallet_assets(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<Vec<crate::chain::DiscoveredToken>, AggregatorError> {
        let cache_key = format!("wallet_assets:{}:{}", address, chain);
        if let Some(CachedValue::Assets(assets)) = self.cache.get(&cache_key).await {
            debug!(chain, "aggregator cache hit for wallet assets");
            return Ok(assets);
        }

        let candidates = self.ordered_for_chain(chain, self.compatible_providers(chain));
        for provider in candidates {
            match provider.get_wallet_assets(address, chain).await {
                Ok(assets) if !assets.is_empty() => {
                    provider.health().reset_errors();
                    self.cache
                        .set(cache_key, CachedValue::Assets(assets.clone()), provider.kind().name().to_string())
                        .await;
                    return Ok(assets);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(provider = provider.kind().name(), error = %e, "provider error");
                    provider.health().record_error();
                }
            }
        }

        Err(AggregatorError::NoProviderSucceeded {
            chain: chain.to_string(),
        })
    }

    #[instrument(skip(self))]
    pub async fn get_token_balance(
        &self,
        address: &str,
        chain: &str,
        contract: Option<&str>,
    ) -> Result<Decimal, AggregatorError> {
        let cache_key = format!("token_balance:{}:{}:{}", address, chain, contract.unwrap_or("native"));
        if let Some(CachedValue::Balance(balance)) = self.cache.get(&cache_key).await {
            return Ok(balance);
        }

        let candidates = self.ordered_for_chain(chain, self.compatible_providers(chain));
        for provider in candidates {
            match provider.get_token_balance(address, chain, contract).await {
                Ok(balance) if !balance.is_zero() => {
                    provider.health().reset_errors();
                    self.cache
                        .set(cache_key, CachedValue::Balance(balance), provider.kind().name().to_string())
                        .await;
                    return Ok(balance);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(provider = provider.kind().name(), error = %e, "provider error");
                    provider.health().record_error();
                }
            }
        }

        Err(AggregatorError::NoProviderSucceeded {
            chain: chain.to_string(),
        })
    }

    #[instrument(skip(self))]
    pub async fn get_token_price(&self, symbol: &str, chain: &str) -> Result<Option<f64>, AggregatorError> {
        let cache_key = format!("token_price:{}:{}", symbol, chain);
        if let Some(CachedValue::Price(price)) = self.cache.get(&cache_key).await {
            return Ok(price);
        }

        let candidates = self.ordered_for_chain(chain, self.compatible_providers(chain));
        for provider in candidates {
            match provider.get_token_price(symbol, chain).await {
                Ok(Some(price)) => {
                    provider.health().reset_errors();
                    self.cache
                        .set(cache_key, CachedValue::Price(Some(price)), provider.kind().name().to_string())
                        .await;
                    return Ok(Some(price));
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(provider = provider.kind().name(), error = %e, "provider error");
                    provider.health().record_error();
                }
            }
        }

        Ok(None)
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    /// Administrative: resets every provider's error counter (spec §6.3
    /// "reset provider error counters").
    pub fn reset_all_provider_errors(&self) {
        for provider in &self.providers {
            provider.health().reset_errors();
        }
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.providers
            .iter()
            .map(|p| status_of(p.as_ref(), self.max_errors))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CovalentProvider, DataProvider, ProviderPriority};

    #[tokio::test]
    async fn cache_miss_then_hit_short_circuits() {
        let cache = QueryCache::new(Duration::from_secs(300));
        assert!(cache.get("k").await.is_none());
        cache
            .set("k".to_string(), CachedValue::Price(Some(1.0)), "test".to_string())
            .await;
        assert!(matches!(cache.get("k").await, Some(CachedValue::Price(Some(p))) if p == 1.0));
    }

    #[test]
    fn unhealthy_provider_excluded_from_candidates() {
        let provider: Arc<dyn DataProvider> = Arc::new(CovalentProvider::new(ProviderPriority::Primary, None));
        for _ in 0..5 {
            provider.health().record_error();
        }
        let aggregator = DataAggregator::new(vec![provider], Duration::from_secs(300));
        assert!(aggregator.compatible_providers("ethereum").is_empty());
    }
}
