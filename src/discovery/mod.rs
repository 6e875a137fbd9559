//! Token Discovery Engine (spec §4.6): multi-layer wallet token discovery
//! with dedup, spam filtering, and a manual-add bypass.
//!
//! Grounded on `token_discovery_service.py`'s `TokenDiscoveryService`: the
//! aggregator-then-chain-driver-then-predefined-token layering, the
//! contract-or-native dedup key (shared with `chain::DiscoveredToken::
//! dedup_key`), the spam/suspicious-pattern filter list, the value-sort, and
//! the semaphore-bounded batch mode are all carried over; the discovery
//! cache here is the `database::cache::RedisCache` rather than a bare
//! in-process dict, since it's the same "Cache Tables" component (spec §2
//! item 9) the Data Aggregator already uses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::aggregator::DataAggregator;
use crate::chain::{ChainDriver, DiscoveredToken};
use crate::database::cache::RedisCache;
use crate::token_library::TokenLibrary;

const SPAM_SYMBOLS: &[&str] = &[
    "SPAM", "SCAM", "FAKE", "TEST", "AIRDROP", "FREE", "CLAIM", "BONUS", "GIFT", "REWARD", "WIN",
    "LUCKY", "PRIZE", "SAFEMOON",
];

const SUSPICIOUS_NAME_PATTERNS: &[&str] = &[
    "visit", "claim", "bonus", "airdrop", "free", "gift", "reward", "win", "lucky", "prize",
    "spam", "scam", "fake", "test",
];

pub struct DiscoveryConfig {
    pub min_value_usd: f64,
    pub include_zero_balance_default: bool,
    pub manual_token_addition_enabled: bool,
    pub cache_ttl: Duration,
    pub max_concurrent: usize,
}

pub struct DiscoveryEngine {
    aggregator: Arc<DataAggregator>,
    chain_drivers: HashMap<String, Arc<dyn ChainDriver>>,
    token_library: Arc<TokenLibrary>,
    cache: Option<Arc<RedisCache>>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(
        aggregator: Arc<DataAggregator>,
        chain_drivers: HashMap<String, Arc<dyn ChainDriver>>,
        token_library: Arc<TokenLibrary>,
        cache: Option<Arc<RedisCache>>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            aggregator,
            chain_drivers,
            token_library,
            cache,
            config,
        }
    }

    fn cache_key(address: &str, chain: &str, include_zero: bool, min_value: f64) -> String {
        format!("discovery:{}:{}:{}:{}", address, chain, include_zero, min_value)
    }

    /// Full pipeline per spec §4.6: aggregator first, chain-driver fallback
    /// if the aggregator came up empty, predefined-token probing layered on
    /// top, then dedup, spam filter, zero/threshold filters, price
    /// enrichment, and a value-descending sort.
    pub async fn discover_wallet_tokens(
        &self,
        address: &str,
        chain: &str,
        include_zero_balance: Option<bool>,
        min_value_usd: Option<f64>,
        use_cache: bool,
        force_refresh: bool,
    ) -> Vec<DiscoveredToken> {
        let include_zero = include_zero_balance.unwrap_or(self.config.include_zero_balance_default);
        let min_value = min_value_usd.unwrap_or(self.config.min_value_usd);
        let key = Self::cache_key(address, chain, include_zero, min_value);

        if use_cache && !force_refresh {
            if let Some(cache) = &self.cache {
                if let Some(cached) = cache.get::<Vec<DiscoveredToken>>(&key).await {
                    info!(address, chain, "discovery cache hit");
                    return cached;
                }
            }
        }

        info!(address, chain, "discovering wallet tokens");
        let mut discovered = Vec::new();

        match self.aggregator.get_wallet_assets(address, chain).await {
            Ok(tokens) if !tokens.is_empty() => {
                debug!(count = tokens.len(), "aggregator discovered tokens");
                discovered.extend(tokens);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "aggregator discovery failed"),
        }

        if discovered.is_empty() {
            if let Some(driver) = self.chain_drivers.get(chain) {
                match driver.enumerate_tokens(address, include_zero).await {
                    Ok(tokens) => {
                        debug!(count = tokens.len(), "chain driver discovered tokens");
                        discovered.extend(tokens);
                    }
                    Err(e) => warn!(error = %e, "chain driver discovery fallback failed"),
                }
            }
        }

        discovered.extend(self.probe_predefined_tokens(address, chain).await);

        let filtered = self.filter_and_deduplicate(discovered, min_value, include_zero);
        let enhanced = self.enhance_prices(filtered, chain).await;

        if use_cache {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.set_with_ttl(&key, &enhanced, self.config.cache_ttl).await {
                    warn!(error = %e, "failed to write discovery cache entry");
                }
            }
        }

        info!(address, chain, count = enhanced.len(), "discovery complete");
        enhanced
    }

    /// Probes every predefined token on the chain for a non-zero balance,
    /// in parallel with bounded concurrency (spec §4.6 step 3). Runs
    /// unconditionally, layered on top of whatever steps 1-2 already found.
    async fn probe_predefined_tokens(&self, address: &str, chain: &str) -> Vec<DiscoveredToken> {
        let Some(driver) = self.chain_drivers.get(chain) else {
            return Vec::new();
        };

        let tokens = match self.token_library.predefined_for_chain(chain).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(chain, error = %e, "failed to load predefined tokens for probing");
                return Vec::new();
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut handles = Vec::with_capacity(tokens.len());

        for token in tokens {
            let driver = Arc::clone(driver);
            let address = address.to_string();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let balance = match &token.contract {
                    Some(contract) => driver.token_balance(&address, contract).await,
                    None => driver.native_balance(&address).await,
                };
                (token, balance)
            }));
        }

        let mut discovered = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((token, Ok(balance))) if !balance.is_zero() => {
                    discovered.push(DiscoveredToken {
                        is_native: token.contract.is_none(),
                        symbol: token.symbol,
                        name: token.name,
                        contract: token.contract,
                        balance,
                        decimals: token.decimals as u8,
                        price_usd: None,
                        value_usd: None,
                    });
                }
                Ok((_, Ok(_))) => {}
                Ok((token, Err(e))) => debug!(symbol = %token.symbol, error = %e, "predefined token probe failed"),
                Err(e) => warn!(error = %e, "predefined token probe task panicked"),
            }
        }
        discovered
    }

    async fn enhance_prices(&self, tokens: Vec<DiscoveredToken>, chain: &str) -> Vec<DiscoveredToken> {
        let mut out = Vec::with_capacity(tokens.len());
        for mut token in tokens {
            if token.price_usd.is_none() {
                match self.aggregator.get_token_price(&token.symbol, chain).await {
                    Ok(Some(price)) => {
                        token.price_usd = Some(price);
                        token.value_usd = token.balance.to_f64().map(|b| b * price);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(symbol = %token.symbol, error = %e, "price enhancement failed"),
                }
            }
            out.push(token);
        }
        out
    }

    fn filter_and_deduplicate(
        &self,
        tokens: Vec<DiscoveredToken>,
        min_value_usd: f64,
        include_zero_balance: bool,
    ) -> Vec<DiscoveredToken> {
        let mut unique: HashMap<String, DiscoveredToken> = HashMap::new();
        for token in tokens {
            let key = token.dedup_key();
            match unique.get(&key) {
                Some(existing) if existing.balance >= token.balance => continue,
                _ => {
                    unique.insert(key, token);
                }
            }
        }

        let mut filtered: Vec<DiscoveredToken> = unique
            .into_values()
            .filter(|t| !is_spam_token(t))
            .filter(|t| include_zero_balance || !t.balance.is_zero())
            .filter(|t| t.value_usd.map(|v| v >= min_value_usd).unwrap_or(true))
            .collect();

        filtered.sort_by(|a, b| {
            b.value_usd
                .unwrap_or(0.0)
                .partial_cmp(&a.value_usd.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        filtered
    }

    /// Manual add bypasses the discovery cache entirely and always hits the
    /// live balance source (spec §4.6 "Manual add"), invalidating any cached
    /// discovery result for the same address/chain pair afterward.
    pub async fn add_manual_token(
        &self,
        address: &str,
        chain: &str,
        contract: Option<&str>,
        symbol: &str,
    ) -> Option<DiscoveredToken> {
        if !self.config.manual_token_addition_enabled {
            warn!("manual token addition is disabled");
            return None;
        }

        let balance = self
            .aggregator
            .get_token_balance(address, chain, contract)
            .await
            .unwrap_or(rust_decimal::Decimal::ZERO);

        if balance.is_zero() {
            warn!(symbol, "manual token has zero balance, not adding");
            return None;
        }

        let price = self.aggregator.get_token_price(symbol, chain).await.ok().flatten();
        let value_usd = price.and_then(|p| balance.to_f64().map(|b| b * p));

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate_prefix(&format!("discovery:{}:{}:", address, chain)).await {
                warn!(error = %e, "failed to invalidate discovery cache after manual add");
            }
        }

        info!(symbol, address, chain, "manually added token");
        Some(DiscoveredToken {
            symbol: symbol.to_uppercase(),
            name: String::new(),
            contract: contract.map(String::from),
            balance,
            decimals: 18,
            is_native: contract.is_none(),
            price_usd: price,
            value_usd,
        })
    }

    /// Bounded-concurrency fan-out over many addresses with per-address
    /// failure isolation (spec supplement "batch-discovery per-address-
    /// failure-isolation"): one address's error never aborts the batch.
    pub async fn batch_discover(
        self: &Arc<Self>,
        addresses: Vec<String>,
        chain: &str,
        include_zero_balance: bool,
        min_value_usd: f64,
    ) -> HashMap<String, Vec<DiscoveredToken>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut handles = Vec::with_capacity(addresses.len());

        for address in addresses {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let chain = chain.to_string();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let tokens = engine
                    .discover_wallet_tokens(&address, &chain, Some(include_zero_balance), Some(min_value_usd), true, false)
                    .await;
                (address, tokens)
            }));
        }

        let mut results = HashMap::new();
        for handle in handles {
            match handle.await {
                Ok((address, tokens)) => {
                    results.insert(address, tokens);
                }
                Err(e) => warn!(error = %e, "batch discovery task panicked"),
            }
        }
        results
    }
}

fn is_spam_token(token: &DiscoveredToken) -> bool {
    let symbol = token.symbol.to_uppercase();
    let name = token.name.to_lowercase();

    if SPAM_SYMBOLS.contains(&symbol.as_str()) {
        return true;
    }
    if SUSPICIOUS_NAME_PATTERNS.iter().any(|p| name.contains(p)) {
        return true;
    }
    if symbol.len() > 20 || symbol.starts_with("TEST") || symbol.ends_with("TEST") {
        return true;
    }
    if symbol.is_empty() || symbol == "UNKNOWN" {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn token(symbol: &str, name: &str, balance: i64) -> DiscoveredToken {
        DiscoveredToken {
            symbol: symbol.to_string(),
            name: name.to_string(),
            contract: None,
            balance: Decimal::new(balance, 0),
            decimals: 18,
            is_native: true,
            price_usd: None,
            value_usd: None,
        }
    }

    #[test]
    fn spam_symbol_is_filtered() {
        assert!(is_spam_token(&token("SCAM", "Scam Coin", 1)));
    }

    #[test]
    fn suspicious_name_is_filtered() {
        assert!(is_spam_token(&token("XYZ", "claim your airdrop now", 1)));
    }

    #[test]
    fn legitimate_token_passes() {
        assert!(!is_spam_token(&token("ETH", "Ethereum", 1)));
    }
}
