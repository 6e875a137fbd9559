//! Token Library (spec §4.5): the predefined per-chain token catalog plus
//! user-added custom tokens, backed by the `tokens` table instead of the
//! flat JSON file `token_library_service.py` uses — persistence differs,
//! but the predefined-seed-plus-custom-overlay shape and the
//! prefix-then-substring suggestion order are carried over unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::database::models::{NewToken, Token};
use crate::database::repository::Repository;
use crate::price::ExternalIdLookup;

#[derive(Debug, Error)]
pub enum TokenLibraryError {
    #[error("token already exists: {symbol} on chain {chain_id}")]
    AlreadyExists { symbol: String, chain_id: i64 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A single catalog entry, independent of any particular chain's numeric
/// database id (spec's seed data is keyed by chain *name*, resolved to an
/// id at startup once the chain rows exist).
pub struct PredefinedEntry {
    pub chain_name: &'static str,
    pub symbol: &'static str,
    pub name: &'static str,
    pub contract: Option<&'static str>,
    pub decimals: i32,
    pub external_price_id: Option<&'static str>,
}

/// Mirrors `PREDEFINED_TOKENS`: native assets and well-known stables per
/// chain, seeded idempotently at startup.
pub fn seed_catalog() -> Vec<PredefinedEntry> {
    vec![
        PredefinedEntry { chain_name: "ethereum", symbol: "ETH", name: "Ethereum", contract: None, decimals: 18, external_price_id: Some("ethereum") },
        PredefinedEntry { chain_name: "arbitrum", symbol: "ETH", name: "Ethereum", contract: None, decimals: 18, external_price_id: Some("ethereum") },
        PredefinedEntry { chain_name: "arbitrum", symbol: "USDC", name: "USD Coin", contract: Some("0xaf88d065e77c8cC2239327C5EDb3A432268e5831"), decimals: 6, external_price_id: Some("usd-coin") },
        PredefinedEntry { chain_name: "arbitrum", symbol: "USDT", name: "Tether USD", contract: Some("0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9"), decimals: 6, external_price_id: Some("tether") },
        PredefinedEntry { chain_name: "base", symbol: "ETH", name: "Ethereum", contract: None, decimals: 18, external_price_id: Some("ethereum") },
        PredefinedEntry { chain_name: "polygon", symbol: "MATIC", name: "Polygon", contract: None, decimals: 18, external_price_id: Some("matic-network") },
        PredefinedEntry { chain_name: "bsc", symbol: "BNB", name: "BNB", contract: None, decimals: 18, external_price_id: Some("binancecoin") },
        PredefinedEntry { chain_name: "solana", symbol: "SOL", name: "Solana", contract: None, decimals: 9, external_price_id: Some("solana") },
        PredefinedEntry { chain_name: "sui", symbol: "SUI", name: "Sui", contract: None, decimals: 9, external_price_id: Some("sui") },
        PredefinedEntry { chain_name: "bitcoin", symbol: "BTC", name: "Bitcoin", contract: None, decimals: 8, external_price_id: Some("bitcoin") },
    ]
}

pub struct TokenLibrary {
    repository: Arc<Repository>,
}

impl TokenLibrary {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository }
    }

    /// Idempotent startup upsert of the predefined catalog, run once per
    /// chain as that chain's row becomes available (spec §4.5 "startup
    /// seeding").
    pub async fn seed_predefined(&self, chain_name: &str, chain_id: i64) -> anyhow::Result<()> {
        for entry in seed_catalog().into_iter().filter(|e| e.chain_name == chain_name) {
            self.repository
                .upsert_predefined_token(&NewToken {
                    symbol: entry.symbol.to_string(),
                    name: entry.name.to_string(),
                    chain_id,
                    contract: entry.contract.map(String::from),
                    decimals: entry.decimals,
                    external_price_id: entry.external_price_id.map(String::from),
                    is_predefined: true,
                })
                .await?;
        }
        info!(chain_name, "seeded predefined token catalog");
        Ok(())
    }

    pub async fn find(&self, symbol: &str, chain_id: i64) -> anyhow::Result<Option<Token>> {
        Ok(self.repository.find_token(symbol, chain_id).await?)
    }

    pub async fn find_by_contract(&self, chain_id: i64, contract: &str) -> anyhow::Result<Option<Token>> {
        Ok(self.repository.find_token_by_contract(chain_id, contract).await?)
    }

    /// Every predefined token on a chain, looked up by chain name rather
    /// than id (spec §4.6 step 3 "Probe every predefined token").
    pub async fn predefined_for_chain(&self, chain_name: &str) -> anyhow::Result<Vec<Token>> {
        let Some(chain) = self.repository.find_chain_by_name(chain_name).await? else {
            return Ok(Vec::new());
        };
        Ok(self.repository.find_predefined_tokens(chain.id).await?)
    }

    /// Adds a custom token, rejecting one already active for the same
    /// `(symbol, chain)` and reactivating a soft-deleted match instead of
    /// inserting a duplicate (spec §4.5 "Custom tokens": validate,
    /// reactivate-if-inactive, insert, race-safe reread on conflict).
    pub async fn add_custom(
        &self,
        symbol: &str,
        name: &str,
        chain_id: i64,
        contract: Option<String>,
        decimals: i32,
        external_price_id: Option<String>,
    ) -> Result<Token, TokenLibraryError> {
        if let Some(existing) = self.repository.find_token(symbol, chain_id).await? {
            if existing.is_active {
                return Err(TokenLibraryError::AlreadyExists {
                    symbol: symbol.to_string(),
                    chain_id,
                });
            }
        }

        let token = self
            .repository
            .add_custom_token(&NewToken {
                symbol: symbol.to_string(),
                name: name.to_string(),
                chain_id,
                contract,
                decimals,
                external_price_id,
                is_predefined: false,
            })
            .await?;

        info!(symbol, chain_id, "added custom token");
        Ok(token)
    }

    /// Prefix-match on symbol first, then substring-match on name, capped
    /// at `limit` (spec §4.5 "Search").
    pub async fn search(&self, query: &str, limit: i64) -> anyhow::Result<Vec<Token>> {
        Ok(self.repository.search_tokens(query, limit).await?)
    }
}

#[async_trait]
impl ExternalIdLookup for TokenLibrary {
    async fn external_price_id(&self, symbol: &str, chain: &str) -> Option<String> {
        let chain_row = self.repository.find_chain_by_name(chain).await.ok().flatten()?;
        match self.repository.find_token(symbol, chain_row.id).await {
            Ok(Some(token)) => token.external_price_id,
            Ok(None) => None,
            Err(e) => {
                warn!(symbol, chain, error = %e, "token library lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_catalog_has_one_native_entry_per_chain_with_no_contract() {
        let eth_entries: Vec<_> = seed_catalog().into_iter().filter(|e| e.chain_name == "ethereum").collect();
        assert_eq!(eth_entries.len(), 1);
        assert!(eth_entries[0].contract.is_none());
    }
}
