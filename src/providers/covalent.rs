//! Covalent: balances only, no price data (grounded on
//! `data_aggregator.py::CovalentProvider`).

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;

use crate::chain::DiscoveredToken;

use super::{
    default_evm_chains, DataProvider, ProviderError, ProviderHealth, ProviderKind,
    ProviderPriority, ProviderType,
};

pub struct CovalentProvider {
    priority: ProviderPriority,
    api_key: Option<String>,
    http: reqwest::Client,
    chain_slugs: Vec<(String, String)>,
    supported_chains: Vec<String>,
    health: ProviderHealth,
}

impl CovalentProvider {
    pub fn new(priority: ProviderPriority, api_key: Option<String>) -> Self {
        let chain_slugs = vec![
            ("ethereum".to_string(), "eth-mainnet".to_string()),
            ("polygon".to_string(), "matic-mainnet".to_string()),
            ("bsc".to_string(), "bsc-mainnet".to_string()),
            ("arbitrum".to_string(), "arbitrum-mainnet".to_string()),
            ("base".to_string(), "base-mainnet".to_string()),
            ("optimism".to_string(), "optimism-mainnet".to_string()),
            ("avalanche".to_string(), "avalanche-mainnet".to_string()),
        ];
        Self {
            priority,
            api_key,
            http: reqwest::Client::new(),
            supported_chains: chain_slugs.iter().map(|(c, _)| c.clone()).collect(),
            chain_slugs,
            health: ProviderHealth::new(5),
        }
    }

    fn slug_for(&self, chain: &str) -> Option<&str> {
        self.chain_slugs
            .iter()
            .find(|(name, _)| name == chain)
            .map(|(_, slug)| slug.as_str())
    }
}

#[async_trait]
impl DataProvider for CovalentProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Covalent
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::MultiChain
    }

    fn priority(&self) -> ProviderPriority {
        self.priority
    }

    fn supported_chains(&self) -> &[String] {
        &self.supported_chains
    }

    fn health(&self) -> &ProviderHealth {
        &self.health
    }

    fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(200)
    }

    fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    async fn get_wallet_assets(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<Vec<DiscoveredToken>, ProviderError> {
        let Some(api_key) = &self.api_key else {
            return Ok(Vec::new());
        };
        let Some(slug) = self.slug_for(chain) else {
            return Err(ProviderError::ChainNotSupported(chain.to_string()));
        };

        let url = format!(
            "https://api.covalenthq.com/v1/{}/address/{}/balances_v2/",
            slug, address
        );

        let response = self
            .http
            .get(&url)
            .basic_auth(api_key, Some(""))
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Schema(e.to_string()))?;

        let items = body
            .pointer("/data/items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for item in items {
            let contract_address = item
                .get("contract_address")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let is_native = contract_address.is_empty();
            let decimals = item.get("contract_decimals").and_then(Value::as_u64).unwrap_or(18) as u8;
            let raw_balance: f64 = item
                .get("balance")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let balance = Decimal::from_f64(raw_balance / 10f64.powi(decimals as i32))
                .unwrap_or(Decimal::ZERO);

            out.push(DiscoveredToken {
                symbol: item
                    .get("contract_ticker_symbol")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_string(),
                name: item
                    .get("contract_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                contract: if is_native {
                    None
                } else {
                    Some(contract_address.to_string())
                },
                balance,
                decimals,
                is_native,
                price_usd: item.get("quote_rate").and_then(Value::as_f64),
                value_usd: item.get("quote").and_then(Value::as_f64),
            });
        }

        Ok(out)
    }

    async fn get_token_balance(
        &self,
        address: &str,
        chain: &str,
        contract: Option<&str>,
    ) -> Result<Decimal, ProviderError> {
        let assets = self.get_wallet_assets(address, chain).await?;
        Ok(assets
            .into_iter()
            .find(|a| a.contract.as_deref() == contract)
            .map(|a| a.balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_token_price(&self, _symbol: &str, _chain: &str) -> Result<Option<f64>, ProviderError> {
        // Covalent only returns balances, never prices (spec §4.3 "Tie-breaks":
        // nil price is treated as failure so the aggregator moves on).
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_chain_rejected() {
        let provider = CovalentProvider::new(ProviderPriority::Primary, None);
        assert!(!provider.supports_chain("bitcoin"));
        assert!(provider.supports_chain("ethereum"));
    }

    #[test]
    fn chains_list_matches_default_set() {
        let provider = CovalentProvider::new(ProviderPriority::Primary, None);
        assert_eq!(provider.supported_chains().len(), default_evm_chains().len());
    }
}
