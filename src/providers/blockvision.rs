//! BlockVision Sui provider: the only provider that returns complete Sui coin
//! types (spec §4.3 "Chain-specific routing" — always tried first for Sui).

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;

use crate::chain::DiscoveredToken;

use super::{DataProvider, ProviderError, ProviderHealth, ProviderKind, ProviderPriority, ProviderType};

pub struct BlockVisionSuiProvider {
    priority: ProviderPriority,
    api_key: Option<String>,
    http: reqwest::Client,
    supported_chains: Vec<String>,
    health: ProviderHealth,
}

impl BlockVisionSuiProvider {
    pub fn new(priority: ProviderPriority, api_key: Option<String>) -> Self {
        Self {
            priority,
            api_key,
            http: reqwest::Client::new(),
            supported_chains: vec!["sui".to_string()],
            health: ProviderHealth::new(5),
        }
    }
}

#[async_trait]
impl DataProvider for BlockVisionSuiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BlockVisionSui
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::ChainSpecific
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
        Duration::from_millis(300)
    }

    fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    async fn get_wallet_assets(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<Vec<DiscoveredToken>, ProviderError> {
        if chain != "sui" {
            return Err(ProviderError::ChainNotSupported(chain.to_string()));
        }
        let Some(api_key) = &self.api_key else {
            return Ok(Vec::new());
        };

        let url = format!(
            "https://api.blockvision.org/v2/sui/account/coins?account={}",
            address
        );

        let response = self
            .http
            .get(&url)
            .header("x-api-key", api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Schema(e.to_string()))?;

        let coins = body
            .pointer("/result/coins")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for coin in coins {
            let coin_type = coin.get("coinType").and_then(Value::as_str).unwrap_or_default();
            let decimals = coin.get("decimals").and_then(Value::as_u64).unwrap_or(9) as u8;
            let raw: f64 = coin
                .get("balance")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let balance =
                Decimal::from_f64(raw / 10f64.powi(decimals as i32)).unwrap_or(Decimal::ZERO);
            let is_native = coin_type.ends_with("::sui::SUI");

            out.push(DiscoveredToken {
                symbol: coin.get("symbol").and_then(Value::as_str).unwrap_or("SUI").to_string(),
                name: coin.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                contract: if is_native { None } else { Some(coin_type.to_string()) },
                balance,
                decimals,
                is_native,
                price_usd: coin.get("price").and_then(Value::as_f64),
                value_usd: None,
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
        // BlockVision's coin endpoint is account-scoped; it has no
        // standalone symbol->price lookup, so this always defers to the
        // Price Engine rather than the aggregator.
        Ok(None)
    }
}
