//! Sui chain driver: `suix_*` JSON-RPC, enumerates all coin types.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::{json, Value};
use tracing::instrument;

use super::{
    CallOutcome, ChainDriver, ChainDriverError, ChainFamily, DiscoveredToken, EndpointFailover,
    RetryPolicy, TransactionTimeInfo,
};

const SUI_NATIVE_COIN_TYPE: &str = "0x2::sui::SUI";

pub struct SuiDriver {
    chain_name: String,
    http: reqwest::Client,
    endpoints: EndpointFailover,
}

impl SuiDriver {
    pub fn new(chain_name: impl Into<String>, rpc_endpoints: Vec<String>, policy: RetryPolicy) -> Self {
        Self {
            chain_name: chain_name.into(),
            http: reqwest::Client::new(),
            endpoints: EndpointFailover::new(rpc_endpoints, policy),
        }
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, ChainDriverError> {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });

        self.endpoints
            .run(&self.chain_name, |endpoint| {
                let http = self.http.clone();
                let body = body.clone();
                async move {
                    let response = match http.post(&endpoint).json(&body).send().await {
                        Ok(r) => r,
                        Err(e) => return CallOutcome::Transient(e.to_string()),
                    };
                    if response.status().as_u16() == 429 {
                        return CallOutcome::RateLimited;
                    }
                    match response.json::<Value>().await {
                        Ok(v) if v.get("error").is_some() => {
                            CallOutcome::Transient(v["error"].to_string())
                        }
                        Ok(v) => CallOutcome::Success(v),
                        Err(e) => CallOutcome::Transient(e.to_string()),
                    }
                }
            })
            .await
    }

    fn mist_to_sui(mist: u64) -> Decimal {
        Decimal::from(mist) / Decimal::from(1_000_000_000u64)
    }
}

#[async_trait]
impl ChainDriver for SuiDriver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Sui
    }

    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    #[instrument(skip(self))]
    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainDriverError> {
        let address = self.validate_address(address)?;
        let result = self
            .rpc_call("suix_getBalance", json!([address, SUI_NATIVE_COIN_TYPE]))
            .await?;

        let total: u64 = result
            .get("result")
            .and_then(|r| r.get("totalBalance"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Self::mist_to_sui(total))
    }

    #[instrument(skip(self))]
    async fn token_balance(
        &self,
        address: &str,
        contract: &str,
    ) -> Result<Decimal, ChainDriverError> {
        let address = self.validate_address(address)?;
        let result = self
            .rpc_call("suix_getBalance", json!([address, contract]))
            .await?;

        let total: u64 = result
            .get("result")
            .and_then(|r| r.get("totalBalance"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Decimal::from_u64_scaled(total))
    }

    #[instrument(skip(self, address))]
    async fn enumerate_tokens(
        &self,
        address: &str,
        include_zero: bool,
    ) -> Result<Vec<DiscoveredToken>, ChainDriverError> {
        let address = self.validate_address(address)?;
        let result = self.rpc_call("suix_getAllBalances", json!([address])).await?;

        let balances = result
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut discovered = Vec::new();
        for entry in balances {
            let coin_type = entry
                .get("coinType")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let total: u64 = entry
                .get("totalBalance")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            let is_native = coin_type == SUI_NATIVE_COIN_TYPE;
            let balance = if is_native {
                Self::mist_to_sui(total)
            } else {
                Decimal::from_u64_scaled(total)
            };

            if balance.is_zero() && !include_zero {
                continue;
            }

            let symbol = coin_type.rsplit("::").next().unwrap_or(coin_type).to_string();
            discovered.push(DiscoveredToken {
                symbol: symbol.clone(),
                name: symbol,
                contract: if is_native { None } else { Some(coin_type.to_string()) },
                balance,
                decimals: if is_native { 9 } else { 0 },
                is_native,
                price_usd: None,
                value_usd: None,
            });
        }
        Ok(discovered)
    }

    #[instrument(skip(self))]
    async fn first_transaction_time(
        &self,
        _address: &str,
    ) -> Result<TransactionTimeInfo, ChainDriverError> {
        Ok(TransactionTimeInfo {
            timestamp: None,
            tx_hash: None,
            block_number: None,
            is_estimated: true,
        })
    }
}

trait FromU64Scaled {
    fn from_u64_scaled(raw: u64) -> Self;
}

impl FromU64Scaled for Decimal {
    /// Non-native Sui coin balances are returned as raw integers; without a
    /// per-coin decimals lookup this conservatively treats them as already
    /// human-scaled rather than guessing a decimals count.
    fn from_u64_scaled(raw: u64) -> Self {
        Decimal::from_f64(raw as f64).unwrap_or(Decimal::ZERO)
    }
}
