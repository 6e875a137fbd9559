//! EVM-family chain driver: raw JSON-RPC over `reqwest`, no signing.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::{json, Value};
use tracing::instrument;

use super::{
    CallOutcome, ChainDriver, ChainDriverError, ChainFamily, DiscoveredToken, EndpointFailover,
    RetryPolicy, TransactionTimeInfo,
};

/// A curated common-token entry probed by `enumerate_tokens` (spec §4.1:
/// "EVM drivers enumerate a curated common-token list").
#[derive(Debug, Clone)]
pub struct CommonToken {
    pub symbol: String,
    pub contract: String,
    pub decimals: u8,
}

pub struct EvmDriver {
    chain_name: String,
    http: reqwest::Client,
    endpoints: EndpointFailover,
    explorer_api_url: Option<String>,
    explorer_api_key: Option<String>,
    common_tokens: Vec<CommonToken>,
}

impl EvmDriver {
    pub fn new(
        chain_name: impl Into<String>,
        rpc_endpoints: Vec<String>,
        explorer_api_url: Option<String>,
        explorer_api_key: Option<String>,
        common_tokens: Vec<CommonToken>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            chain_name: chain_name.into(),
            http: reqwest::Client::new(),
            endpoints: EndpointFailover::new(rpc_endpoints, policy),
            explorer_api_url,
            explorer_api_key,
            common_tokens,
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
                        Err(e) if e.is_timeout() || e.is_connect() => {
                            return CallOutcome::Transient(e.to_string())
                        }
                        Err(e) => return CallOutcome::Transient(e.to_string()),
                    };

                    if response.status().as_u16() == 429 {
                        return CallOutcome::RateLimited;
                    }

                    let parsed: Value = match response.json().await {
                        Ok(v) => v,
                        Err(e) => return CallOutcome::Transient(e.to_string()),
                    };

                    if let Some(error) = parsed.get("error") {
                        if error.get("code").and_then(Value::as_i64) == Some(429) {
                            return CallOutcome::RateLimited;
                        }
                        return CallOutcome::Transient(error.to_string());
                    }

                    CallOutcome::Success(parsed)
                }
            })
            .await
    }

    fn decode_hex_u256(hex: &str) -> Decimal {
        let trimmed = hex.trim_start_matches("0x");
        u128::from_str_radix(trimmed, 16)
            .ok()
            .and_then(Decimal::from_u128)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl ChainDriver for EvmDriver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    #[instrument(skip(self))]
    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainDriverError> {
        let address = self.validate_address(address)?;
        let result = self
            .rpc_call("eth_getBalance", json!([address, "latest"]))
            .await?;

        let hex = result
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainDriverError::Rpc("missing result".into()))?;

        let wei = Self::decode_hex_u256(hex);
        Ok(wei / Decimal::from(1_000_000_000_000_000_000u64))
    }

    #[instrument(skip(self))]
    async fn token_balance(
        &self,
        address: &str,
        contract: &str,
    ) -> Result<Decimal, ChainDriverError> {
        let address = self.validate_address(address)?;
        // balanceOf(address) selector + left-padded address.
        let data = format!("0x70a08231000000000000000000000000{}", &address[2..]);

        let result = self
            .rpc_call(
                "eth_call",
                json!([{ "to": contract, "data": data }, "latest"]),
            )
            .await;

        let result = match result {
            Ok(v) => v,
            Err(_) => return Ok(Decimal::ZERO),
        };

        let hex = match result.get("result").and_then(Value::as_str) {
            Some(h) if h.len() > 2 => h,
            _ => return Ok(Decimal::ZERO),
        };

        Ok(Self::decode_hex_u256(hex))
    }

    #[instrument(skip(self, address))]
    async fn enumerate_tokens(
        &self,
        address: &str,
        include_zero: bool,
    ) -> Result<Vec<DiscoveredToken>, ChainDriverError> {
        let mut discovered = Vec::new();
        for token in &self.common_tokens {
            let balance = self.token_balance(address, &token.contract).await?;
            if balance.is_zero() && !include_zero {
                continue;
            }
            discovered.push(DiscoveredToken {
                symbol: token.symbol.clone(),
                name: token.symbol.clone(),
                contract: Some(token.contract.clone()),
                balance,
                decimals: token.decimals,
                is_native: false,
                price_usd: None,
                value_usd: None,
            });
        }
        Ok(discovered)
    }

    #[instrument(skip(self))]
    async fn first_transaction_time(
        &self,
        address: &str,
    ) -> Result<TransactionTimeInfo, ChainDriverError> {
        let address = self.validate_address(address)?;
        let (Some(url), key) = (self.explorer_api_url.as_ref(), self.explorer_api_key.as_deref())
        else {
            return Ok(TransactionTimeInfo {
                timestamp: None,
                tx_hash: None,
                block_number: None,
                is_estimated: true,
            });
        };

        let mut full_url = format!(
            "{}?module=account&action=txlist&address={}&sort=asc&page=1&offset=1",
            url, address
        );
        if let Some(key) = key {
            full_url.push_str(&format!("&apikey={}", key));
        }

        let response = match self.http.get(&full_url).send().await {
            Ok(r) => r,
            Err(_) => {
                return Ok(TransactionTimeInfo {
                    timestamp: None,
                    tx_hash: None,
                    block_number: None,
                    is_estimated: true,
                })
            }
        };

        let parsed: Value = response.json().await.unwrap_or(Value::Null);
        let first_tx = parsed
            .get("result")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first());

        match first_tx {
            Some(tx) => Ok(TransactionTimeInfo {
                timestamp: tx
                    .get("timeStamp")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok()),
                tx_hash: tx.get("hash").and_then(Value::as_str).map(String::from),
                block_number: tx
                    .get("blockNumber")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok()),
                is_estimated: false,
            }),
            None => Ok(TransactionTimeInfo {
                timestamp: None,
                tx_hash: None,
                block_number: None,
                is_estimated: true,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_u256_handles_zero() {
        assert_eq!(EvmDriver::decode_hex_u256("0x0"), Decimal::ZERO);
    }

    #[test]
    fn decode_hex_u256_parses_value() {
        assert_eq!(EvmDriver::decode_hex_u256("0xff"), Decimal::from(255));
    }
}
