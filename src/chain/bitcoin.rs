//! Bitcoin chain driver: REST (blockstream-style) API, returns only BTC.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::instrument;

use super::{
    CallOutcome, ChainDriver, ChainDriverError, ChainFamily, DiscoveredToken, EndpointFailover,
    RetryPolicy, TransactionTimeInfo,
};

const SATOSHIS_PER_BTC: u64 = 100_000_000;

pub struct BitcoinDriver {
    chain_name: String,
    http: reqwest::Client,
    endpoints: EndpointFailover,
}

impl BitcoinDriver {
    pub fn new(chain_name: impl Into<String>, rest_endpoints: Vec<String>, policy: RetryPolicy) -> Self {
        Self {
            chain_name: chain_name.into(),
            http: reqwest::Client::new(),
            endpoints: EndpointFailover::new(rest_endpoints, policy),
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, ChainDriverError> {
        self.endpoints
            .run(&self.chain_name, |base| {
                let http = self.http.clone();
                let url = format!("{}{}", base, path);
                async move {
                    let response = match http.get(&url).send().await {
                        Ok(r) => r,
                        Err(e) => return CallOutcome::Transient(e.to_string()),
                    };
                    if response.status().as_u16() == 429 {
                        return CallOutcome::RateLimited;
                    }
                    if !response.status().is_success() {
                        return CallOutcome::Transient(format!("http {}", response.status()));
                    }
                    match response.json::<Value>().await {
                        Ok(v) => CallOutcome::Success(v),
                        Err(e) => CallOutcome::Transient(e.to_string()),
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl ChainDriver for BitcoinDriver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Bitcoin
    }

    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    #[instrument(skip(self))]
    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainDriverError> {
        let address = self.validate_address(address)?;
        let stats = self.get_json(&format!("/address/{}", address)).await?;

        let funded = stats
            .pointer("/chain_stats/funded_txo_sum")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let spent = stats
            .pointer("/chain_stats/spent_txo_sum")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let sats = funded.saturating_sub(spent);
        Ok(Decimal::from(sats) / Decimal::from(SATOSHIS_PER_BTC))
    }

    async fn token_balance(
        &self,
        _address: &str,
        _contract: &str,
    ) -> Result<Decimal, ChainDriverError> {
        // No account-model tokens on Bitcoin; unknown contract -> 0.
        Ok(Decimal::ZERO)
    }

    async fn enumerate_tokens(
        &self,
        address: &str,
        include_zero: bool,
    ) -> Result<Vec<DiscoveredToken>, ChainDriverError> {
        let balance = self.native_balance(address).await?;
        if balance.is_zero() && !include_zero {
            return Ok(Vec::new());
        }
        Ok(vec![DiscoveredToken {
            symbol: "BTC".to_string(),
            name: "Bitcoin".to_string(),
            contract: None,
            balance,
            decimals: 8,
            is_native: true,
            price_usd: None,
            value_usd: None,
        }])
    }

    #[instrument(skip(self))]
    async fn first_transaction_time(
        &self,
        address: &str,
    ) -> Result<TransactionTimeInfo, ChainDriverError> {
        let address = self.validate_address(address)?;
        let txs = self
            .get_json(&format!("/address/{}/txs/chain", address))
            .await?;

        let oldest = txs.as_array().and_then(|arr| arr.last());
        match oldest {
            Some(tx) => Ok(TransactionTimeInfo {
                timestamp: tx.pointer("/status/block_time").and_then(Value::as_i64),
                tx_hash: tx.get("txid").and_then(Value::as_str).map(String::from),
                block_number: tx.pointer("/status/block_height").and_then(Value::as_i64),
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
