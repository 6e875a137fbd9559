//! Solana chain driver: JSON-RPC `getBalance` / `getTokenAccountsByOwner`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::{json, Value};
use tracing::instrument;

use super::{
    CallOutcome, ChainDriver, ChainDriverError, ChainFamily, DiscoveredToken, EndpointFailover,
    RetryPolicy, TransactionTimeInfo,
};

const LAMPORTS_PER_SOL: u64 = 1_000_000_000;
const SPL_TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

pub struct SolanaDriver {
    chain_name: String,
    http: reqwest::Client,
    endpoints: EndpointFailover,
}

impl SolanaDriver {
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
}

#[async_trait]
impl ChainDriver for SolanaDriver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Solana
    }

    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    #[instrument(skip(self))]
    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainDriverError> {
        let address = self.validate_address(address)?;
        let result = self.rpc_call("getBalance", json!([address])).await?;
        let lamports = result
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(Decimal::from(lamports) / Decimal::from(LAMPORTS_PER_SOL))
    }

    #[instrument(skip(self))]
    async fn token_balance(
        &self,
        address: &str,
        contract: &str,
    ) -> Result<Decimal, ChainDriverError> {
        let address = self.validate_address(address)?;
        let result = self
            .rpc_call(
                "getTokenAccountsByOwner",
                json!([
                    address,
                    { "mint": contract },
                    { "encoding": "jsonParsed" }
                ]),
            )
            .await?;

        let accounts = result
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut total = Decimal::ZERO;
        for account in accounts {
            if let Some(amount) = account
                .pointer("/account/data/parsed/info/tokenAmount/uiAmount")
                .and_then(Value::as_f64)
            {
                total += Decimal::from_f64(amount).unwrap_or(Decimal::ZERO);
            }
        }
        Ok(total)
    }

    #[instrument(skip(self, address))]
    async fn enumerate_tokens(
        &self,
        address: &str,
        include_zero: bool,
    ) -> Result<Vec<DiscoveredToken>, ChainDriverError> {
        let owner = self.validate_address(address)?;
        let result = self
            .rpc_call(
                "getTokenAccountsByOwner",
                json!([
                    owner,
                    { "programId": SPL_TOKEN_PROGRAM_ID },
                    { "encoding": "jsonParsed" }
                ]),
            )
            .await?;

        let accounts = result
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut discovered = Vec::new();
        for account in accounts {
            let info = account.pointer("/account/data/parsed/info");
            let Some(info) = info else { continue };
            let mint = info.get("mint").and_then(Value::as_str).unwrap_or_default();
            let ui_amount = info
                .pointer("/tokenAmount/uiAmount")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let decimals = info
                .pointer("/tokenAmount/decimals")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u8;

            let balance = Decimal::from_f64(ui_amount).unwrap_or(Decimal::ZERO);
            if balance.is_zero() && !include_zero {
                continue;
            }

            discovered.push(DiscoveredToken {
                symbol: mint.chars().take(6).collect(),
                name: mint.to_string(),
                contract: Some(mint.to_string()),
                balance,
                decimals,
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
        _address: &str,
    ) -> Result<TransactionTimeInfo, ChainDriverError> {
        // No explorer API wired for Solana; always estimated.
        Ok(TransactionTimeInfo {
            timestamp: None,
            tx_hash: None,
            block_number: None,
            is_estimated: true,
        })
    }
}
