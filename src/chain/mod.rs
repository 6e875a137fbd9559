//! Chain Drivers (spec §4.1): per-chain-family adapters exposing a uniform
//! capability set over an opaque RPC dialect.

pub mod bitcoin;
pub mod evm;
pub mod solana;
pub mod sui;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use bitcoin::BitcoinDriver;
pub use evm::EvmDriver;
pub use solana::SolanaDriver;
pub use sui::SuiDriver;

#[derive(Debug, Error, Clone)]
pub enum ChainDriverError {
    #[error("invalid address for chain family {family:?}: {address}")]
    InvalidAddress { family: ChainFamily, address: String },
    #[error("all endpoints exhausted for chain {chain}")]
    EndpointsExhausted { chain: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainFamily {
    Evm,
    Solana,
    Sui,
    Bitcoin,
}

/// A discovered token as produced by chain drivers / providers, before it is
/// priced or persisted. Mirrors spec §3's `DiscoveredToken` entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredToken {
    pub symbol: String,
    pub name: String,
    pub contract: Option<String>,
    pub balance: Decimal,
    pub decimals: u8,
    pub is_native: bool,
    pub price_usd: Option<f64>,
    pub value_usd: Option<f64>,
}

impl DiscoveredToken {
    pub fn dedup_key(&self) -> String {
        match &self.contract {
            Some(contract) => format!("contract:{}", contract.to_lowercase()),
            None => format!("native:{}", self.symbol.to_uppercase()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionTimeInfo {
    pub timestamp: Option<i64>,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub is_estimated: bool,
}

/// Uniform per-chain capability set (spec §4.1).
#[async_trait]
pub trait ChainDriver: Send + Sync {
    fn family(&self) -> ChainFamily;
    fn chain_name(&self) -> &str;

    fn validate_address(&self, address: &str) -> Result<String, ChainDriverError> {
        validate_address(self.family(), address)
    }

    async fn native_balance(&self, address: &str) -> Result<Decimal, ChainDriverError>;
    async fn token_balance(
        &self,
        address: &str,
        contract: &str,
    ) -> Result<Decimal, ChainDriverError>;
    async fn enumerate_tokens(
        &self,
        address: &str,
        include_zero: bool,
    ) -> Result<Vec<DiscoveredToken>, ChainDriverError>;
    async fn first_transaction_time(
        &self,
        address: &str,
    ) -> Result<TransactionTimeInfo, ChainDriverError>;
}

/// Per-chain-family address validation (spec §4.1 "Address validation").
/// Runs before any network I/O; invalid addresses fail fast.
pub fn validate_address(family: ChainFamily, address: &str) -> Result<String, ChainDriverError> {
    let ok = match family {
        ChainFamily::Evm => {
            address.len() == 42
                && address.starts_with("0x")
                && address[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        ChainFamily::Solana => {
            let len = address.len();
            (32..=44).contains(&len) && address.chars().all(is_base58_char)
        }
        ChainFamily::Sui => {
            address.len() == 66
                && address.starts_with("0x")
                && address[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        ChainFamily::Bitcoin => {
            let len = address.len();
            ((address.starts_with('1') || address.starts_with('3')) && (25..=34).contains(&len))
                || (address.starts_with("bc1") && len >= 39)
        }
    };

    if !ok {
        return Err(ChainDriverError::InvalidAddress {
            family,
            address: address.to_string(),
        });
    }

    Ok(match family {
        ChainFamily::Evm | ChainFamily::Sui => address.to_lowercase(),
        ChainFamily::Solana | ChainFamily::Bitcoin => address.to_string(),
    })
}

fn is_base58_char(c: char) -> bool {
    const ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    ALPHABET.contains(c)
}

/// Retry/back-off parameters shared by every endpoint in a failover list.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Signals an RPC/HTTP call's outcome for the purpose of endpoint failover
/// (spec §4.1 "Endpoint failover").
pub enum CallOutcome<T> {
    Success(T),
    RateLimited,
    Transient(String),
}

/// Strictly-ordered endpoint list with per-endpoint retry + back-off before
/// advancing to the next endpoint (spec §4.1, §5 ordering guarantees).
pub struct EndpointFailover {
    endpoints: Vec<String>,
    policy: RetryPolicy,
    active: Mutex<usize>,
}

impl EndpointFailover {
    pub fn new(endpoints: Vec<String>, policy: RetryPolicy) -> Self {
        Self {
            endpoints,
            policy,
            active: Mutex::new(0),
        }
    }

    pub async fn active_endpoint(&self) -> String {
        let idx = *self.active.lock().await;
        self.endpoints[idx.min(self.endpoints.len() - 1)].clone()
    }

    /// Runs `call` against each endpoint in order, retrying within an
    /// endpoint per the policy before moving on. `call` receives the
    /// endpoint URL and decides the outcome.
    pub async fn run<T, F, Fut>(&self, chain_name: &str, mut call: F) -> Result<T, ChainDriverError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = CallOutcome<T>>,
    {
        for (idx, endpoint) in self.endpoints.iter().enumerate() {
            for attempt in 0..self.policy.max_retries {
                match call(endpoint.clone()).await {
                    CallOutcome::Success(value) => {
                        *self.active.lock().await = idx;
                        return Ok(value);
                    }
                    CallOutcome::RateLimited => {
                        let wait = self.policy.base_delay * 2u32.pow(attempt)
                            + Duration::from_secs(30);
                        warn!(chain = chain_name, endpoint = %endpoint, attempt, ?wait, "rate limited, backing off");
                        tokio::time::sleep(wait).await;
                    }
                    CallOutcome::Transient(msg) => {
                        debug!(chain = chain_name, endpoint = %endpoint, attempt, error = %msg, "transient failure");
                        if attempt + 1 < self.policy.max_retries {
                            tokio::time::sleep(self.policy.base_delay * 2u32.pow(attempt)).await;
                        }
                    }
                }
            }
        }

        Err(ChainDriverError::EndpointsExhausted {
            chain: chain_name.to_string(),
        })
    }
}

/// Lazy, idempotent, double-checked per-chain connection slot (spec §4.1
/// "Initialization", §9 redesign flag replacing `ensure_initialized`).
pub struct Initialized<T> {
    inner: Arc<Mutex<Option<Arc<T>>>>,
}

impl<T> Default for Initialized<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> Initialized<T> {
    pub async fn get_or_init<F, Fut, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        {
            let guard = self.inner.lock().await;
            if let Some(existing) = guard.as_ref() {
                return Ok(existing.clone());
            }
        }

        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }
        let value = Arc::new(init().await?);
        *guard = Some(value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evm_address_validation() {
        assert!(validate_address(ChainFamily::Evm, "0xabc").is_err());
        let addr = "0x".to_string() + &"a".repeat(40);
        assert!(validate_address(ChainFamily::Evm, &addr).is_ok());
    }

    #[test]
    fn bitcoin_address_validation() {
        assert!(validate_address(ChainFamily::Bitcoin, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").is_ok());
        assert!(validate_address(ChainFamily::Bitcoin, "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq").is_ok());
        assert!(validate_address(ChainFamily::Bitcoin, "not-an-address").is_err());
    }

    #[test]
    fn dedup_key_prefers_contract() {
        let t = DiscoveredToken {
            symbol: "USDC".into(),
            name: "USD Coin".into(),
            contract: Some("0xABC".into()),
            balance: Decimal::ONE,
            decimals: 6,
            is_native: false,
            price_usd: None,
            value_usd: None,
        };
        assert_eq!(t.dedup_key(), "contract:0xabc");
    }

    #[tokio::test]
    async fn endpoint_failover_advances_after_retries() {
        let failover = EndpointFailover::new(
            vec!["a".to_string(), "b".to_string()],
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            },
        );

        let attempts_on_a = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&attempts_on_a);
        let result: Result<i32, ChainDriverError> = failover
            .run("test", |endpoint| {
                let counter = Arc::clone(&counter);
                async move {
                    if endpoint == "b" {
                        CallOutcome::Success(42)
                    } else {
                        *counter.lock().await += 1;
                        CallOutcome::Transient("boom".into())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(failover.active_endpoint().await, "b");
        assert_eq!(*attempts_on_a.lock().await, 2, "max_retries=2 must mean exactly 2 attempts against endpoint a");
    }
}
