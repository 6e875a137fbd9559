//! Entities backing the persistent-store contract (spec §6.1) and the Cache
//! Tables component (spec §2 item 9). Field names mirror the logical tables
//! named in §6.1; storage representation (column types) is the only place
//! this diverges from the semantic description, per spec §3's own framing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "chain_family", rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Solana,
    Sui,
    Bitcoin,
}

/// `blockchains` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Chain {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub family: ChainFamily,
    pub rpc_urls: Vec<String>,
    pub explorer_url: Option<String>,
    pub is_testnet: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `tokens` table. Unique per `(symbol, blockchain, contract)` (spec §3 invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Token {
    pub id: Uuid,
    pub symbol: String,
    pub name: String,
    pub chain_id: i64,
    pub contract: Option<String>,
    pub decimals: i32,
    pub external_price_id: Option<String>,
    pub is_predefined: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn is_native(&self) -> bool {
        self.contract.is_none()
    }
}

/// `wallets` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub address: String,
    pub chain_id: i64,
    pub wallet_name: Option<String>,
    pub notes: Option<String>,
    pub creation_timestamp: Option<i64>,
    pub first_transaction_hash: Option<String>,
    pub block_number: Option<i64>,
    pub is_estimated: bool,
    pub created_at: DateTime<Utc>,
}

/// `assets` table. Unique per `(wallet, token)` among active rows (spec §3
/// invariant; soft-deleted via `is_active = false`, never physically deleted
/// while referenced by history).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Asset {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub token_id: Uuid,
    pub tag: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// `price_history` table. Unique per `(token, timestamp)`; timestamp aligned
/// to the hour (spec §3 invariant 2, glossary "Aligned-to-hour").
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PriceHistoryPoint {
    pub token_id: Uuid,
    pub timestamp: i64,
    pub price_usd: Decimal,
    pub source: String,
}

/// `balance_history` table. Unique per `(asset, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BalanceHistoryPoint {
    pub asset_id: Uuid,
    pub timestamp: i64,
    pub balance: Decimal,
}

/// `asset_snapshots` table. Unique per `(asset, timestamp)`; invariant:
/// `value_usd = quantity * price_usd` to float precision (spec §3 invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetSnapshot {
    pub asset_id: Uuid,
    pub timestamp: i64,
    pub quantity: Decimal,
    pub price_usd: Decimal,
    pub value_usd: Decimal,
}

impl AssetSnapshot {
    pub fn new(asset_id: Uuid, timestamp: i64, quantity: Decimal, price_usd: Decimal) -> Self {
        Self {
            asset_id,
            timestamp,
            quantity,
            price_usd,
            value_usd: quantity * price_usd,
        }
    }
}

/// Aligns a unix timestamp (seconds) to the start of its UTC hour (glossary
/// "Aligned-to-hour": `t - (t mod 3600)`).
pub fn align_to_hour(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(3600)
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub symbol: String,
    pub name: String,
    pub chain_id: i64,
    pub contract: Option<String>,
    pub decimals: i32,
    pub external_price_id: Option<String>,
    pub is_predefined: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_hour_rounds_down() {
        assert_eq!(align_to_hour(3661), 3600);
        assert_eq!(align_to_hour(3600), 3600);
        assert_eq!(align_to_hour(0), 0);
    }

    #[test]
    fn snapshot_value_matches_invariant() {
        let snapshot = AssetSnapshot::new(
            Uuid::nil(),
            3600,
            Decimal::new(25, 1),
            Decimal::new(200, 2),
        );
        assert_eq!(snapshot.value_usd, Decimal::new(50, 1));
    }
}
