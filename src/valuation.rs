//! Asset Valuation (spec §4.7): joins an asset's current balance with its
//! current price into a snapshot, one asset at a time, isolating failures
//! per asset instead of letting one bad row abort the whole portfolio.
//!
//! Grounded on `crosschain/portfolio_manager.rs::fetch_portfolio`'s
//! per-chain try/continue loop (kept here as per-asset try/continue, since
//! this pipeline values one already-discovered asset row at a time rather
//! than re-discovering a whole wallet).

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregator::DataAggregator;
use crate::database::models::{Asset, AssetSnapshot, BalanceHistoryPoint, Token};
use crate::database::repository::Repository;
use crate::price::PriceEngine;

pub struct AssetValue {
    pub asset_id: uuid::Uuid,
    pub quantity: Decimal,
    pub price_usd: Decimal,
    pub value_usd: Decimal,
}

pub struct AssetValuation {
    repository: Arc<Repository>,
    aggregator: Arc<DataAggregator>,
    price_engine: Arc<PriceEngine>,
}

impl AssetValuation {
    pub fn new(repository: Arc<Repository>, aggregator: Arc<DataAggregator>, price_engine: Arc<PriceEngine>) -> Self {
        Self {
            repository,
            aggregator,
            price_engine,
        }
    }

    /// Values every active asset, ordered by creation time descending (spec
    /// §4.7 "Ordering"). A failure on one asset is logged and zeroes that
    /// row rather than aborting the rest (spec §4.7 "Per-row isolation").
    pub async fn value_all_assets(&self) -> anyhow::Result<Vec<AssetValue>> {
        let assets = self.repository.list_active_assets().await?;
        let mut values = Vec::with_capacity(assets.len());

        for asset in assets {
            match self.value_asset(&asset).await {
                Ok(value) => values.push(value),
                Err(e) => {
                    error!(asset_id = %asset.id, error = %e, "failed to value asset, recording zero");
                    values.push(AssetValue {
                        asset_id: asset.id,
                        quantity: Decimal::ZERO,
                        price_usd: Decimal::ZERO,
                        value_usd: Decimal::ZERO,
                    });
                }
            }
        }

        Ok(values)
    }

    pub async fn value_asset(&self, asset: &Asset) -> anyhow::Result<AssetValue> {
        let row = self
            .repository
            .portfolio_row(asset.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("asset {} has no wallet/token/chain row", asset.id))?;
        let (wallet, token, chain) = row;

        let quantity = self
            .fetch_balance(asset.id, &wallet.address, &chain.name, token.contract.as_deref())
            .await;
        let price = self.fetch_price(&token, &chain.name).await;

        info!(asset_id = %asset.id, %quantity, %price, "valued asset");

        Ok(AssetValue {
            asset_id: asset.id,
            quantity,
            price_usd: price,
            value_usd: quantity * price,
        })
    }

    /// Resolve balance (spec §4.7): latest `BalanceHistoryPoint` first; on
    /// miss, the aggregator, with the result written back.
    async fn fetch_balance(&self, asset_id: Uuid, address: &str, chain: &str, contract: Option<&str>) -> Decimal {
        match self.repository.latest_balance_history(asset_id).await {
            Ok(Some(point)) => return point.balance,
            Ok(None) => {}
            Err(e) => warn!(asset_id = %asset_id, error = %e, "balance history lookup failed"),
        }

        let balance = match self.aggregator.get_token_balance(address, chain, contract).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(address, chain, error = %e, "balance fetch failed, using zero");
                Decimal::ZERO
            }
        };

        let point = BalanceHistoryPoint {
            asset_id,
            timestamp: crate::database::models::align_to_hour(Utc::now().timestamp()),
            balance,
        };
        if let Err(e) = self.repository.upsert_balance_history(&point).await {
            warn!(asset_id = %asset_id, error = %e, "failed to write balance history point");
        }

        balance
    }

    async fn fetch_price(&self, token: &Token, chain_name: &str) -> Decimal {
        let price = self
            .price_engine
            .get_price_with_cache(token.id, &token.symbol, Some(chain_name))
            .await;
        Decimal::from_f64_retain(price).unwrap_or(Decimal::ZERO)
    }
}

pub fn value_usd_to_f64(value: &AssetValue) -> Option<f64> {
    value.value_usd.to_f64()
}
