//! Raw `sqlx::query(...).bind(...)` persistence for the Cache Tables /
//! persistent-store contract (spec §6.1). No `query!` macro: there is no
//! live database to validate against in this exercise, matching the
//! teacher's own `repository.rs` idiom.

use anyhow::Result;
use chrono::Utc;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use super::models::*;

pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ---- Chains -----------------------------------------------------

    /// Idempotent upsert, called once at startup per chain (spec §3
    /// "Chains... are created once at initialization and updated
    /// idempotently").
    pub async fn upsert_chain(&self, chain: &Chain) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO blockchains (name, display_name, family, rpc_urls, explorer_url, is_testnet, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                rpc_urls = EXCLUDED.rpc_urls,
                explorer_url = EXCLUDED.explorer_url,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&chain.name)
        .bind(&chain.display_name)
        .bind(chain.family)
        .bind(&chain.rpc_urls)
        .bind(&chain.explorer_url)
        .bind(chain.is_testnet)
        .bind(chain.is_active)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn find_chain_by_name(&self, name: &str) -> Result<Option<Chain>> {
        let chain = sqlx::query_as::<_, Chain>("SELECT * FROM blockchains WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(chain)
    }

    // ---- Tokens -------------------------------------------------------

    /// Idempotent upsert for the predefined catalog (Token Library §4.5).
    pub async fn upsert_predefined_token(&self, new_token: &NewToken) -> Result<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO tokens (id, symbol, name, chain_id, contract, decimals, external_price_id, is_predefined, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, true, true)
            ON CONFLICT (symbol, chain_id, contract) DO UPDATE SET
                name = EXCLUDED.name,
                decimals = EXCLUDED.decimals,
                external_price_id = EXCLUDED.external_price_id,
                is_predefined = true,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_token.symbol)
        .bind(&new_token.name)
        .bind(new_token.chain_id)
        .bind(&new_token.contract)
        .bind(new_token.decimals)
        .bind(&new_token.external_price_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn find_token(&self, symbol: &str, chain_id: i64) -> Result<Option<Token>> {
        let token = sqlx::query_as::<_, Token>(
            "SELECT * FROM tokens WHERE symbol = $1 AND chain_id = $2 AND is_active = true",
        )
        .bind(symbol)
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    pub async fn find_token_by_contract(&self, chain_id: i64, contract: &str) -> Result<Option<Token>> {
        let token = sqlx::query_as::<_, Token>(
            "SELECT * FROM tokens WHERE chain_id = $1 AND contract = $2",
        )
        .bind(chain_id)
        .bind(contract)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    /// Insert-or-reactivate-or-return-existing for a custom token (spec
    /// §4.5 "Custom tokens"), reifying the uniqueness-conflict-as-control-
    /// flow pattern as an explicit happy path (spec §9 redesign flag).
    pub async fn add_custom_token(&self, new_token: &NewToken) -> Result<Token> {
        if let Some(existing) = sqlx::query_as::<_, Token>(
            "SELECT * FROM tokens WHERE symbol = $1 AND chain_id = $2 AND contract IS NOT DISTINCT FROM $3",
        )
        .bind(&new_token.symbol)
        .bind(new_token.chain_id)
        .bind(&new_token.contract)
        .fetch_optional(&self.pool)
        .await?
        {
            if existing.is_active {
                return Ok(existing);
            }
            return self.reactivate_token(existing.id).await;
        }

        let insert_result = sqlx::query_as::<_, Token>(
            r#"
            INSERT INTO tokens (id, symbol, name, chain_id, contract, decimals, external_price_id, is_predefined, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, false, true)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_token.symbol)
        .bind(&new_token.name)
        .bind(new_token.chain_id)
        .bind(&new_token.contract)
        .bind(new_token.decimals)
        .bind(&new_token.external_price_id)
        .fetch_one(&self.pool)
        .await;

        match insert_result {
            Ok(token) => Ok(token),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                // Lost a race to a concurrent insert; re-read and return it.
                sqlx::query_as::<_, Token>(
                    "SELECT * FROM tokens WHERE symbol = $1 AND chain_id = $2 AND contract IS NOT DISTINCT FROM $3",
                )
                .bind(&new_token.symbol)
                .bind(new_token.chain_id)
                .bind(&new_token.contract)
                .fetch_one(&self.pool)
                .await
                .map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn reactivate_token(&self, token_id: Uuid) -> Result<Token> {
        let token = sqlx::query_as::<_, Token>(
            "UPDATE tokens SET is_active = true, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(token_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(token)
    }

    /// Every active predefined token on a chain, for discovery's predefined-
    /// token probing step (spec §4.6 step 3).
    pub async fn find_predefined_tokens(&self, chain_id: i64) -> Result<Vec<Token>> {
        let tokens = sqlx::query_as::<_, Token>(
            "SELECT * FROM tokens WHERE chain_id = $1 AND is_predefined = true AND is_active = true",
        )
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    /// Prefix-then-substring search (spec §4.5 "Search").
    pub async fn search_tokens(&self, query: &str, limit: i64) -> Result<Vec<Token>> {
        let prefix = format!("{}%", query);
        let mut results = sqlx::query_as::<_, Token>(
            "SELECT * FROM tokens WHERE is_active = true AND symbol ILIKE $1 ORDER BY symbol LIMIT $2",
        )
        .bind(&prefix)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if results.len() < limit as usize {
            let substring = format!("%{}%", query);
            let remaining = limit - results.len() as i64;
            let seen: Vec<Uuid> = results.iter().map(|t| t.id).collect();
            let name_matches = sqlx::query_as::<_, Token>(
                "SELECT * FROM tokens WHERE is_active = true AND name ILIKE $1 AND NOT (id = ANY($2)) ORDER BY name LIMIT $3",
            )
            .bind(&substring)
            .bind(&seen)
            .bind(remaining)
            .fetch_all(&self.pool)
            .await?;
            results.extend(name_matches);
        }

        Ok(results)
    }

    // ---- Wallets --------------------------------------------------------

    pub async fn find_or_create_wallet(&self, address: &str, chain_id: i64) -> Result<Wallet> {
        if let Some(existing) = sqlx::query_as::<_, Wallet>(
            "SELECT * FROM wallets WHERE address = $1 AND chain_id = $2",
        )
        .bind(address)
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(existing);
        }

        sqlx::query_as::<_, Wallet>(
            r#"
            INSERT INTO wallets (id, address, chain_id, is_estimated)
            VALUES ($1, $2, $3, true)
            ON CONFLICT (address, chain_id) DO UPDATE SET address = EXCLUDED.address
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(address)
        .bind(chain_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn upsert_wallet_creation_metadata(
        &self,
        wallet_id: Uuid,
        timestamp: Option<i64>,
        tx_hash: Option<&str>,
        block_number: Option<i64>,
        is_estimated: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE wallets
            SET creation_timestamp = $2, first_transaction_hash = $3, block_number = $4, is_estimated = $5
            WHERE id = $1
            "#,
        )
        .bind(wallet_id)
        .bind(timestamp)
        .bind(tx_hash)
        .bind(block_number)
        .bind(is_estimated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- Assets -----------------------------------------------------------

    /// `add_asset` per spec §8 scenario 6: created / existing / reactivated.
    pub async fn add_asset(&self, wallet_id: Uuid, token_id: Uuid) -> Result<(Asset, &'static str)> {
        if let Some(existing) = sqlx::query_as::<_, Asset>(
            "SELECT * FROM assets WHERE wallet_id = $1 AND token_id = $2",
        )
        .bind(wallet_id)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?
        {
            if existing.is_active {
                return Ok((existing, "existing"));
            }
            let reactivated = sqlx::query_as::<_, Asset>(
                "UPDATE assets SET is_active = true WHERE id = $1 RETURNING *",
            )
            .bind(existing.id)
            .fetch_one(&self.pool)
            .await?;
            return Ok((reactivated, "created-or-reactivated"));
        }

        let created = sqlx::query_as::<_, Asset>(
            r#"
            INSERT INTO assets (id, wallet_id, token_id, is_active)
            VALUES ($1, $2, $3, true)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(wallet_id)
        .bind(token_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((created, "created"))
    }

    pub async fn soft_delete_asset(&self, asset_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE assets SET is_active = false WHERE id = $1")
            .bind(asset_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_active_assets(&self) -> Result<Vec<Asset>> {
        let assets = sqlx::query_as::<_, Asset>(
            "SELECT * FROM assets WHERE is_active = true ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(assets)
    }

    // ---- History --------------------------------------------------------

    pub async fn latest_price_history(&self, token_id: Uuid) -> Result<Option<PriceHistoryPoint>> {
        let point = sqlx::query_as::<_, PriceHistoryPoint>(
            "SELECT * FROM price_history WHERE token_id = $1 ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(point)
    }

    pub async fn upsert_price_history(&self, point: &PriceHistoryPoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_history (token_id, timestamp, price_usd, source)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (token_id, timestamp) DO UPDATE SET price_usd = EXCLUDED.price_usd, source = EXCLUDED.source
            "#,
        )
        .bind(point.token_id)
        .bind(point.timestamp)
        .bind(point.price_usd)
        .bind(&point.source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_balance_history(&self, asset_id: Uuid) -> Result<Option<BalanceHistoryPoint>> {
        let point = sqlx::query_as::<_, BalanceHistoryPoint>(
            "SELECT * FROM balance_history WHERE asset_id = $1 ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(point)
    }

    pub async fn upsert_balance_history(&self, point: &BalanceHistoryPoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balance_history (asset_id, timestamp, balance)
            VALUES ($1, $2, $3)
            ON CONFLICT (asset_id, timestamp) DO UPDATE SET balance = EXCLUDED.balance
            "#,
        )
        .bind(point.asset_id)
        .bind(point.timestamp)
        .bind(point.balance)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Serialization point for concurrent writers (spec §5 "Ordering
    /// guarantees": snapshot/back-fill never interleave writes to the same
    /// `(asset, timestamp)`).
    pub async fn upsert_asset_snapshot(&self, snapshot: &AssetSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO asset_snapshots (asset_id, timestamp, quantity, price_usd, value_usd)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (asset_id, timestamp) DO UPDATE SET
                quantity = EXCLUDED.quantity, price_usd = EXCLUDED.price_usd, value_usd = EXCLUDED.value_usd
            "#,
        )
        .bind(snapshot.asset_id)
        .bind(snapshot.timestamp)
        .bind(snapshot.quantity)
        .bind(snapshot.price_usd)
        .bind(snapshot.value_usd)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn snapshot_exists(&self, asset_id: Uuid, timestamp: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM asset_snapshots WHERE asset_id = $1 AND timestamp = $2",
        )
        .bind(asset_id)
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    pub async fn price_history_exists(&self, token_id: Uuid, timestamp: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM price_history WHERE token_id = $1 AND timestamp = $2",
        )
        .bind(token_id)
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    pub async fn balance_history_exists(&self, asset_id: Uuid, timestamp: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM balance_history WHERE asset_id = $1 AND timestamp = $2",
        )
        .bind(asset_id)
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    /// Retention cleanup: drops history rows older than the configured
    /// window (spec §4.8 "Retention").
    pub async fn delete_history_older_than(&self, retention_years: u32) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - retention_years as i64 * 365 * 24 * 3600;

        let mut deleted = 0u64;
        for table in ["price_history", "balance_history", "asset_snapshots"] {
            let result = sqlx::query(&format!("DELETE FROM {} WHERE timestamp < $1", table))
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    /// Three targeted queries rather than one joined `SELECT *`: `wallets`,
    /// `tokens`, and `blockchains` all share column names (`id`, `chain_id`,
    /// `created_at`, `updated_at`), so a single-row join would make
    /// `FromRow`'s by-name column resolution collide across the three
    /// structs.
    pub async fn portfolio_row(&self, asset_id: Uuid) -> Result<Option<(Wallet, Token, Chain)>> {
        let Some(asset) = sqlx::query_as::<_, Asset>("SELECT * FROM assets WHERE id = $1")
            .bind(asset_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE id = $1")
            .bind(asset.wallet_id)
            .fetch_one(&self.pool)
            .await?;
        let token = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE id = $1")
            .bind(asset.token_id)
            .fetch_one(&self.pool)
            .await?;
        let chain = sqlx::query_as::<_, Chain>("SELECT * FROM blockchains WHERE id = $1")
            .bind(token.chain_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(Some((wallet, token, chain)))
    }
}

#[cfg(test)]
mod tests {
    // Repository methods require a live Postgres connection; covered by the
    // history-table invariants exercised in `models.rs` and the end-to-end
    // behavior exercised in `valuation.rs` / `scheduler` against fakes.
}
