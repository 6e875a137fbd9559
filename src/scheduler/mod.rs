//! Historical Snapshot & Back-Fill Scheduler (spec §4.8): two supervised
//! background jobs — a periodic snapshot job and a rolling back-fill job —
//! plus retention cleanup.
//!
//! Grounded on `token_registry/scheduler.rs`'s `TokenDiscoveryScheduler`
//! (spawn-loop-with-flag shape, `start`/`stop`/`is_running` surface), with
//! the stop flag upgraded from a polled `RwLock<bool>` to a `tokio::sync::
//! watch` channel raced against the sleep in a `tokio::select!` (spec §9
//! redesign flag: a poll-based flag can leave a job running for a full
//! interval after `stop()` is called; a `watch` receiver wakes the select
//! immediately).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::chain::ChainDriver;
use crate::database::models::{align_to_hour, AssetSnapshot, BalanceHistoryPoint, PriceHistoryPoint};
use crate::database::repository::Repository;
use crate::valuation::AssetValuation;

pub struct SchedulerConfig {
    pub snapshot_interval: Duration,
    pub backfill_interval: Duration,
    pub backfill_window: Duration,
    pub retention_years: u32,
    pub auto_update: bool,
}

struct JobHandle {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Caches a wallet's first-transaction time for the lifetime of the process
/// so the back-fill job never re-derives it (spec §4.8 "wallet creation
/// time is resolved once per address/chain pair").
#[derive(Default)]
struct WalletCreationCache {
    entries: Mutex<HashMap<(String, String), i64>>,
}

impl WalletCreationCache {
    async fn get_or_resolve(
        &self,
        address: &str,
        chain_name: &str,
        driver: &Arc<dyn ChainDriver>,
    ) -> i64 {
        let key = (address.to_string(), chain_name.to_string());
        if let Some(ts) = self.entries.lock().await.get(&key) {
            return *ts;
        }

        let resolved = match driver.first_transaction_time(address).await {
            Ok(info) => info.timestamp.unwrap_or(0),
            Err(e) => {
                warn!(address, chain_name, error = %e, "failed to resolve wallet creation time, assuming epoch");
                0
            }
        };
        self.entries.lock().await.insert(key, resolved);
        resolved
    }
}

pub struct HistoryScheduler {
    repository: Arc<Repository>,
    valuation: Arc<AssetValuation>,
    chain_drivers: HashMap<String, Arc<dyn ChainDriver>>,
    config: SchedulerConfig,
    wallet_creation_cache: WalletCreationCache,
    snapshot_job: Mutex<Option<JobHandle>>,
    backfill_job: Mutex<Option<JobHandle>>,
}

impl HistoryScheduler {
    pub fn new(
        repository: Arc<Repository>,
        valuation: Arc<AssetValuation>,
        chain_drivers: HashMap<String, Arc<dyn ChainDriver>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            valuation,
            chain_drivers,
            config,
            wallet_creation_cache: WalletCreationCache::default(),
            snapshot_job: Mutex::new(None),
            backfill_job: Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.config.auto_update {
            self.start_snapshot_job().await;
            self.start_backfill_job().await;
        } else {
            info!("auto_update disabled, history scheduler not started");
        }
    }

    pub async fn stop(&self) {
        if let Some(job) = self.snapshot_job.lock().await.take() {
            let _ = job.stop_tx.send(true);
            let _ = job.task.await;
        }
        if let Some(job) = self.backfill_job.lock().await.take() {
            let _ = job.stop_tx.send(true);
            let _ = job.task.await;
        }
        info!("history scheduler stopped");
    }

    async fn start_snapshot_job(self: &Arc<Self>) {
        let mut guard = self.snapshot_job.lock().await;
        if guard.is_some() {
            warn!("snapshot job already running");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let interval = self.config.snapshot_interval;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("snapshot job stopping");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        scheduler.run_snapshot().await;
                    }
                }
            }
        });

        *guard = Some(JobHandle { stop_tx, task });
        info!(?interval, "snapshot job started");
    }

    async fn start_backfill_job(self: &Arc<Self>) {
        let mut guard = self.backfill_job.lock().await;
        if guard.is_some() {
            warn!("back-fill job already running");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let interval = self.config.backfill_interval;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("back-fill job stopping");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        scheduler.run_backfill().await;
                        scheduler.run_retention_cleanup().await;
                    }
                }
            }
        });

        *guard = Some(JobHandle { stop_tx, task });
        info!(?interval, "back-fill job started");
    }

    /// One pass: value every active asset and write a snapshot, price
    /// point, and balance point at the current hour-aligned timestamp.
    async fn run_snapshot(&self) {
        let now = align_to_hour(Utc::now().timestamp());
        info!(timestamp = now, "running snapshot pass");

        let values = match self.valuation.value_all_assets().await {
            Ok(values) => values,
            Err(e) => {
                error!(error = %e, "snapshot pass failed to value assets");
                return;
            }
        };

        for value in values {
            let snapshot = AssetSnapshot::new(value.asset_id, now, value.quantity, value.price_usd);
            if let Err(e) = self.repository.upsert_asset_snapshot(&snapshot).await {
                error!(asset_id = %value.asset_id, error = %e, "failed to persist snapshot");
                continue;
            }
            if let Err(e) = self
                .repository
                .upsert_balance_history(&BalanceHistoryPoint {
                    asset_id: value.asset_id,
                    timestamp: now,
                    balance: value.quantity,
                })
                .await
            {
                warn!(asset_id = %value.asset_id, error = %e, "failed to persist balance history point");
            }
        }
    }

    /// Back-fills missing hourly points within the configured window, never
    /// reaching earlier than a wallet's first transaction time (spec §4.8
    /// "Back-fill bound").
    async fn run_backfill(&self) {
        let now = align_to_hour(Utc::now().timestamp());
        let window_start = now - self.config.backfill_window.as_secs() as i64;
        info!(window_start, now, "running back-fill pass");

        let assets = match self.repository.list_active_assets().await {
            Ok(assets) => assets,
            Err(e) => {
                error!(error = %e, "back-fill pass failed to list assets");
                return;
            }
        };

        for asset in assets {
            if let Err(e) = self.backfill_asset(&asset, window_start, now).await {
                warn!(asset_id = %asset.id, error = %e, "back-fill failed for asset");
            }
        }
    }

    async fn backfill_asset(&self, asset: &crate::database::models::Asset, window_start: i64, now: i64) -> anyhow::Result<()> {
        let Some((wallet, token, chain)) = self.repository.portfolio_row(asset.id).await? else {
            return Ok(());
        };

        let earliest = match self.chain_drivers.get(&chain.name) {
            Some(driver) => self.wallet_creation_cache.get_or_resolve(&wallet.address, &chain.name, driver).await,
            None => window_start,
        };
        let lower_bound = window_start.max(earliest);

        let mut ts = lower_bound;
        while ts < now {
            let aligned = align_to_hour(ts);
            let missing_snapshot = !self.repository.snapshot_exists(asset.id, aligned).await.unwrap_or(false);
            let missing_price = !self.repository.price_history_exists(token.id, aligned).await.unwrap_or(false);
            let missing_balance = !self.repository.balance_history_exists(asset.id, aligned).await.unwrap_or(false);

            if missing_snapshot || missing_price || missing_balance {
                let value = self.valuation.value_asset(asset).await?;

                if missing_snapshot {
                    let snapshot = AssetSnapshot::new(asset.id, aligned, value.quantity, value.price_usd);
                    self.repository.upsert_asset_snapshot(&snapshot).await?;
                }
                if missing_price {
                    self.repository
                        .upsert_price_history(&PriceHistoryPoint {
                            token_id: token.id,
                            timestamp: aligned,
                            price_usd: value.price_usd,
                            source: "backfill".to_string(),
                        })
                        .await?;
                }
                if missing_balance {
                    self.repository
                        .upsert_balance_history(&BalanceHistoryPoint {
                            asset_id: asset.id,
                            timestamp: aligned,
                            balance: value.quantity,
                        })
                        .await?;
                }
            }
            ts += 3600;
        }

        Ok(())
    }

    async fn run_retention_cleanup(&self) {
        match self.repository.delete_history_older_than(self.config.retention_years).await {
            Ok(deleted) => info!(deleted, "retention cleanup complete"),
            Err(e) => error!(error = %e, "retention cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_window_never_exceeds_configured_duration() {
        let config = SchedulerConfig {
            snapshot_interval: Duration::from_secs(3600),
            backfill_interval: Duration::from_secs(3600),
            backfill_window: Duration::from_secs(7 * 86_400),
            retention_years: 2,
            auto_update: true,
        };
        assert_eq!(config.backfill_window.as_secs(), 604_800);
    }
}
