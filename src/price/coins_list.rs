//! CoinGecko's full coin list, used as the last resort when a symbol has no
//! token-library entry and no hardcoded mapping (spec supplement "coin-list
//! fallback resolution" / "disk fallback for coin-list cache").

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

const CACHE_TTL: Duration = Duration::from_secs(86_400);
const DISK_FALLBACK_MAX_AGE: Duration = Duration::from_secs(7 * 86_400);

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoinListEntry {
    pub id: String,
    pub symbol: String,
    pub name: String,
}

#[derive(Serialize, Deserialize)]
struct CoinsListFile {
    timestamp: u64,
    count: usize,
    coins: Vec<CoinListEntry>,
}

pub struct CoinsListCache {
    data_dir: PathBuf,
    cache: RwLock<Option<(Vec<CoinListEntry>, Instant)>>,
}

impl CoinsListCache {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            cache: RwLock::new(None),
        }
    }

    fn file_path(&self) -> PathBuf {
        self.data_dir.join("coingecko_coins_list.json")
    }

    pub async fn get(&self, http: &reqwest::Client, base_url: &str, api_key: Option<&str>) -> Vec<CoinListEntry> {
        {
            let cache = self.cache.read().await;
            if let Some((coins, written_at)) = cache.as_ref() {
                if written_at.elapsed() < CACHE_TTL {
                    return coins.clone();
                }
            }
        }

        match self.fetch_live(http, base_url, api_key).await {
            Ok(coins) => {
                self.cache.write().await.replace((coins.clone(), Instant::now()));
                self.save_to_disk(&coins).await;
                coins
            }
            Err(e) => {
                warn!(error = %e, "coin list fetch failed, falling back to disk cache");
                self.load_from_disk().await.unwrap_or_default()
            }
        }
    }

    async fn fetch_live(
        &self,
        http: &reqwest::Client,
        base_url: &str,
        api_key: Option<&str>,
    ) -> Result<Vec<CoinListEntry>, reqwest::Error> {
        let mut request = http.get(format!("{}/coins/list", base_url));
        if let Some(key) = api_key {
            request = request.header("x-cg-demo-api-key", key);
        }
        info!("fetching full coin list");
        let coins: Vec<CoinListEntry> = request.send().await?.json().await?;
        info!(count = coins.len(), "fetched coin list");
        Ok(coins)
    }

    async fn save_to_disk(&self, coins: &[CoinListEntry]) {
        let Ok(timestamp) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return;
        };
        if let Some(parent) = self.file_path().parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let file = CoinsListFile {
            timestamp: timestamp.as_secs(),
            count: coins.len(),
            coins: coins.to_vec(),
        };
        match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(self.file_path(), bytes).await {
                    warn!(error = %e, "failed to write coin list disk cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize coin list disk cache"),
        }
    }

    async fn load_from_disk(&self) -> Option<Vec<CoinListEntry>> {
        let bytes = tokio::fs::read(self.file_path()).await.ok()?;
        let file: CoinsListFile = serde_json::from_slice(&bytes).ok()?;

        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        let age = Duration::from_secs(now.saturating_sub(file.timestamp));
        if age > DISK_FALLBACK_MAX_AGE {
            warn!("disk coin list cache is stale, discarding");
            return None;
        }

        info!(count = file.count, "loaded coin list from disk fallback");
        Some(file.coins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disk_fallback_round_trips_within_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CoinsListCache::new(dir.path().to_path_buf());
        let coins = vec![CoinListEntry { id: "ethereum".into(), symbol: "eth".into(), name: "Ethereum".into() }];

        cache.save_to_disk(&coins).await;
        let loaded = cache.load_from_disk().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "ethereum");
    }

    #[tokio::test]
    async fn disk_fallback_discards_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coingecko_coins_list.json");
        let stale = CoinsListFile {
            timestamp: 0,
            count: 1,
            coins: vec![CoinListEntry { id: "ethereum".into(), symbol: "eth".into(), name: "Ethereum".into() }],
        };
        tokio::fs::write(&path, serde_json::to_vec(&stale).unwrap()).await.unwrap();

        let cache = CoinsListCache::new(dir.path().to_path_buf());
        assert!(cache.load_from_disk().await.is_none());
    }
}
