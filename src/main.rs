//! Composition root (spec §10): builds every component from `PipelineConfig`
//! and runs the history scheduler until shutdown. No HTTP surface — the
//! pipeline spec has no API layer of its own, so the binary is a long-running
//! worker process rather than a server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use portfolio_pipeline::aggregator::DataAggregator;
use portfolio_pipeline::chain::{
    bitcoin::BitcoinDriver, evm::EvmDriver, solana::SolanaDriver, sui::SuiDriver, ChainDriver,
    ChainFamily, RetryPolicy,
};
use portfolio_pipeline::config::PipelineConfig;
use portfolio_pipeline::database::models::Chain as ChainRow;
use portfolio_pipeline::database::{RedisCache, Repository};
use portfolio_pipeline::discovery::{DiscoveryConfig, DiscoveryEngine};
use portfolio_pipeline::price::{ExternalIdLookup, PriceEngine, PriceEngineConfig};
use portfolio_pipeline::providers;
use portfolio_pipeline::scheduler::{HistoryScheduler, SchedulerConfig};
use portfolio_pipeline::token_library::TokenLibrary;
use portfolio_pipeline::valuation::AssetValuation;

/// A chain this binary knows how to drive, with the metadata needed to seed
/// its `blockchains` row (spec §6.1) and construct its driver (spec §4.1).
/// Defaults grounded on the original service's `SUPPORTED_CHAINS` table.
struct ChainSpec {
    name: &'static str,
    display_name: &'static str,
    family: ChainFamily,
    explorer_url: &'static str,
    rpc_env: &'static str,
    default_rpc: &'static [&'static str],
}

const CHAIN_SPECS: &[ChainSpec] = &[
    ChainSpec { name: "ethereum", display_name: "Ethereum", family: ChainFamily::Evm, explorer_url: "https://etherscan.io", rpc_env: "ETHEREUM_RPC_URL", default_rpc: &["https://eth.llamarpc.com"] },
    ChainSpec { name: "arbitrum", display_name: "Arbitrum One", family: ChainFamily::Evm, explorer_url: "https://arbiscan.io", rpc_env: "ARBITRUM_RPC_URL", default_rpc: &["https://arb1.arbitrum.io/rpc"] },
    ChainSpec { name: "base", display_name: "Base", family: ChainFamily::Evm, explorer_url: "https://basescan.org", rpc_env: "BASE_RPC_URL", default_rpc: &["https://mainnet.base.org"] },
    ChainSpec { name: "polygon", display_name: "Polygon", family: ChainFamily::Evm, explorer_url: "https://polygonscan.com", rpc_env: "POLYGON_RPC_URL", default_rpc: &["https://polygon-rpc.com"] },
    ChainSpec {
        name: "bsc", display_name: "BNB Smart Chain", family: ChainFamily::Evm, explorer_url: "https://bscscan.com", rpc_env: "BSC_RPC_URL",
        default_rpc: &["https://bsc-dataseed.binance.org", "https://bsc-dataseed1.defibit.io", "https://bsc-dataseed1.ninicoin.io"],
    },
    ChainSpec {
        name: "solana", display_name: "Solana", family: ChainFamily::Solana, explorer_url: "https://solscan.io", rpc_env: "SOLANA_RPC_URL",
        default_rpc: &["https://api.mainnet-beta.solana.com", "https://solana-api.projectserum.com", "https://rpc.ankr.com/solana"],
    },
    ChainSpec { name: "sui", display_name: "Sui", family: ChainFamily::Sui, explorer_url: "https://suiscan.xyz", rpc_env: "SUI_RPC_URL", default_rpc: &["https://fullnode.mainnet.sui.io"] },
    ChainSpec { name: "bitcoin", display_name: "Bitcoin", family: ChainFamily::Bitcoin, explorer_url: "https://blockstream.info", rpc_env: "BITCOIN_REST_URL", default_rpc: &["https://blockstream.info/api"] },
];

fn rpc_endpoints(spec: &ChainSpec) -> Vec<String> {
    match std::env::var(spec.rpc_env) {
        Ok(url) => std::iter::once(url).chain(spec.default_rpc.iter().map(|s| s.to_string())).collect(),
        Err(_) => spec.default_rpc.iter().map(|s| s.to_string()).collect(),
    }
}

fn build_driver(spec: &ChainSpec, policy: RetryPolicy) -> Arc<dyn ChainDriver> {
    let endpoints = rpc_endpoints(spec);
    match spec.family {
        ChainFamily::Evm => Arc::new(EvmDriver::new(spec.name, endpoints, None, None, vec![], policy)),
        ChainFamily::Solana => Arc::new(SolanaDriver::new(spec.name, endpoints, policy)),
        ChainFamily::Sui => Arc::new(SuiDriver::new(spec.name, endpoints, policy)),
        ChainFamily::Bitcoin => Arc::new(BitcoinDriver::new(spec.name, endpoints, policy)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = PipelineConfig::from_env()?;
    info!("starting portfolio data pipeline");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let repository = Arc::new(Repository::new(pool));

    let redis_cache = match &config.redis_url {
        Some(url) => match RedisCache::connect(url, config.discovery_cache_ttl).await {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "redis unavailable, discovery cache disabled");
                None
            }
        },
        None => None,
    };

    let mut chain_drivers: HashMap<String, Arc<dyn ChainDriver>> = HashMap::new();
    let token_library = Arc::new(TokenLibrary::new(Arc::clone(&repository)));

    for spec in CHAIN_SPECS {
        let row = ChainRow {
            id: 0,
            name: spec.name.to_string(),
            display_name: spec.display_name.to_string(),
            family: match spec.family {
                ChainFamily::Evm => portfolio_pipeline::database::models::ChainFamily::Evm,
                ChainFamily::Solana => portfolio_pipeline::database::models::ChainFamily::Solana,
                ChainFamily::Sui => portfolio_pipeline::database::models::ChainFamily::Sui,
                ChainFamily::Bitcoin => portfolio_pipeline::database::models::ChainFamily::Bitcoin,
            },
            rpc_urls: rpc_endpoints(spec),
            explorer_url: Some(spec.explorer_url.to_string()),
            is_testnet: false,
            is_active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let chain_id = match repository.upsert_chain(&row).await {
            Ok(id) => id,
            Err(e) => {
                error!(chain = spec.name, error = %e, "failed to seed chain row, skipping");
                continue;
            }
        };

        if let Err(e) = token_library.seed_predefined(spec.name, chain_id).await {
            warn!(chain = spec.name, error = %e, "failed to seed predefined tokens");
        }

        chain_drivers.insert(spec.name.to_string(), build_driver(spec, RetryPolicy::default()));
    }

    let providers = providers::build_registry(&config);
    info!(count = providers.len(), "provider registry built");
    let aggregator = Arc::new(DataAggregator::new(providers, config.aggregator_cache_ttl));

    let price_engine = Arc::new(PriceEngine::new(
        PriceEngineConfig {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: config.provider_api_keys.get("coingecko").cloned(),
            cache_ttl: config.price_cache_ttl,
            batch_size: config.price_batch_size,
            rate_limit_delay: config.price_rate_limit_delay,
            max_retries: config.price_max_retries,
            retry_base_delay: config.price_retry_base_delay,
            data_dir: config.data_dir.clone().into(),
        },
        Some(Arc::clone(&token_library) as Arc<dyn ExternalIdLookup>),
        Some(Arc::clone(&repository)),
    ));

    // Discovery is invoked on demand (spec's [Token Discovery Engine] has no
    // timer of its own); constructing it here validates wiring even though
    // this binary has no caller for it yet.
    let _discovery = Arc::new(DiscoveryEngine::new(
        Arc::clone(&aggregator),
        chain_drivers.clone(),
        Arc::clone(&token_library),
        redis_cache,
        DiscoveryConfig {
            min_value_usd: config.discovery_min_value_usd,
            include_zero_balance_default: config.include_zero_balance_default,
            manual_token_addition_enabled: config.manual_token_addition_enabled,
            cache_ttl: config.discovery_cache_ttl,
            max_concurrent: config.discovery_max_concurrent,
        },
    ));

    let valuation = Arc::new(AssetValuation::new(
        Arc::clone(&repository),
        Arc::clone(&aggregator),
        Arc::clone(&price_engine),
    ));

    let history_scheduler = Arc::new(HistoryScheduler::new(
        Arc::clone(&repository),
        valuation,
        chain_drivers,
        SchedulerConfig {
            snapshot_interval: Duration::from_secs(config.history_interval_hours * 3600),
            backfill_interval: Duration::from_secs(config.history_interval_hours * 3600),
            backfill_window: Duration::from_secs(7 * 86_400),
            retention_years: config.history_retention_years,
            auto_update: config.history_auto_update,
        },
    ));

    history_scheduler.start().await;
    info!("pipeline running, awaiting shutdown signal");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    history_scheduler.stop().await;

    Ok(())
}
