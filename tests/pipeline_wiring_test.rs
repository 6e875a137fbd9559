use std::sync::Arc;
use std::time::Duration;

use portfolio_pipeline::config::PipelineConfig;
use portfolio_pipeline::price::{ExternalIdLookup, PriceEngine, PriceEngineConfig};
use portfolio_pipeline::providers::{self, ProviderKind};

/// Cross-component smoke test with no network/database dependency: builds a
/// provider registry from config overrides and checks the priority ordering
/// the spec's registry initialization guarantees.
#[test]
fn provider_registry_orders_primary_before_fallback() {
    let mut config = PipelineConfig::from_env().unwrap();
    config.primary_providers = vec!["covalent".into()];
    config.secondary_providers = vec!["zerion".into(), "moralis".into()];
    config.fallback_providers = vec!["blockvision_sui".into()];

    let registry = providers::build_registry(&config);
    let kinds: Vec<ProviderKind> = registry.iter().map(|p| p.kind()).collect();

    assert_eq!(kinds[0], ProviderKind::Covalent);
    assert_eq!(*kinds.last().unwrap(), ProviderKind::BlockVisionSui);
}

struct NoopLookup;

#[async_trait::async_trait]
impl ExternalIdLookup for NoopLookup {
    async fn external_price_id(&self, _symbol: &str, _chain: &str) -> Option<String> {
        None
    }
}

/// The price engine's stablecoin shortcut must never touch the network or
/// consult the external-id lookup at all.
#[tokio::test]
async fn stablecoin_price_never_calls_external_lookup() {
    let engine = PriceEngine::new(
        PriceEngineConfig {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: None,
            cache_ttl: Duration::from_secs(60),
            batch_size: 10,
            rate_limit_delay: Duration::from_millis(1),
            max_retries: 1,
            retry_base_delay: Duration::from_millis(1),
            data_dir: std::env::temp_dir(),
        },
        Some(Arc::new(NoopLookup) as Arc<dyn ExternalIdLookup>),
        None,
    );

    let price = engine.get_price("usdc", Some("ethereum")).await;
    assert_eq!(price, 1.0);

    let (total, valid) = engine.cache_stats().await;
    assert_eq!(total, 1);
    assert_eq!(valid, 1);
}
