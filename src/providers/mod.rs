//! Data Provider Registry (spec §4.2). One interface (`DataProvider`), one
//! sealed enum describing provider identity (`ProviderKind`), and a
//! constructor table (`build_registry`) — replacing the teacher's
//! `Vec<Box<dyn TokenSource>>` open-ended registry per the spec's §9
//! redesign flag.

pub mod blockvision;
pub mod covalent;
pub mod generic;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::chain::DiscoveredToken;
use crate::config::PipelineConfig;

pub use blockvision::BlockVisionSuiProvider;
pub use covalent::CovalentProvider;
pub use generic::GenericMultiChainProvider;

#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unparseable response: {0}")]
    Schema(String),
    #[error("chain {0} not supported by this provider")]
    ChainNotSupported(String),
}

/// Sealed identity for a provider slot; exhaustively matched wherever a
/// provider's concrete kind matters (e.g. the constructor table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Covalent,
    BlockVisionSui,
    Zerion,
    Moralis,
    Zapper,
    Alchemy,
    DeBank,
    Mobula,
    Bitquery,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Covalent => "covalent",
            ProviderKind::BlockVisionSui => "blockvision_sui",
            ProviderKind::Zerion => "zerion",
            ProviderKind::Moralis => "moralis",
            ProviderKind::Zapper => "zapper",
            ProviderKind::Alchemy => "alchemy",
            ProviderKind::DeBank => "debank",
            ProviderKind::Mobula => "mobula",
            ProviderKind::Bitquery => "bitquery",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "covalent" => Some(ProviderKind::Covalent),
            "blockvision_sui" => Some(ProviderKind::BlockVisionSui),
            "zerion" => Some(ProviderKind::Zerion),
            "moralis" => Some(ProviderKind::Moralis),
            "zapper" => Some(ProviderKind::Zapper),
            "alchemy" => Some(ProviderKind::Alchemy),
            "debank" => Some(ProviderKind::DeBank),
            "mobula" => Some(ProviderKind::Mobula),
            "bitquery" => Some(ProviderKind::Bitquery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderPriority {
    Primary = 1,
    Secondary = 2,
    Fallback = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    MultiChain,
    ChainSpecific,
    Fallback,
}

/// Shared error-counter/health state, read and mutated independently of the
/// provider's own async body (spec §4.3 "Health & circuit-breaking").
#[derive(Debug)]
pub struct ProviderHealth {
    error_count: AtomicU32,
    max_errors: u32,
}

impl ProviderHealth {
    pub fn new(max_errors: u32) -> Self {
        Self {
            error_count: AtomicU32::new(0),
            max_errors,
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reset_errors(&self) {
        self.error_count.store(0, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.error_count.load(Ordering::SeqCst) < self.max_errors
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait DataProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;
    fn provider_type(&self) -> ProviderType;
    fn priority(&self) -> ProviderPriority;
    fn supported_chains(&self) -> &[String];
    fn health(&self) -> &ProviderHealth;
    fn rate_limit_delay(&self) -> Duration;
    /// An empty API key still reports `supports_chain = true`, but every
    /// operation yields empty results (spec §4.2).
    fn has_credential(&self) -> bool;

    fn supports_chain(&self, chain: &str) -> bool {
        self.supported_chains().iter().any(|c| c == chain)
    }

    fn is_healthy(&self) -> bool {
        self.health().is_healthy()
    }

    async fn get_wallet_assets(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<Vec<DiscoveredToken>, ProviderError>;

    async fn get_token_balance(
        &self,
        address: &str,
        chain: &str,
        contract: Option<&str>,
    ) -> Result<Decimal, ProviderError>;

    async fn get_token_price(&self, symbol: &str, chain: &str) -> Result<Option<f64>, ProviderError>;
}

/// Per-provider health snapshot (SPEC_FULL §4 supplement, grounded on
/// `data_aggregator.py::get_provider_status`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub provider_type: String,
    pub priority: u8,
    pub is_healthy: bool,
    pub error_count: u32,
    pub max_errors: u32,
    pub supported_chains: Vec<String>,
}

pub fn status_of(provider: &dyn DataProvider, max_errors: u32) -> ProviderStatus {
    ProviderStatus {
        name: provider.kind().name().to_string(),
        provider_type: format!("{:?}", provider.provider_type()),
        priority: provider.priority() as u8,
        is_healthy: provider.is_healthy(),
        error_count: provider.health().error_count(),
        max_errors,
        supported_chains: provider.supported_chains().to_vec(),
    }
}

/// Builds the priority-ordered provider list from configuration (spec §4.2
/// "Registry initialization sorts providers by priority (stable)").
pub fn build_registry(config: &PipelineConfig) -> Vec<Arc<dyn DataProvider>> {
    let mut ordered: Vec<(ProviderPriority, Arc<dyn DataProvider>)> = Vec::new();

    let groups: [(&[String], ProviderPriority); 3] = [
        (&config.primary_providers, ProviderPriority::Primary),
        (&config.secondary_providers, ProviderPriority::Secondary),
        (&config.fallback_providers, ProviderPriority::Fallback),
    ];

    for (names, priority) in groups {
        for name in names {
            let Some(kind) = ProviderKind::from_name(name) else {
                continue;
            };
            let api_key = config.provider_api_keys.get(kind.name()).cloned();
            if let Some(provider) = instantiate(kind, priority, api_key) {
                ordered.push((priority, provider));
            }
        }
    }

    ordered.sort_by_key(|(priority, _)| *priority);
    ordered.into_iter().map(|(_, provider)| provider).collect()
}

fn instantiate(
    kind: ProviderKind,
    priority: ProviderPriority,
    api_key: Option<String>,
) -> Option<Arc<dyn DataProvider>> {
    match kind {
        ProviderKind::Covalent => Some(Arc::new(CovalentProvider::new(priority, api_key))),
        ProviderKind::BlockVisionSui => {
            Some(Arc::new(BlockVisionSuiProvider::new(priority, api_key)))
        }
        ProviderKind::Zerion
        | ProviderKind::Moralis
        | ProviderKind::Zapper
        | ProviderKind::Alchemy
        | ProviderKind::DeBank
        | ProviderKind::Mobula
        | ProviderKind::Bitquery => Some(Arc::new(GenericMultiChainProvider::new(
            kind, priority, api_key,
        ))),
    }
}

pub(crate) fn default_evm_chains() -> Vec<String> {
    vec![
        "ethereum".into(),
        "polygon".into(),
        "bsc".into(),
        "arbitrum".into(),
        "base".into(),
        "optimism".into(),
        "avalanche".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_orders_by_priority() {
        let mut config = PipelineConfig::from_env().unwrap();
        config.primary_providers = vec!["moralis".into()];
        config.secondary_providers = vec!["covalent".into()];
        config.fallback_providers = vec!["blockvision_sui".into()];

        let registry = build_registry(&config);
        assert_eq!(registry[0].kind(), ProviderKind::Moralis);
        assert_eq!(registry[1].kind(), ProviderKind::Covalent);
        assert_eq!(registry[2].kind(), ProviderKind::BlockVisionSui);
    }

    #[test]
    fn health_becomes_unhealthy_at_max() {
        let health = ProviderHealth::new(2);
        assert!(health.is_healthy());
        health.record_error();
        health.record_error();
        assert!(!health.is_healthy());
        health.reset_errors();
        assert!(health.is_healthy());
    }
}
