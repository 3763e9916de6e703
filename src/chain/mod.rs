//! Chain observer - read-only view of on-chain deal state
//!
//! The reconciler only depends on [`ChainObserver`]; the Lotus client is one
//! implementation, tests supply their own.

pub mod lotus;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::LotusConfig;
use crate::error::BridgeError;

pub use lotus::LotusChainObserver;

/// Fields of an on-chain deal that drive local state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDealInfo {
    pub status: String,
    pub verified: bool,
    pub deal_id: i64,
    pub cost_computed: Decimal,
}

/// Trait for querying deal state (allows mocking in tests)
#[async_trait::async_trait]
pub trait ChainObserver: Send + Sync {
    /// Current state of the deal identified by its proposal CID.
    ///
    /// Network failures must come back as `Upstream` or `Timeout` so callers
    /// can tell them apart from a deal that is genuinely in error.
    async fn get_deal_info(&self, deal_cid: &str) -> Result<ChainDealInfo, BridgeError>;
}

/// How an upstream status string maps onto the local lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamClass {
    Active,
    Error,
    Pending,
}

/// Case-insensitive match against the configured active/error aliases
pub fn classify(status: &str, lotus: &LotusConfig) -> UpstreamClass {
    let status = status.trim();
    if lotus
        .active_statuses
        .iter()
        .any(|s| s.eq_ignore_ascii_case(status))
    {
        UpstreamClass::Active
    } else if lotus
        .error_statuses
        .iter()
        .any(|s| s.eq_ignore_ascii_case(status))
    {
        UpstreamClass::Error
    } else {
        UpstreamClass::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_default_aliases() {
        let lotus = LotusConfig::default();
        assert_eq!(classify("StorageDealActive", &lotus), UpstreamClass::Active);
        assert_eq!(classify("ACTIVE", &lotus), UpstreamClass::Active);
        assert_eq!(classify("storagedealerror", &lotus), UpstreamClass::Error);
        assert_eq!(classify("StorageDealSealing", &lotus), UpstreamClass::Pending);
        assert_eq!(classify("", &lotus), UpstreamClass::Pending);
    }
}
