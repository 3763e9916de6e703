//! Lotus JSON-RPC chain observer
//!
//! Calls `Filecoin.ClientGetDealInfo` and reduces the response to the fields
//! the reconciler reads. Prices arrive in attoFIL per epoch.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ChainDealInfo, ChainObserver};
use crate::config::LotusConfig;
use crate::error::BridgeError;

const ATTO_PER_FIL: i64 = 1_000_000_000_000_000_000;

/// Storage market deal state names, indexed by their numeric code
const DEAL_STATES: &[&str] = &[
    "StorageDealUnknown",
    "StorageDealProposalNotFound",
    "StorageDealProposalRejected",
    "StorageDealProposalAccepted",
    "StorageDealStaged",
    "StorageDealSealing",
    "StorageDealFinalizing",
    "StorageDealActive",
    "StorageDealExpired",
    "StorageDealSlashed",
    "StorageDealRejecting",
    "StorageDealFailing",
    "StorageDealFundsReserved",
    "StorageDealCheckForAcceptance",
    "StorageDealValidating",
    "StorageDealAcceptWait",
    "StorageDealStartDataTransfer",
    "StorageDealTransferring",
    "StorageDealWaitingForData",
    "StorageDealVerifyData",
    "StorageDealReserveProviderFunds",
    "StorageDealReserveClientFunds",
    "StorageDealProviderFunding",
    "StorageDealClientFunding",
    "StorageDealPublish",
    "StorageDealPublishing",
    "StorageDealError",
    "StorageDealProviderTransferAwaitRestart",
    "StorageDealClientTransferRestart",
    "StorageDealAwaitingPreCommit",
];

pub fn deal_state_name(code: u64) -> &'static str {
    DEAL_STATES
        .get(code as usize)
        .copied()
        .unwrap_or("StorageDealUnknown")
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<LotusDealInfo>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LotusDealInfo {
    state: u64,
    #[serde(rename = "DealID", default)]
    deal_id: i64,
    #[serde(default)]
    price_per_epoch: String,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    verified: bool,
}

/// Total deal cost in FIL
fn compute_cost(price_per_epoch: &str, duration: u64) -> Result<Decimal, BridgeError> {
    if price_per_epoch.is_empty() {
        return Ok(Decimal::ZERO);
    }
    let price = Decimal::from_str(price_per_epoch).map_err(|e| {
        BridgeError::Upstream(format!("bad PricePerEpoch '{}': {}", price_per_epoch, e))
    })?;
    price
        .checked_mul(Decimal::from(duration))
        .and_then(|total| total.checked_div(Decimal::from(ATTO_PER_FIL)))
        .map(|fil| fil.normalize())
        .ok_or_else(|| BridgeError::Upstream("deal cost overflow".into()))
}

pub struct LotusChainObserver {
    client: reqwest::Client,
    api_url: String,
    access_token: String,
}

impl LotusChainObserver {
    pub fn new(config: &LotusConfig) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BridgeError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            access_token: config.access_token.clone(),
        })
    }
}

#[async_trait::async_trait]
impl ChainObserver for LotusChainObserver {
    async fn get_deal_info(&self, deal_cid: &str) -> Result<ChainDealInfo, BridgeError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "Filecoin.ClientGetDealInfo",
            "params": [{ "/": deal_cid }],
            "id": 1,
        });

        let mut request = self.client.post(&self.api_url).json(&body);
        if !self.access_token.is_empty() {
            request = request.bearer_auth(&self.access_token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::Upstream(format!(
                "lotus returned HTTP {}",
                response.status()
            )));
        }

        let rpc: RpcResponse = response.json().await?;
        if let Some(err) = rpc.error {
            return Err(BridgeError::Upstream(format!(
                "lotus error {}: {}",
                err.code, err.message
            )));
        }
        let info = rpc
            .result
            .ok_or_else(|| BridgeError::Upstream("lotus response without result".into()))?;

        debug!(deal_cid, state = info.state, deal_id = info.deal_id, "Lotus deal info");

        Ok(ChainDealInfo {
            status: deal_state_name(info.state).to_string(),
            verified: info.verified,
            deal_id: info.deal_id,
            cost_computed: compute_cost(&info.price_per_epoch, info.duration)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(deal_state_name(7), "StorageDealActive");
        assert_eq!(deal_state_name(26), "StorageDealError");
        assert_eq!(deal_state_name(999), "StorageDealUnknown");
    }

    #[test]
    fn test_compute_cost() {
        let cost = compute_cost("500000000", 1_540_000).unwrap();
        assert_eq!(cost, Decimal::from_str("0.00077").unwrap());
        assert_eq!(compute_cost("", 10).unwrap(), Decimal::ZERO);
        assert!(compute_cost("abc", 10).is_err());
    }

    #[test]
    fn test_parse_rpc_response() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "ProposalCid": {"/": "bafyreia"},
                "State": 7,
                "DealID": 4242,
                "PricePerEpoch": "1000",
                "Duration": 518400,
                "Verified": true
            }
        }"#;
        let rpc: RpcResponse = serde_json::from_str(raw).unwrap();
        let info = rpc.result.unwrap();
        assert_eq!(info.state, 7);
        assert_eq!(info.deal_id, 4242);
        assert!(info.verified);
    }
}
