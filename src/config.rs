//! Configuration for escrow-bridge
//!
//! Loaded from TOML; every field has a serde default so a partial file (or
//! none at all) yields a runnable daemon. Components never hold a copy of the
//! config. They hold a [`ConfigHandle`] and read it when they evaluate, so a
//! reload takes effect on the next cycle.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::BridgeError;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("escrow-bridge")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default)]
    pub lotus: LotusConfig,

    #[serde(default)]
    pub attestation: AttestationConfig,

    #[serde(default)]
    pub expiry: ExpiryConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Chain observer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotusConfig {
    /// Lotus JSON-RPC endpoint
    #[serde(default = "default_lotus_url")]
    pub api_url: String,

    /// Bearer token for the Lotus API (may be empty for public nodes)
    #[serde(default)]
    pub access_token: String,

    /// Comma-separated upstream states after which a deal is no longer polled
    #[serde(default = "default_final_status_list")]
    pub final_status_list: String,

    /// Upstream states treated as "active"
    #[serde(default = "default_active_statuses")]
    pub active_statuses: Vec<String>,

    /// Upstream states treated as "error"
    #[serde(default = "default_error_statuses")]
    pub error_statuses: Vec<String>,

    /// Per-call timeout for chain observer requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum deals polled per reconciliation run
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

/// Multi-party attestation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    /// Distinct signer attestations required before release
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Signer identity used when an ingestion request names none
    #[serde(default)]
    pub default_signer: Option<String>,
}

/// Commitment window used by the expiry sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default = "default_start_epoch_hours")]
    pub start_epoch_hours: u64,

    #[serde(default = "default_expire_days")]
    pub expire_days: u64,
}

/// Cadence of each named job, in seconds (0 disables the rule)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub create_task_secs: u64,

    #[serde(default)]
    pub send_deal_secs: u64,

    #[serde(default = "default_scan_interval")]
    pub scan_deal_status_secs: u64,

    #[serde(default = "default_pay_status_interval")]
    pub update_pay_status_secs: u64,

    #[serde(default = "default_unlock_interval")]
    pub unlock_payment_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_expired_deals_secs: u64,

    /// Age after which another process may take over a held job lock
    #[serde(default = "default_lock_lease")]
    pub lock_lease_secs: u64,
}

fn default_http_port() -> u16 {
    8095
}

fn default_pool_size() -> u32 {
    8
}

fn default_lotus_url() -> String {
    "http://127.0.0.1:1234/rpc/v0".to_string()
}

fn default_final_status_list() -> String {
    "StorageDealActive,StorageDealExpired,StorageDealSlashed,StorageDealError".to_string()
}

fn default_active_statuses() -> Vec<String> {
    vec!["StorageDealActive".to_string(), "active".to_string()]
}

fn default_error_statuses() -> Vec<String> {
    vec![
        "StorageDealError".to_string(),
        "StorageDealFailing".to_string(),
        "StorageDealSlashed".to_string(),
        "error".to_string(),
    ]
}

fn default_request_timeout() -> u64 {
    30
}

fn default_batch_size() -> i64 {
    100
}

fn default_threshold() -> u32 {
    2
}

fn default_start_epoch_hours() -> u64 {
    96
}

fn default_expire_days() -> u64 {
    4
}

fn default_scan_interval() -> u64 {
    300
}

fn default_pay_status_interval() -> u64 {
    600
}

fn default_unlock_interval() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_lock_lease() -> u64 {
    1800
}

impl Default for LotusConfig {
    fn default() -> Self {
        Self {
            api_url: default_lotus_url(),
            access_token: String::new(),
            final_status_list: default_final_status_list(),
            active_statuses: default_active_statuses(),
            error_statuses: default_error_statuses(),
            request_timeout_secs: default_request_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            default_signer: None,
        }
    }
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            start_epoch_hours: default_start_epoch_hours(),
            expire_days: default_expire_days(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            create_task_secs: 0,
            send_deal_secs: 0,
            scan_deal_status_secs: default_scan_interval(),
            update_pay_status_secs: default_pay_status_interval(),
            unlock_payment_secs: default_unlock_interval(),
            sweep_expired_deals_secs: default_sweep_interval(),
            lock_lease_secs: default_lock_lease(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            pool_size: default_pool_size(),
            lotus: LotusConfig::default(),
            attestation: AttestationConfig::default(),
            expiry: ExpiryConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), BridgeError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check required fields
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.lotus.api_url.trim().is_empty() {
            return Err(BridgeError::Config("lotus.api_url is required".into()));
        }
        if self.attestation.threshold == 0 {
            return Err(BridgeError::Config("attestation.threshold must be at least 1".into()));
        }
        if self.pool_size == 0 {
            return Err(BridgeError::Config("pool_size must be at least 1".into()));
        }
        if self.lotus.batch_size <= 0 {
            return Err(BridgeError::Config("lotus.batch_size must be positive".into()));
        }
        Ok(())
    }

    /// SQLite database path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("escrow-bridge.db")
    }

    /// Default config file location inside the data directory
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

impl LotusConfig {
    /// Parsed final status list, lowercased, blanks dropped
    pub fn final_status_set(&self) -> Vec<String> {
        self.final_status_list
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ExpiryConfig {
    /// Time after creation beyond which a deal that never activated is expired
    pub fn commitment_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.start_epoch_hours as i64)
            + chrono::Duration::days(self.expire_days as i64)
    }
}

// =============================================================================
// Shared handle
// =============================================================================

/// Shared, reloadable configuration.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot of the current configuration
    pub fn current(&self) -> Config {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Attestation threshold as of now
    pub fn threshold(&self) -> u32 {
        self.read(|c| c.attestation.threshold)
    }

    pub fn lotus(&self) -> LotusConfig {
        self.read(|c| c.lotus.clone())
    }

    pub fn expiry(&self) -> ExpiryConfig {
        self.read(|c| c.expiry.clone())
    }

    /// Swap in a new configuration after validating it
    pub fn replace(&self, config: Config) -> Result<(), BridgeError> {
        config.validate()?;
        let mut guard = self
            .inner
            .write()
            .map_err(|e| BridgeError::Internal(format!("Config lock poisoned: {}", e)))?;
        *guard = config;
        Ok(())
    }

    /// Re-read the config file and swap it in
    pub fn reload<P: AsRef<Path>>(&self, path: P) -> Result<(), BridgeError> {
        let config = Config::load(path)?;
        self.replace(config)
    }

    fn read<T>(&self, f: impl FnOnce(&Config) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            http_port = 9000

            [attestation]
            threshold = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.http_port, 9000);
        assert_eq!(config.attestation.threshold, 3);
        assert_eq!(config.lotus.batch_size, 100);
        assert_eq!(config.schedule.scan_deal_status_secs, 300);
        assert_eq!(config.schedule.create_task_secs, 0);
    }

    #[test]
    fn test_final_status_set_is_case_folded() {
        let lotus = LotusConfig {
            final_status_list: " StorageDealActive, ,StorageDealError ".to_string(),
            ..LotusConfig::default()
        };
        assert_eq!(
            lotus.final_status_set(),
            vec!["storagedealactive".to_string(), "storagedealerror".to_string()]
        );
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = Config::default();
        config.attestation.threshold = 0;
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_commitment_window() {
        let expiry = ExpiryConfig {
            start_epoch_hours: 24,
            expire_days: 6,
        };
        assert_eq!(expiry.commitment_window(), chrono::Duration::days(7));
    }

    #[test]
    fn test_handle_reload_is_visible_to_clones() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let handle = ConfigHandle::new(Config::default());
        let reader = handle.clone();
        assert_eq!(reader.threshold(), 2);

        let mut updated = Config::default();
        updated.attestation.threshold = 5;
        updated.save(&path).unwrap();

        handle.reload(&path).unwrap();
        assert_eq!(reader.threshold(), 5);
    }
}
