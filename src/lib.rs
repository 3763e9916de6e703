//! Escrow Bridge - deal reconciliation and escrow release for storage deals
//!
//! Sits between an upload workflow that locks funds per content fingerprint
//! and a Filecoin node that reports how each storage deal is doing.
//!
//! ## Flow
//!
//! ```text
//! upload ──► content_records + escrow_records (locked amount)
//!              │
//! deal submission ──► deals (proposed / published)
//!              │
//! scan-deal-status ──► ChainObserver ──► deals (active / error, lock status)
//!              │
//! signers ──► attestations (deal_id, signer_id)
//!              │
//! unlock-payment ──► release_records (once per fingerprint) ──► deal success
//!              │
//! update-pay-status ──► RefundBroadcaster for error / expired deals
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! $XDG_DATA_HOME/escrow-bridge/
//! ├── escrow-bridge.db  # SQLite (WAL)
//! └── config.toml       # Configuration
//! ```

pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod services;
pub mod validation;

// Re-exports
pub use chain::{ChainDealInfo, ChainObserver, LotusChainObserver};
pub use config::{Config, ConfigHandle};
pub use error::BridgeError;
pub use http::HttpServer;
pub use scheduler::{JobName, Scheduler};
pub use services::{LoggingRefundBroadcaster, RefundBroadcaster, RefundRequest, Services};
