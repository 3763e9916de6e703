//! Row models and lifecycle enums
//!
//! Status columns are stored as TEXT and parsed into enums on read, so every
//! value that leaves the database has already been checked.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::schema::{
    attestations, content_records, deal_transitions, deals, escrow_records, release_records,
};
use crate::error::BridgeError;

// ============================================================================
// Timestamps
// ============================================================================

/// Current UTC time in the stored format
pub fn current_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Fixed-width RFC 3339 with milliseconds, so TEXT ordering matches time ordering
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, BridgeError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BridgeError::Internal(format!("Bad timestamp '{}': {}", value, e)))
}

pub fn parse_amount(value: &str) -> Result<Decimal, BridgeError> {
    Decimal::from_str(value)
        .map_err(|e| BridgeError::Internal(format!("Bad amount '{}': {}", value, e)))
}

// ============================================================================
// Lifecycle enums
// ============================================================================

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BridgeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BridgeError::Internal(format!(
                        "Unknown {} '{}'", stringify!($name), other
                    ))),
                }
            }
        }
    };
}

/// Upload state of a content record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Created,
    Packaged,
    Stored,
    Failed,
}

text_enum!(UploadStatus {
    Created => "created",
    Packaged => "packaged",
    Stored => "stored",
    Failed => "failed",
});

/// On-chain lifecycle of a deal as tracked locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    Proposed,
    Published,
    Active,
    Error,
    Expired,
}

text_enum!(DealStatus {
    Proposed => "proposed",
    Published => "published",
    Active => "active",
    Error => "error",
    Expired => "expired",
});

impl DealStatus {
    fn rank(&self) -> u8 {
        match self {
            DealStatus::Proposed => 0,
            DealStatus::Published => 1,
            DealStatus::Active => 2,
            DealStatus::Error | DealStatus::Expired => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DealStatus::Error | DealStatus::Expired)
    }

    /// Whether moving from `self` to `next` is allowed. Staying put is allowed.
    pub fn can_transition_to(&self, next: DealStatus) -> bool {
        if *self == next {
            return true;
        }
        match next {
            DealStatus::Proposed | DealStatus::Published | DealStatus::Active => {
                !self.is_terminal() && next.rank() > self.rank()
            }
            DealStatus::Error => !self.is_terminal(),
            DealStatus::Expired => matches!(self, DealStatus::Proposed | DealStatus::Published),
        }
    }
}

/// Escrow payment state attached to a deal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPaymentStatus {
    Created,
    Processing,
    Success,
    Refunding,
    Refunded,
}

text_enum!(LockPaymentStatus {
    Created => "created",
    Processing => "processing",
    Success => "success",
    Refunding => "refunding",
    Refunded => "refunded",
});

impl LockPaymentStatus {
    /// States the reconciler no longer polls
    pub const SETTLED: [LockPaymentStatus; 3] = [
        LockPaymentStatus::Success,
        LockPaymentStatus::Refunding,
        LockPaymentStatus::Refunded,
    ];

    pub fn can_transition_to(&self, next: LockPaymentStatus) -> bool {
        use LockPaymentStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Processing)
                | (Created, Refunding)
                | (Processing, Success)
                | (Processing, Refunding)
                | (Refunding, Refunded)
        )
    }
}

// ============================================================================
// Content + escrow rows
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = content_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ContentRecordRow {
    pub fingerprint: String,
    pub size_bytes: i64,
    pub upload_status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = escrow_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EscrowRecordRow {
    pub fingerprint: String,
    pub locked_amount: String,
    pub created_at: String,
}

/// Locked payment for one fingerprint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowRecord {
    pub fingerprint: String,
    pub locked_amount: Decimal,
    pub created_at: String,
}

impl TryFrom<EscrowRecordRow> for EscrowRecord {
    type Error = BridgeError;

    fn try_from(row: EscrowRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            locked_amount: parse_amount(&row.locked_amount)?,
            fingerprint: row.fingerprint,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = release_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ReleaseRecordRow {
    pub fingerprint: String,
    pub released_amount: String,
    pub deal_ref: String,
    pub created_at: String,
}

/// Proof that escrow for a fingerprint was released
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub fingerprint: String,
    pub released_amount: Decimal,
    pub deal_ref: String,
    pub created_at: String,
}

impl TryFrom<ReleaseRecordRow> for ReleaseRecord {
    type Error = BridgeError;

    fn try_from(row: ReleaseRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            released_amount: parse_amount(&row.released_amount)?,
            fingerprint: row.fingerprint,
            deal_ref: row.deal_ref,
            created_at: row.created_at,
        })
    }
}

// ============================================================================
// Deals
// ============================================================================

#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = deals)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DealRow {
    pub id: String,
    pub deal_cid: String,
    pub deal_id: Option<i64>,
    pub fingerprint: String,
    pub provider_id: String,
    pub verified: bool,
    pub committed_duration_epochs: i64,
    pub deal_status: String,
    pub lock_payment_status: String,
    pub upstream_status: Option<String>,
    pub cost_computed: Option<String>,
    pub version: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = deals)]
pub struct NewDealRow<'a> {
    pub id: &'a str,
    pub deal_cid: &'a str,
    pub deal_id: Option<i64>,
    pub fingerprint: &'a str,
    pub provider_id: &'a str,
    pub verified: bool,
    pub committed_duration_epochs: i64,
    pub deal_status: &'a str,
    pub lock_payment_status: &'a str,
    pub version: i32,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// A storage deal for one fingerprint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    /// Local identifier
    pub id: String,
    pub deal_cid: String,
    /// Chain-assigned numeric id, known once the deal is published
    pub deal_id: Option<i64>,
    pub fingerprint: String,
    pub provider_id: String,
    pub verified: bool,
    pub committed_duration_epochs: i64,
    pub deal_status: DealStatus,
    pub lock_payment_status: LockPaymentStatus,
    pub upstream_status: Option<String>,
    pub cost_computed: Option<Decimal>,
    pub version: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<DealRow> for Deal {
    type Error = BridgeError;

    fn try_from(row: DealRow) -> Result<Self, Self::Error> {
        Ok(Self {
            deal_status: row.deal_status.parse()?,
            lock_payment_status: row.lock_payment_status.parse()?,
            cost_computed: row.cost_computed.as_deref().map(parse_amount).transpose()?,
            id: row.id,
            deal_cid: row.deal_cid,
            deal_id: row.deal_id,
            fingerprint: row.fingerprint,
            provider_id: row.provider_id,
            verified: row.verified,
            committed_duration_epochs: row.committed_duration_epochs,
            upstream_status: row.upstream_status,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ============================================================================
// Transitions + attestations
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = deal_transitions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[serde(rename_all = "camelCase")]
pub struct DealTransition {
    pub id: i32,
    pub deal_ref: String,
    pub from_status: String,
    pub to_status: String,
    pub from_lock_status: String,
    pub to_lock_status: String,
    pub source: String,
    pub created_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = deal_transitions)]
pub struct NewDealTransition<'a> {
    pub deal_ref: &'a str,
    pub from_status: &'a str,
    pub to_status: &'a str,
    pub from_lock_status: &'a str,
    pub to_lock_status: &'a str,
    pub source: &'a str,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = attestations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub deal_id: i64,
    pub signer_id: String,
    pub created_at: String,
}
