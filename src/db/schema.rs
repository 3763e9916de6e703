//! Diesel table definitions and idempotent schema creation

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use tracing::info;

use crate::error::BridgeError;

diesel::table! {
    content_records (fingerprint) {
        fingerprint -> Text,
        size_bytes -> BigInt,
        upload_status -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    escrow_records (fingerprint) {
        fingerprint -> Text,
        locked_amount -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    deals (id) {
        id -> Text,
        deal_cid -> Text,
        deal_id -> Nullable<BigInt>,
        fingerprint -> Text,
        provider_id -> Text,
        verified -> Bool,
        committed_duration_epochs -> BigInt,
        deal_status -> Text,
        lock_payment_status -> Text,
        upstream_status -> Nullable<Text>,
        cost_computed -> Nullable<Text>,
        version -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    deal_transitions (id) {
        id -> Integer,
        deal_ref -> Text,
        from_status -> Text,
        to_status -> Text,
        from_lock_status -> Text,
        to_lock_status -> Text,
        source -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    attestations (deal_id, signer_id) {
        deal_id -> BigInt,
        signer_id -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    release_records (fingerprint) {
        fingerprint -> Text,
        released_amount -> Text,
        deal_ref -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    refund_dispatches (deal_ref) {
        deal_ref -> Text,
        attempts -> Integer,
        last_dispatched_at -> Text,
    }
}

diesel::table! {
    job_locks (job_name) {
        job_name -> Text,
        holder -> Text,
        acquired_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    content_records,
    escrow_records,
    deals,
    deal_transitions,
    attestations,
    release_records,
    refund_dispatches,
);

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS content_records (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    size_bytes BIGINT NOT NULL,
    upload_status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS escrow_records (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    locked_amount TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deals (
    id TEXT PRIMARY KEY NOT NULL,
    deal_cid TEXT NOT NULL DEFAULT '',
    deal_id BIGINT,
    fingerprint TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    committed_duration_epochs BIGINT NOT NULL,
    deal_status TEXT NOT NULL,
    lock_payment_status TEXT NOT NULL,
    upstream_status TEXT,
    cost_computed TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deals_fingerprint ON deals(fingerprint);
CREATE INDEX IF NOT EXISTS idx_deals_deal_id ON deals(deal_id);
CREATE INDEX IF NOT EXISTS idx_deals_lock_status ON deals(lock_payment_status);

CREATE TABLE IF NOT EXISTS deal_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    deal_ref TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    from_lock_status TEXT NOT NULL,
    to_lock_status TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deal_transitions_deal ON deal_transitions(deal_ref);

CREATE TABLE IF NOT EXISTS attestations (
    deal_id BIGINT NOT NULL,
    signer_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (deal_id, signer_id)
);

CREATE TABLE IF NOT EXISTS release_records (
    fingerprint TEXT PRIMARY KEY NOT NULL,
    released_amount TEXT NOT NULL,
    deal_ref TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS refund_dispatches (
    deal_ref TEXT PRIMARY KEY NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_dispatched_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_locks (
    job_name TEXT PRIMARY KEY NOT NULL,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
"#;

/// Create all tables and indexes if missing
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), BridgeError> {
    conn.batch_execute(SCHEMA_SQL)
        .map_err(|e| BridgeError::Internal(format!("Failed to create schema: {}", e)))?;
    info!("Escrow bridge tables initialized");
    Ok(())
}
