//! Local store capability and typed wrapper
//!
//! The settlement core owns no persistence engine. It consumes a simple
//! key-addressed store (`LocalStore`) provided by the host: JSON rows in
//! named tables plus a flat key/value space for counters and cursors.
//! `WalletDb` layers the typed record accessors on top. `MemoryStore` is a
//! complete in-memory implementation used by tests and by hosts that keep
//! their own source of truth elsewhere.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::{WalletError, WalletResult};
use crate::types::{MintInfoRecord, PendingPaymentIntent, TokenRecord, TokenState};
use crate::utils::now_secs;

// =============================================================================
// Table & Key Names
// =============================================================================

/// Token record table
pub const TABLE_TOKENS: &str = "tokens";
/// Mint info table
pub const TABLE_MINTS: &str = "mints";
/// Promise record table
pub const TABLE_PROMISES: &str = "promises";
/// Applied settlement table
pub const TABLE_SETTLEMENTS: &str = "settlements";
/// Offline payment intent table
pub const TABLE_PENDING_PAYMENTS: &str = "pending_payments";

/// Version prefix for per-owner key spaces
pub const KEY_VERSION: &str = "v1";

/// Composite key for a counter entry
pub fn counter_key(mint_url: &str, unit: &str, keyset_id: &str) -> String {
    format!("{}:counter:{}:{}:{}", KEY_VERSION, mint_url, unit, keyset_id)
}

/// Composite key for a restore cursor
pub fn cursor_key(mint_url: &str, unit: &str, keyset_id: &str) -> String {
    format!("{}:cursor:{}:{}:{}", KEY_VERSION, mint_url, unit, keyset_id)
}

// =============================================================================
// Capability Trait
// =============================================================================

/// Key-addressed local store consumed by the settlement core
///
/// Reads reflect every prior completed write from the same task; the core
/// applies its own soft-delete filtering and dedup on top.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert a row; overwrites any row with the same id
    async fn insert(&self, table: &str, id: &str, row: Value) -> WalletResult<()>;

    /// Update an existing row; inserting when absent is acceptable
    async fn update(&self, table: &str, id: &str, row: Value) -> WalletResult<()>;

    /// Fetch a single row
    async fn get(&self, table: &str, id: &str) -> WalletResult<Option<Value>>;

    /// Fetch all rows of a table
    async fn list(&self, table: &str) -> WalletResult<Vec<Value>>;

    /// Write a flat key/value entry (counters, cursors)
    async fn put_kv(&self, key: &str, value: String) -> WalletResult<()>;

    /// Read a flat key/value entry
    async fn get_kv(&self, key: &str) -> WalletResult<Option<String>>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory `LocalStore` over `Arc<RwLock<...>>` maps
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, HashMap<String, Value>>>>,
    kv: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn insert(&self, table: &str, id: &str, row: Value) -> WalletResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), row);
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, row: Value) -> WalletResult<()> {
        self.insert(table, id, row).await
    }

    async fn get(&self, table: &str, id: &str) -> WalletResult<Option<Value>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn list(&self, table: &str) -> WalletResult<Vec<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_kv(&self, key: &str, value: String) -> WalletResult<()> {
        let mut kv = self.kv.write().await;
        kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> WalletResult<Option<String>> {
        let kv = self.kv.read().await;
        Ok(kv.get(key).cloned())
    }
}

// =============================================================================
// Typed Wrapper
// =============================================================================

/// Typed record accessors over a `LocalStore`
#[derive(Clone)]
pub struct WalletDb {
    store: Arc<dyn LocalStore>,
}

impl WalletDb {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Raw store handle, for counter/cursor key access
    pub fn raw(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Vec<T> {
        // Rows that fail to decode are skipped rather than failing the read;
        // a host may store newer schema versions alongside ours.
        rows.into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect()
    }

    fn encode<T: serde::Serialize>(record: &T) -> WalletResult<Value> {
        serde_json::to_value(record).map_err(|e| WalletError::Database(e.to_string()))
    }

    // ==========================================================================
    // Token Records
    // ==========================================================================

    /// All token records, including deleted ones
    pub async fn all_tokens(&self) -> WalletResult<Vec<TokenRecord>> {
        Ok(Self::decode_rows(self.store.list(TABLE_TOKENS).await?))
    }

    /// Live (non-deleted, accepted) token records, deduplicated on read so
    /// a bearer text double-persisted by overlapping writers counts once
    pub async fn live_tokens(&self) -> WalletResult<Vec<TokenRecord>> {
        Ok(crate::dedup::dedupe_tokens(self.all_tokens().await?)
            .into_iter()
            .filter(|t| t.is_live())
            .collect())
    }

    /// Persist a token record
    pub async fn insert_token(&self, record: &TokenRecord) -> WalletResult<()> {
        self.store
            .insert(TABLE_TOKENS, &record.id, Self::encode(record)?)
            .await
    }

    /// Soft-delete a token record
    pub async fn soft_delete_token(&self, record_id: &str) -> WalletResult<()> {
        if let Some(row) = self.store.get(TABLE_TOKENS, record_id).await? {
            if let Ok(mut record) = serde_json::from_value::<TokenRecord>(row) {
                record.deleted = true;
                self.store
                    .update(TABLE_TOKENS, record_id, Self::encode(&record)?)
                    .await?;
            }
        }
        Ok(())
    }

    /// Mark a token record terminally invalid with the mint's reason
    pub async fn mark_token_invalid(&self, record_id: &str, detail: &str) -> WalletResult<()> {
        if let Some(row) = self.store.get(TABLE_TOKENS, record_id).await? {
            if let Ok(mut record) = serde_json::from_value::<TokenRecord>(row) {
                record.state = TokenState::Error;
                record.error_text = Some(detail.to_string());
                self.store
                    .update(TABLE_TOKENS, record_id, Self::encode(&record)?)
                    .await?;
            }
        }
        Ok(())
    }

    // ==========================================================================
    // Mint Records
    // ==========================================================================

    pub async fn all_mints(&self) -> WalletResult<Vec<MintInfoRecord>> {
        Ok(Self::decode_rows(self.store.list(TABLE_MINTS).await?))
    }

    pub async fn upsert_mint(&self, record: &MintInfoRecord) -> WalletResult<()> {
        self.store
            .update(TABLE_MINTS, &record.mint_url, Self::encode(record)?)
            .await
    }

    /// Record that a mint was just interacted with, creating the row on first
    /// contact
    pub async fn touch_mint(&self, mint_url: &str) -> WalletResult<()> {
        let existing = self
            .store
            .get(TABLE_MINTS, mint_url)
            .await?
            .and_then(|row| serde_json::from_value::<MintInfoRecord>(row).ok());

        let mut record = existing.unwrap_or(MintInfoRecord {
            mint_url: mint_url.to_string(),
            name: None,
            icon_url: None,
            input_fee_ppk: 0,
            supports_mpp: false,
            supports_restore: false,
            last_seen: 0,
            last_checked: 0,
            deleted: false,
        });
        record.last_seen = now_secs();
        self.upsert_mint(&record).await
    }

    // ==========================================================================
    // Payment Intents
    // ==========================================================================

    pub async fn pending_payments(&self) -> WalletResult<Vec<PendingPaymentIntent>> {
        let mut intents: Vec<PendingPaymentIntent> =
            Self::decode_rows(self.store.list(TABLE_PENDING_PAYMENTS).await?);
        intents.sort_by_key(|i| i.created_at);
        Ok(intents)
    }

    pub async fn insert_pending_payment(&self, intent: &PendingPaymentIntent) -> WalletResult<()> {
        self.store
            .insert(TABLE_PENDING_PAYMENTS, &intent.id, Self::encode(intent)?)
            .await
    }

    /// Remove a replayed or poisoned intent; hard delete is correct here,
    /// intents carry no bearer value
    pub async fn remove_pending_payment(&self, intent_id: &str) -> WalletResult<()> {
        self.store
            .update(TABLE_PENDING_PAYMENTS, intent_id, Value::Null)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token(id: &str, amount: u64) -> TokenRecord {
        TokenRecord {
            id: id.to_string(),
            encoded_token: format!("cashuBtest{}", id),
            raw_token: None,
            mint_url: "https://mint.example.com".into(),
            unit: "sat".into(),
            amount,
            state: TokenState::Accepted,
            error_text: None,
            deleted: false,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row() {
        let db = WalletDb::new(Arc::new(MemoryStore::new()));
        db.insert_token(&sample_token("a", 10)).await.unwrap();
        db.soft_delete_token("a").await.unwrap();

        assert!(db.live_tokens().await.unwrap().is_empty());
        let all = db.all_tokens().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].deleted);
    }

    #[tokio::test]
    async fn test_mark_invalid_sets_error_state() {
        let db = WalletDb::new(Arc::new(MemoryStore::new()));
        db.insert_token(&sample_token("a", 10)).await.unwrap();
        db.mark_token_invalid("a", "already spent").await.unwrap();

        let all = db.all_tokens().await.unwrap();
        assert_eq!(all[0].state, TokenState::Error);
        assert_eq!(all[0].error_text.as_deref(), Some("already spent"));
        assert!(db.live_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_payments_sorted_by_age() {
        let db = WalletDb::new(Arc::new(MemoryStore::new()));
        for (id, created_at) in [("b", 20u64), ("a", 10u64)] {
            db.insert_pending_payment(&PendingPaymentIntent {
                id: id.into(),
                contact_id: "c1".into(),
                amount_sat: 5,
                created_at,
                message_id: None,
            })
            .await
            .unwrap();
        }

        let intents = db.pending_payments().await.unwrap();
        assert_eq!(intents[0].id, "a");
        assert_eq!(intents[1].id, "b");
    }
}
