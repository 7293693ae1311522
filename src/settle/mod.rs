//! Settlement orchestration
//!
//! Turns "send amount X" into ecash protocol operations against one or
//! more mints: receive, send-split and melt, each guarded by the
//! per-(mint, unit, keyset) counter lock, with signature-conflict retry,
//! recovery-token persistence and the local-merge fee fallback.
//!
//! - Receiving inbound tokens: [`receive`]
//! - Splitting for outbound sends and local merges: [`send`]
//! - Melting to external payment requests: [`melt`]

pub mod melt;
pub mod receive;
pub mod send;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cdk::nuts::Proofs;

use crate::counters::{CounterKey, CounterStore, COUNTER_CONFLICT_SKIP, MAX_COUNTER_ATTEMPTS};
use crate::ecash::{DecodedToken, EcashClient, MintSnapshot, SwapSplit};
use crate::errors::{is_signature_conflict_text, WalletError, WalletResult};
use crate::store::WalletDb;
use crate::types::{MintBalance, TokenRecord};
use crate::utils::{normalize_mint_url, now_secs, with_retry};

/// Proofs per mint-state-check batch; large wallets are synced in pages to
/// stay under mint API limits
pub const MAX_STATE_CHECK_BATCH: usize = 200;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for the settlement engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on any single mint call
    pub mint_timeout: Duration,
    /// Cap on total outstanding issued Credo credit
    pub credit_cap: u64,
    /// Default promise lifetime
    pub promise_ttl_secs: u64,
    /// Recent-window size for restore scans (indices)
    pub restore_window: u32,
    /// Indices per restore batch request
    pub restore_batch: u32,
    /// Max proofs per persisted restored record
    pub restore_chunk: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mint_timeout: Duration::from_secs(15),
            credit_cap: 50_000,
            promise_ttl_secs: 30 * 24 * 3600,
            restore_window: 300,
            restore_batch: 100,
            restore_chunk: 200,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The settlement engine: ecash operations over the capability client,
/// guarded by the counter store
#[derive(Clone)]
pub struct SettlementEngine {
    pub(crate) client: Arc<dyn EcashClient>,
    pub(crate) db: WalletDb,
    pub(crate) counters: CounterStore,
    pub(crate) config: EngineConfig,
}

impl SettlementEngine {
    pub fn new(
        client: Arc<dyn EcashClient>,
        db: WalletDb,
        counters: CounterStore,
        config: EngineConfig,
    ) -> Self {
        Self { client, db, counters, config }
    }

    pub fn db(&self) -> &WalletDb {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==========================================================================
    // Bounded Mint Calls
    // ==========================================================================

    /// Run a mint call under the configured timeout; elapsing classifies as
    /// a transient network failure, eligible for candidate fallback
    pub(crate) async fn bounded<T, F>(&self, operation: F) -> WalletResult<T>
    where
        F: Future<Output = WalletResult<T>>,
    {
        match tokio::time::timeout(self.config.mint_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(WalletError::TransientNetwork {
                detail: format!("mint call exceeded {:?}", self.config.mint_timeout),
            }),
        }
    }

    /// Load a mint snapshot and record the contact in the mint registry
    pub(crate) async fn load_mint(&self, mint_url: &str) -> WalletResult<MintSnapshot> {
        let mint_url = normalize_mint_url(mint_url);
        let snapshot = self.bounded(self.client.load_mint(&mint_url)).await?;
        self.db.touch_mint(&mint_url).await?;
        Ok(snapshot)
    }

    pub(crate) fn counter_key_for(&self, mint: &MintSnapshot) -> CounterKey {
        CounterKey::new(
            &normalize_mint_url(&mint.mint_url),
            &mint.unit.to_string(),
            &mint.active_keyset.to_string(),
        )
    }

    // ==========================================================================
    // Counter-Guarded Operations
    // ==========================================================================

    /// Skip the counter forward before a retry and surface the typed
    /// conflict error once the attempt budget is spent
    pub(crate) async fn skip_on_conflict(&self, key: &CounterKey, attempt: u32) -> WalletResult<()> {
        if attempt > 0 {
            log::warn!(
                "Counter conflict at {}, skipping {} (attempt {}/{})",
                key,
                COUNTER_CONFLICT_SKIP,
                attempt + 1,
                MAX_COUNTER_ATTEMPTS
            );
            self.counters.advance(key, COUNTER_CONFLICT_SKIP).await?;
        }
        Ok(())
    }

    pub(crate) fn conflict_exhausted(err: WalletError) -> WalletError {
        if is_counter_conflict(&err) {
            WalletError::SignatureConflict { attempts: MAX_COUNTER_ATTEMPTS }
        } else {
            err
        }
    }

    /// Swap under the counter lock with signature-conflict skip-and-retry
    pub(crate) async fn swap_with_counter(
        &self,
        mint: &MintSnapshot,
        amount: u64,
        proofs: Proofs,
    ) -> WalletResult<SwapSplit> {
        let key = self.counter_key_for(mint);
        let _guard = self.counters.lock(&key).await;

        with_retry(MAX_COUNTER_ATTEMPTS, is_counter_conflict, |attempt| {
            let proofs = proofs.clone();
            let key = &key;
            async move {
                self.skip_on_conflict(key, attempt).await?;
                let counter = self.counters.next_counter(key).await?;
                let split = self
                    .bounded(self.client.swap(&mint.mint_url, amount, proofs, counter))
                    .await?;
                self.counters.advance(key, split.outputs_used()).await?;
                Ok(split)
            }
        })
        .await
        .map_err(Self::conflict_exhausted)
    }

    /// Receive under the counter lock with signature-conflict skip-and-retry
    pub(crate) async fn receive_with_counter(
        &self,
        mint: &MintSnapshot,
        decoded: &DecodedToken,
    ) -> WalletResult<Proofs> {
        let key = self.counter_key_for(mint);
        let _guard = self.counters.lock(&key).await;

        with_retry(MAX_COUNTER_ATTEMPTS, is_counter_conflict, |attempt| {
            let key = &key;
            async move {
                self.skip_on_conflict(key, attempt).await?;
                let counter = self.counters.next_counter(key).await?;
                let fresh = self.bounded(self.client.receive(decoded, counter)).await?;
                self.counters.advance(key, fresh.len() as u32).await?;
                Ok(fresh)
            }
        })
        .await
        .map_err(Self::conflict_exhausted)
    }

    // ==========================================================================
    // Balance Queries
    // ==========================================================================

    /// Spendable balance per mint, built from live token records
    pub async fn spendable_balances(&self) -> WalletResult<HashMap<String, MintBalance>> {
        let mut balances: HashMap<String, MintBalance> = HashMap::new();

        for record in self.db.live_tokens().await? {
            let mint_url = normalize_mint_url(&record.mint_url);
            let entry = balances.entry(mint_url.clone()).or_insert_with(|| MintBalance {
                mint_url,
                token_ids: Vec::new(),
                sum: 0,
            });
            entry.token_ids.push(record.id.clone());
            entry.sum = entry.sum.saturating_add(record.amount);
        }

        Ok(balances)
    }

    /// Total spendable balance across all mints
    pub async fn total_balance(&self) -> WalletResult<u64> {
        Ok(self
            .spendable_balances()
            .await?
            .values()
            .map(|b| b.sum)
            .fold(0u64, |acc, sum| acc.saturating_add(sum)))
    }

    /// Live records at one mint, with their decoded proofs
    pub(crate) async fn live_records_for_mint(
        &self,
        mint_url: &str,
    ) -> WalletResult<Vec<(TokenRecord, DecodedToken)>> {
        let mint_url = normalize_mint_url(mint_url);
        let mut out = Vec::new();

        for record in self.db.live_tokens().await? {
            if normalize_mint_url(&record.mint_url) != mint_url {
                continue;
            }
            match crate::ecash::decode_token(&record.encoded_token) {
                Ok(decoded) => {
                    // A record claiming one mint but encoding another is a
                    // caller bug upstream; refuse rather than mis-spend
                    if decoded.mint_url != mint_url {
                        return Err(WalletError::MixedMints);
                    }
                    out.push((record, decoded));
                }
                Err(e) => {
                    log::error!("Stored token {} no longer decodes: {}", record.id, e);
                    self.db
                        .mark_token_invalid(&record.id, &format!("undecodable: {}", e))
                        .await?;
                }
            }
        }

        Ok(out)
    }

    // ==========================================================================
    // Proof Validation (NUT-07 style)
    // ==========================================================================

    /// Validate records' proofs with the mint in batches, pruning records
    /// whose proofs are spent. Returns the surviving (record, decoded)
    /// pairs. On a state-check failure the batch is assumed valid
    /// (fail-safe: the mint rejects spent proofs at spend time anyway).
    pub(crate) async fn validate_records_with_mint(
        &self,
        mint_url: &str,
        records: Vec<(TokenRecord, DecodedToken)>,
    ) -> WalletResult<Vec<(TokenRecord, DecodedToken)>> {
        use cdk::nuts::State;

        let mut surviving = Vec::new();

        for (record, decoded) in records {
            // One state per proof; unreachable batches count as unspent
            let mut states: Vec<State> = Vec::with_capacity(decoded.proofs.len());
            for batch in decoded.proofs.chunks(MAX_STATE_CHECK_BATCH) {
                let batch_proofs: Proofs = batch.to_vec();
                match self
                    .bounded(self.client.check_proof_states(mint_url, &batch_proofs))
                    .await
                {
                    Ok(batch_states) if batch_states.len() == batch.len() => {
                        states.extend(batch_states);
                    }
                    Ok(_) | Err(_) => {
                        log::warn!("State check failed for {}, assuming batch valid", record.id);
                        states.extend(std::iter::repeat(State::Unspent).take(batch.len()));
                    }
                }
            }

            let live: Proofs = decoded
                .proofs
                .iter()
                .zip(states.iter())
                .filter(|(_, state)| !matches!(state, State::Spent))
                .map(|(proof, _)| proof.clone())
                .collect();
            let spent = decoded.proofs.len() - live.len();

            if spent == 0 {
                surviving.push((record, decoded));
            } else if live.is_empty() {
                log::warn!("All {} proofs of record {} spent elsewhere, pruning", spent, record.id);
                self.db.mark_token_invalid(&record.id, "proofs spent elsewhere").await?;
                self.db.soft_delete_token(&record.id).await?;
            } else {
                // Partially spent: persist the live remainder as a fresh
                // record before retiring the stale one
                log::warn!(
                    "{} of {} proofs of record {} spent elsewhere, rewriting",
                    spent,
                    decoded.proofs.len(),
                    record.id
                );
                let replacement = self
                    .persist_proofs_as_record(mint_url, &decoded.unit, live.clone(), None)
                    .await?;
                self.db.soft_delete_token(&record.id).await?;

                let decoded = DecodedToken {
                    mint_url: decoded.mint_url.clone(),
                    unit: decoded.unit.clone(),
                    memo: None,
                    proofs: live,
                };
                surviving.push((replacement, decoded));
            }
        }

        Ok(surviving)
    }

    /// Encode proofs and persist them as a new accepted token record
    pub(crate) async fn persist_proofs_as_record(
        &self,
        mint_url: &str,
        unit: &cdk::nuts::CurrencyUnit,
        proofs: Proofs,
        raw_token: Option<String>,
    ) -> WalletResult<TokenRecord> {
        let amount = crate::ecash::proofs_amount(&proofs);
        let encoded = crate::ecash::encode_token(mint_url, unit, proofs, None)?;

        let record = TokenRecord {
            id: uuid::Uuid::new_v4().to_string(),
            encoded_token: encoded,
            raw_token,
            mint_url: normalize_mint_url(mint_url),
            unit: unit.to_string(),
            amount,
            state: crate::types::TokenState::Accepted,
            error_text: None,
            deleted: false,
            created_at: now_secs(),
        };
        self.db.insert_token(&record).await?;
        Ok(record)
    }
}

/// Check if an error is the mint telling us a blinding index was reused
pub(crate) fn is_counter_conflict(err: &WalletError) -> bool {
    matches!(err, WalletError::SignatureConflict { .. })
        || is_signature_conflict_text(&err.to_string())
}
