//! Restore scanner
//!
//! Reconstructs historical proofs from the deterministic seed when local
//! records are lost. For each (mint, unit, keyset) the scan first covers a
//! bounded recent window below the high-water mark; if that turns up
//! nothing and the window did not start at zero, exactly one deep scan
//! from index zero runs. The deep scan is what recovers proofs issued long
//! before the local counter moved ahead (e.g. after the user deleted
//! records).
//! Both scans advance the restore cursor and the deterministic counter
//! past everything observed so future issuance never reuses a recovered
//! index.

use std::collections::HashSet;

use cdk::nuts::{Id, Proofs, State};

use crate::counters::CounterKey;
use crate::ecash::proofs_amount;
use crate::errors::WalletResult;
use crate::settle::{SettlementEngine, MAX_STATE_CHECK_BATCH};
use crate::utils::normalize_mint_url;

/// Consecutive empty batches after which a scan direction gives up
const EMPTY_BATCH_STREAK: u32 = 3;

/// Hard bound on batches per scan, against a mint that never stops
/// answering
const MAX_SCAN_BATCHES: u32 = 1_000;

/// Outcome of a restore scan
#[derive(Debug, Clone, Default)]
pub struct RestoreOutcome {
    /// Total value recovered
    pub recovered_amount: u64,
    /// Number of proofs recovered
    pub recovered_proofs: usize,
    /// Ids of the token records persisted
    pub record_ids: Vec<String>,
    /// True when the deep fallback scan from zero ran
    pub deep_scan_used: bool,
}

impl SettlementEngine {
    /// Restore the active keyset of a mint
    pub async fn restore_mint(&self, mint_url: &str) -> WalletResult<RestoreOutcome> {
        let mint = self.load_mint(mint_url).await?;
        self.restore_keyset(&mint.mint_url, &mint.unit, &mint.active_keyset)
            .await
    }

    /// Restore one (mint, unit, keyset)
    pub async fn restore_keyset(
        &self,
        mint_url: &str,
        unit: &cdk::nuts::CurrencyUnit,
        keyset_id: &Id,
    ) -> WalletResult<RestoreOutcome> {
        let mint_url = normalize_mint_url(mint_url);
        let key = CounterKey::new(&mint_url, &unit.to_string(), &keyset_id.to_string());
        let _guard = self.counters.lock(&key).await;

        let counter = self.counters.next_counter(&key).await?;
        let cursor = self.counters.restore_cursor(&key).await?;
        let high_water = counter.max(cursor);
        let start = high_water.saturating_sub(self.config.restore_window);

        log::info!(
            "Restore scan for {} from index {} (counter {}, cursor {})",
            key,
            start,
            counter,
            cursor
        );

        let mut outcome = RestoreOutcome::default();
        let (mut proofs, mut max_observed) = self.scan_from(&mint_url, keyset_id, start).await?;

        // Nothing in the recent window but history exists below it: one
        // deep scan from zero
        if proofs.is_empty() && start > 0 {
            log::info!("Windowed scan empty for {}, falling back to deep scan", key);
            outcome.deep_scan_used = true;
            let (deep_proofs, deep_max) = self.scan_from(&mint_url, keyset_id, 0).await?;
            proofs = deep_proofs;
            max_observed = max_observed.max(deep_max);
        }

        // Future issuance must never reuse an observed index
        if let Some(max_index) = max_observed {
            self.counters.ensure_at_least(&key, max_index + 1).await?;
            self.counters.advance_restore_cursor(&key, max_index + 1).await?;
        } else {
            self.counters.advance_restore_cursor(&key, high_water).await?;
        }

        if proofs.is_empty() {
            log::info!("Restore scan for {} found nothing", key);
            return Ok(outcome);
        }

        let fresh = self.filter_unknown(&mint_url, proofs).await?;
        let live = self.filter_unspent(&mint_url, fresh).await?;

        if live.is_empty() {
            log::info!("Restore scan for {}: all recovered proofs already known or spent", key);
            return Ok(outcome);
        }

        // Chunked persistence bounds the size of any single encoded token
        for chunk in live.chunks(self.config.restore_chunk) {
            let chunk: Proofs = chunk.to_vec();
            let amount = proofs_amount(&chunk);
            let record = self
                .persist_proofs_as_record(&mint_url, unit, chunk, None)
                .await?;

            outcome.recovered_amount = outcome.recovered_amount.saturating_add(amount);
            outcome.record_ids.push(record.id);
        }
        outcome.recovered_proofs = live.len();

        log::info!(
            "Restore recovered {} proofs ({} {}) into {} records for {}",
            outcome.recovered_proofs,
            outcome.recovered_amount,
            unit,
            outcome.record_ids.len(),
            key
        );

        Ok(outcome)
    }

    /// Scan forward from `start`, returning found proofs and the highest
    /// index that carried a signature
    async fn scan_from(
        &self,
        mint_url: &str,
        keyset_id: &Id,
        start: u32,
    ) -> WalletResult<(Proofs, Option<u32>)> {
        let mut at = start;
        let mut proofs: Proofs = Vec::new();
        let mut max_observed: Option<u32> = None;
        let mut empty_streak = 0u32;

        for _ in 0..MAX_SCAN_BATCHES {
            let batch = self
                .bounded(self.client.batch_restore(
                    mint_url,
                    keyset_id,
                    at,
                    self.config.restore_batch,
                ))
                .await?;

            if batch.proofs.is_empty() {
                empty_streak += 1;
                if empty_streak >= EMPTY_BATCH_STREAK {
                    break;
                }
            } else {
                empty_streak = 0;
                log::debug!(
                    "Restore batch at {}: {} proofs",
                    at,
                    batch.proofs.len()
                );
                proofs.extend(batch.proofs);
            }

            if let Some(last) = batch.last_signed_index {
                max_observed = Some(max_observed.map_or(last, |m| m.max(last)));
            }

            at = at.saturating_add(self.config.restore_batch);
        }

        Ok((proofs, max_observed))
    }

    /// Drop proofs whose secrets a live record already holds. Deleted
    /// records do not count: restore exists precisely to bring back proofs
    /// whose records are gone, and the unspent filter below screens out
    /// anything actually spent.
    async fn filter_unknown(&self, _mint_url: &str, proofs: Proofs) -> WalletResult<Proofs> {
        let mut known: HashSet<String> = HashSet::new();
        for record in self.db.live_tokens().await? {
            if let Ok(decoded) = crate::ecash::decode_token(&record.encoded_token) {
                known.extend(decoded.secrets());
            }
        }

        Ok(proofs
            .into_iter()
            .filter(|p| !known.contains(&p.secret.to_string()))
            .collect())
    }

    /// Keep only proofs the mint reports as currently unspent
    async fn filter_unspent(&self, mint_url: &str, proofs: Proofs) -> WalletResult<Proofs> {
        let mut live: Proofs = Vec::new();

        for batch in proofs.chunks(MAX_STATE_CHECK_BATCH) {
            let batch_proofs: Proofs = batch.to_vec();
            let states = self
                .bounded(self.client.check_proof_states(mint_url, &batch_proofs))
                .await?;

            for (proof, state) in batch.iter().zip(states.iter()) {
                if matches!(state, State::Unspent) {
                    live.push(proof.clone());
                }
            }
        }

        Ok(live)
    }
}
