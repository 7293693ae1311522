//! Send-split operations
//!
//! Producing a token worth a target amount from the records held at one
//! mint. The remainder is persisted as a new accepted record *before* the
//! consumed sources are soft-deleted: never delete source funds until the
//! replacement is durably recorded. When fees would eat the amount, the
//! engine merges locally instead of swapping and cuts proofs directly.

use cdk::nuts::Proofs;

use crate::ecash::{encode_token, proofs_amount, DecodedToken};
use crate::errors::{is_insufficient_funds_text, WalletError, WalletResult};
use crate::types::{MergeSummary, SendSplit, TokenRecord};

use super::SettlementEngine;

impl SettlementEngine {
    /// Split the holdings at `mint_url` into a send token worth `amount`
    /// plus a persisted remainder
    pub async fn send_split(&self, mint_url: &str, amount: u64) -> WalletResult<SendSplit> {
        if amount == 0 {
            return Err(WalletError::Internal("cannot send a zero amount".into()));
        }

        let mint = self.load_mint(mint_url).await?;
        log::info!("Send-split of {} {} at {}", amount, mint.unit, mint.mint_url);

        let records = self.live_records_for_mint(&mint.mint_url).await?;
        let records = self.validate_records_with_mint(&mint.mint_url, records).await?;

        let available: u64 = records
            .iter()
            .map(|(record, _)| record.amount)
            .fold(0u64, |acc, amt| acc.saturating_add(amt));
        if available < amount {
            return Err(WalletError::InsufficientFunds { available, required: amount });
        }

        let source_ids: Vec<String> = records.iter().map(|(r, _)| r.id.clone()).collect();
        let source_proofs: Proofs = records
            .iter()
            .flat_map(|(_, decoded)| decoded.proofs.iter().cloned())
            .collect();

        // Fee guard: a swap whose fee consumes the whole amount is pointless;
        // fall back to cutting proofs locally
        let estimated_fee = per_proof_fee(mint.input_fee_ppk)
            .saturating_mul(source_proofs.len() as u64);
        if amount <= estimated_fee {
            log::warn!(
                "Fee {} would consume the {} {} send, merging locally instead",
                estimated_fee,
                amount,
                mint.unit
            );
            return self.send_from_merge(&mint.mint_url, &mint.unit, amount, records).await;
        }

        let split = match self.swap_with_counter(&mint, amount, source_proofs).await {
            Ok(split) => split,
            Err(err) if is_insufficient_funds_text(&err.to_string()) => {
                // The mint's own fee accounting rejected the swap; same
                // fallback as the local fee guard
                log::warn!("Mint rejected swap as unfundable ({}), merging locally", err);
                return self.send_from_merge(&mint.mint_url, &mint.unit, amount, records).await;
            }
            Err(err) => return Err(err),
        };

        let send_amount = proofs_amount(&split.send);
        let remaining_amount = proofs_amount(&split.keep);
        let send_token = encode_token(&mint.mint_url, &mint.unit, split.send, None)?;

        // Persist the remainder before touching the sources
        let remaining_token = if split.keep.is_empty() {
            None
        } else {
            let remainder = self
                .persist_proofs_as_record(&mint.mint_url, &mint.unit, split.keep, None)
                .await?;
            Some(remainder.encoded_token)
        };
        for id in &source_ids {
            self.db.soft_delete_token(id).await?;
        }

        log::info!(
            "Send-split complete: {} sent, {} kept at {}",
            send_amount,
            remaining_amount,
            mint.mint_url
        );

        Ok(SendSplit {
            send_token,
            send_amount,
            remaining_token,
            remaining_amount,
            merged_locally: false,
        })
    }

    /// Consolidate all live records at one mint/unit into a single stored
    /// token without a network swap. The merged record preserves the exact
    /// proof set, so it remains spendable value at that mint.
    pub async fn local_merge(&self, mint_url: &str) -> WalletResult<MergeSummary> {
        let mint = self.load_mint(mint_url).await?;
        let records = self.live_records_for_mint(&mint.mint_url).await?;

        if records.is_empty() {
            return Err(WalletError::InsufficientFunds { available: 0, required: 1 });
        }

        let source_ids: Vec<String> = records.iter().map(|(r, _)| r.id.clone()).collect();
        let proofs: Proofs = records
            .iter()
            .flat_map(|(_, decoded)| decoded.proofs.iter().cloned())
            .collect();
        let total = proofs_amount(&proofs);

        let merged = self
            .persist_proofs_as_record(&mint.mint_url, &mint.unit, proofs, None)
            .await?;
        for id in &source_ids {
            self.db.soft_delete_token(id).await?;
        }

        log::info!(
            "Merged {} records ({} {}) at {} into {}",
            source_ids.len(),
            total,
            mint.unit,
            mint.mint_url,
            merged.id
        );

        Ok(MergeSummary {
            merged_records: source_ids.len(),
            total_amount: total,
            record_id: merged.id,
        })
    }

    /// Fee-fallback send: merge, then cut proofs greedily for the target.
    /// No network settlement happens; the cut may overshoot the target by
    /// at most the smallest selected denomination.
    async fn send_from_merge(
        &self,
        mint_url: &str,
        unit: &cdk::nuts::CurrencyUnit,
        amount: u64,
        records: Vec<(TokenRecord, DecodedToken)>,
    ) -> WalletResult<SendSplit> {
        let source_ids: Vec<String> = records.iter().map(|(r, _)| r.id.clone()).collect();
        let mut proofs: Proofs = records
            .iter()
            .flat_map(|(_, decoded)| decoded.proofs.iter().cloned())
            .collect();

        // Largest-first keeps the overshoot at one small denomination
        proofs.sort_by(|a, b| b.amount.cmp(&a.amount));

        let mut send = Vec::new();
        let mut send_amount = 0u64;
        let mut keep = Vec::new();
        for proof in proofs {
            if send_amount < amount {
                send_amount = send_amount.saturating_add(u64::from(proof.amount));
                send.push(proof);
            } else {
                keep.push(proof);
            }
        }

        let remaining_amount = proofs_amount(&keep);
        let send_token = encode_token(mint_url, unit, send, None)?;

        let remaining_token = if keep.is_empty() {
            None
        } else {
            let remainder = self.persist_proofs_as_record(mint_url, unit, keep, None).await?;
            Some(remainder.encoded_token)
        };
        for id in &source_ids {
            self.db.soft_delete_token(id).await?;
        }

        log::info!(
            "Local-merge send: {} cut for a {} target, {} kept at {}",
            send_amount,
            amount,
            remaining_amount,
            mint_url
        );

        Ok(SendSplit {
            send_token,
            send_amount,
            remaining_token,
            remaining_amount,
            merged_locally: true,
        })
    }
}

/// Per-proof input fee, ppk rounded up
pub(crate) fn per_proof_fee(input_fee_ppk: u64) -> u64 {
    input_fee_ppk.saturating_add(999) / 1000
}
