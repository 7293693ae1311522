//! Melt operations
//!
//! Paying an external payment request through a mint: quote, swap for
//! exact change, then melt. The critical property sits between the last
//! two steps: once the swap has succeeded the source proofs are gone, so
//! the post-swap proof set is encoded into a recovery token *before* the
//! melt executes. A melt failure after the swap is funds-safe, with the
//! recovery token persisted and returned to the caller.

use cdk::nuts::Proofs;

use crate::counters::MAX_COUNTER_ATTEMPTS;
use crate::ecash::{encode_token, proofs_amount, MeltQuote, MintSnapshot};
use crate::errors::{MeltFailure, WalletError, WalletResult};
use crate::types::MeltSuccess;
use crate::utils::with_retry;

use super::{is_counter_conflict, SettlementEngine};

impl SettlementEngine {
    /// Melt holdings at `mint_url` to pay `request`
    pub async fn melt(&self, mint_url: &str, request: &str) -> Result<MeltSuccess, MeltFailure> {
        let mint = self.load_mint(mint_url).await?;

        let quote = self
            .bounded(self.client.create_melt_quote(&mint.mint_url, request))
            .await?;
        let needed = quote.total_needed();
        log::info!(
            "Melt quote {} at {}: {} + {} reserve",
            quote.quote_id,
            mint.mint_url,
            quote.amount,
            quote.fee_reserve
        );

        let records = self.live_records_for_mint(&mint.mint_url).await?;
        let records = self
            .validate_records_with_mint(&mint.mint_url, records)
            .await?;

        let available: u64 = records
            .iter()
            .map(|(record, _)| record.amount)
            .fold(0u64, |acc, amt| acc.saturating_add(amt));
        if available < needed {
            return Err(WalletError::InsufficientFunds { available, required: needed }.into());
        }

        let source_ids: Vec<String> = records.iter().map(|(r, _)| r.id.clone()).collect();
        let source_proofs: Proofs = records
            .iter()
            .flat_map(|(_, decoded)| decoded.proofs.iter().cloned())
            .collect();

        // Swap for exact change: `send` funds the melt, `keep` stays ours
        let split = self.swap_with_counter(&mint, needed, source_proofs).await?;
        let keep = split.keep;
        let send = split.send;

        // From here on the sources are consumed. Build the safety net
        // before calling melt: every post-swap proof, encoded and countable.
        let mut recovery_proofs: Proofs = keep.clone();
        recovery_proofs.extend(send.iter().cloned());
        let recovery_amount = proofs_amount(&recovery_proofs);
        let recovery_token =
            encode_token(&mint.mint_url, &mint.unit, recovery_proofs.clone(), None)
                .map_err(MeltFailure::Failed)?;

        let outcome = match self.melt_with_counter(&mint, &quote, send).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Funds-safe branch: persist the recovery token in place of
                // the consumed sources, then hand it to the caller too
                log::error!(
                    "Melt failed after swap at {} ({} recoverable): {}",
                    mint.mint_url,
                    recovery_amount,
                    err
                );
                self.persist_proofs_as_record(
                    &mint.mint_url,
                    &mint.unit,
                    recovery_proofs,
                    None,
                )
                .await
                .map_err(MeltFailure::Failed)?;
                for id in &source_ids {
                    self.db.soft_delete_token(id).await.map_err(MeltFailure::Failed)?;
                }

                return Err(MeltFailure::FundsSafe {
                    recovery_token,
                    recovery_amount,
                    reason: err.to_string(),
                });
            }
        };

        // Success: remainder is keep + melt change, persisted before the
        // sources are retired
        let mut remaining: Proofs = keep;
        remaining.extend(outcome.change.iter().cloned());
        let remaining_amount = proofs_amount(&remaining);

        if !remaining.is_empty() {
            self.persist_proofs_as_record(&mint.mint_url, &mint.unit, remaining, None)
                .await?;
        }
        for id in &source_ids {
            self.db.soft_delete_token(id).await?;
        }

        log::info!(
            "Melt complete at {}: {} paid, {} fee, {} remaining",
            mint.mint_url,
            quote.amount,
            outcome.fee_paid,
            remaining_amount
        );

        Ok(MeltSuccess {
            amount_paid: quote.amount,
            fee_paid: outcome.fee_paid,
            remaining_amount,
            preimage: outcome.preimage,
        })
    }

    /// Melt under the counter lock; change outputs consume indices too
    async fn melt_with_counter(
        &self,
        mint: &MintSnapshot,
        quote: &MeltQuote,
        proofs: Proofs,
    ) -> WalletResult<crate::ecash::MeltOutcome> {
        let key = self.counter_key_for(mint);
        let _guard = self.counters.lock(&key).await;

        with_retry(MAX_COUNTER_ATTEMPTS, is_counter_conflict, |attempt| {
            let proofs = proofs.clone();
            let key = &key;
            async move {
                self.skip_on_conflict(key, attempt).await?;
                let counter = self.counters.next_counter(key).await?;
                let outcome = self
                    .bounded(self.client.melt(&mint.mint_url, quote, proofs, counter))
                    .await?;
                self.counters.advance(key, outcome.change.len() as u32).await?;
                Ok(outcome)
            }
        })
        .await
        .map_err(SettlementEngine::conflict_exhausted)
    }
}
