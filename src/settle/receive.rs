//! Receive operations
//!
//! Redeeming an inbound bearer token: decode, swap at its mint for fresh
//! proofs under the counter lock, persist the result as a new accepted
//! record. Re-pasting an already-received token is an idempotent no-op via
//! the token dedup rule.

use crate::dedup::find_duplicate_token;
use crate::ecash::{decode_token, proofs_amount, sanitize_token_text};
use crate::errors::{is_token_spent_text, WalletError, WalletResult};
use crate::types::ReceiveSummary;

use super::SettlementEngine;

impl SettlementEngine {
    /// Receive an inbound token, swapping it for fresh proofs
    pub async fn receive_token(&self, token_text: &str) -> WalletResult<ReceiveSummary> {
        let sanitized = sanitize_token_text(token_text)?;
        let decoded = decode_token(&sanitized)?;

        log::info!(
            "Receiving {} {} from {}",
            decoded.amount(),
            decoded.unit,
            decoded.mint_url
        );

        // Dedup: the same bearer text must never produce two live records
        let existing = self.db.all_tokens().await?;
        if let Some(duplicate) = find_duplicate_token(&existing, &sanitized) {
            log::debug!("Token already recorded as {}, skipping receive", duplicate.id);
            return Ok(ReceiveSummary {
                mint_url: duplicate.mint_url.clone(),
                unit: duplicate.unit.clone(),
                amount: duplicate.amount,
                record_id: duplicate.id.clone(),
            });
        }

        let mint = self.load_mint(&decoded.mint_url).await?;

        let fresh = match self.receive_with_counter(&mint, &decoded).await {
            Ok(fresh) => fresh,
            Err(err) if is_token_spent_text(&err.to_string()) => {
                // The inbound token is gone; sweep our own records at this
                // mint in case some of ours went with it
                log::warn!("Inbound token already spent, sweeping {}", decoded.mint_url);
                let records = self.live_records_for_mint(&decoded.mint_url).await?;
                let _ = self.validate_records_with_mint(&decoded.mint_url, records).await?;
                return Err(WalletError::DefinitiveInvalid {
                    detail: "token already spent".into(),
                });
            }
            Err(err) => return Err(err),
        };

        let amount = proofs_amount(&fresh);
        let record = self
            .persist_proofs_as_record(&mint.mint_url, &decoded.unit, fresh, Some(sanitized))
            .await?;

        log::info!("Received {} {} into record {}", amount, decoded.unit, record.id);

        Ok(ReceiveSummary {
            mint_url: record.mint_url.clone(),
            unit: record.unit.clone(),
            amount,
            record_id: record.id,
        })
    }
}
