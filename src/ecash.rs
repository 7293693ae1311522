//! Ecash client capability
//!
//! The mint-facing protocol client is consumed as an opaque capability:
//! quotes, swaps, receives, melts, proof state checks and deterministic
//! restore all go through [`EcashClient`]. Token encoding and decoding are
//! local operations and handled here directly via CDK's token codec
//! (V3 `cashuA` and V4 `cashuB` formats).

use std::str::FromStr;

use async_trait::async_trait;
use cdk::nuts::{CurrencyUnit, Id, Proofs, State, Token};
use cdk::mint_url::MintUrl;

use crate::errors::{WalletError, WalletResult};
use crate::utils::normalize_mint_url;

// =============================================================================
// Decoded Token
// =============================================================================

/// A decoded bearer token: one mint, one unit, a set of proofs
#[derive(Debug, Clone)]
pub struct DecodedToken {
    /// Normalized mint URL
    pub mint_url: String,
    /// Currency unit
    pub unit: CurrencyUnit,
    /// Optional memo carried by the token
    pub memo: Option<String>,
    /// The bearer proofs
    pub proofs: Proofs,
}

impl DecodedToken {
    /// Sum of proof amounts
    pub fn amount(&self) -> u64 {
        self.proofs
            .iter()
            .map(|p| u64::from(p.amount))
            .fold(0u64, |acc, amt| acc.saturating_add(amt))
    }

    /// Proof secrets, for dedup against locally known records
    pub fn secrets(&self) -> Vec<String> {
        self.proofs.iter().map(|p| p.secret.to_string()).collect()
    }
}

// =============================================================================
// Token Codec
// =============================================================================

/// Sanitize pasted token text: strip all whitespace and auto-correct
/// truncated base64 padding where the remainder makes that unambiguous
pub fn sanitize_token_text(token_text: &str) -> WalletResult<String> {
    let token_text: String = token_text.chars().filter(|c| !c.is_whitespace()).collect();

    if token_text.is_empty() {
        return Err(WalletError::Decode { reason: "token text is empty".into() });
    }

    if token_text.chars().any(|c| c.is_control()) {
        return Err(WalletError::Decode {
            reason: "token contains control characters".into(),
        });
    }

    if !token_text.starts_with("cashuA") && !token_text.starts_with("cashuB") {
        return Err(WalletError::Decode {
            reason: format!(
                "token must start with 'cashuA' or 'cashuB', got '{}'",
                token_text.chars().take(10).collect::<String>()
            ),
        });
    }

    // V3 bodies are base64; a remainder of 2 or 3 means padding was lost in
    // transit and can be restored
    let body = &token_text[6..];
    let remainder = body.len() % 4;
    if token_text.starts_with("cashuA") && (remainder == 2 || remainder == 3) {
        log::warn!("Auto-correcting token padding ({} chars missing)", 4 - remainder);
        return Ok(format!("{}{}", token_text, "=".repeat(4 - remainder)));
    }

    Ok(token_text)
}

/// Decode a token string into its mint, unit and proofs
pub fn decode_token(token_text: &str) -> WalletResult<DecodedToken> {
    let sanitized = sanitize_token_text(token_text)?;

    let token = Token::from_str(&sanitized)
        .map_err(|e| WalletError::Decode { reason: e.to_string() })?;

    let mint_url = token
        .mint_url()
        .map_err(|e| WalletError::Decode { reason: format!("missing mint url: {}", e) })?
        .to_string();

    let unit = token.unit().map(|u| u.clone()).unwrap_or(CurrencyUnit::Sat);
    let memo = token.memo().clone();

    let proofs = token
        .proofs(&[])
        .map_err(|e| WalletError::Decode { reason: format!("unreadable proofs: {}", e) })?;

    if proofs.is_empty() {
        return Err(WalletError::Decode { reason: "token contains no proofs".into() });
    }

    Ok(DecodedToken {
        mint_url: normalize_mint_url(&mint_url),
        unit,
        memo,
        proofs,
    })
}

/// Encode proofs into a token string (V4 format)
pub fn encode_token(
    mint_url: &str,
    unit: &CurrencyUnit,
    proofs: Proofs,
    memo: Option<String>,
) -> WalletResult<String> {
    if proofs.is_empty() {
        return Err(WalletError::Internal("cannot encode a token with no proofs".into()));
    }

    let mint_url = MintUrl::from_str(mint_url)
        .map_err(|e| WalletError::Internal(format!("invalid mint url: {}", e)))?;

    let token = Token::new(mint_url, proofs, memo, unit.clone());
    Ok(token.to_string())
}

/// Sum of a proof set
pub fn proofs_amount(proofs: &Proofs) -> u64 {
    proofs
        .iter()
        .map(|p| u64::from(p.amount))
        .fold(0u64, |acc, amt| acc.saturating_add(amt))
}

// =============================================================================
// Client Result Types
// =============================================================================

/// Snapshot of a mint's active keyset and capabilities
#[derive(Debug, Clone)]
pub struct MintSnapshot {
    /// Normalized mint URL
    pub mint_url: String,
    /// Currently active keyset for the unit
    pub active_keyset: Id,
    /// Unit of the active keyset
    pub unit: CurrencyUnit,
    /// Input fee in ppk for the active keyset
    pub input_fee_ppk: u64,
    /// Multi-path payment support
    pub supports_mpp: bool,
    /// Deterministic restore support
    pub supports_restore: bool,
}

/// Result of a swap: proofs to keep and proofs earmarked for sending
#[derive(Debug, Clone)]
pub struct SwapSplit {
    /// Change retained by the wallet
    pub keep: Proofs,
    /// Proofs summing to the requested amount
    pub send: Proofs,
}

impl SwapSplit {
    /// Number of fresh outputs the mint signed for this split
    pub fn outputs_used(&self) -> u32 {
        (self.keep.len() + self.send.len()) as u32
    }
}

/// A melt quote: invoice amount plus the mint's fee reserve
#[derive(Debug, Clone)]
pub struct MeltQuote {
    /// Quote id at the mint
    pub quote_id: String,
    /// Invoice amount in the quote unit
    pub amount: u64,
    /// Reserved fee; unspent reserve comes back as change
    pub fee_reserve: u64,
    /// Quote expiry (unix seconds), when reported
    pub expiry: Option<u64>,
}

impl MeltQuote {
    /// Total value that must be presented to execute this quote
    pub fn total_needed(&self) -> u64 {
        self.amount.saturating_add(self.fee_reserve)
    }
}

/// Result of executing a melt
#[derive(Debug, Clone)]
pub struct MeltOutcome {
    /// Change proofs from the unused fee reserve
    pub change: Proofs,
    /// Fee actually charged
    pub fee_paid: u64,
    /// Payment preimage, when the backend returned one
    pub preimage: Option<String>,
}

/// One batch of a deterministic restore scan
#[derive(Debug, Clone)]
pub struct RestoreBatch {
    /// Proofs the mint still has signatures for in the scanned range
    pub proofs: Proofs,
    /// Highest counter index in the batch that had a signature, if any
    pub last_signed_index: Option<u32>,
}

// =============================================================================
// Capability Trait
// =============================================================================

/// Mint-facing ecash operations, consumed but never implemented here
///
/// The `counter` arguments are deterministic blinding indices: the client
/// derives its blinded outputs starting at the given index. Presenting an
/// index the mint has already signed fails with a signature-conflict error;
/// the orchestrator owns the skip-and-retry policy.
#[async_trait]
pub trait EcashClient: Send + Sync {
    /// Load (or refresh) the mint's active keyset and capabilities
    async fn load_mint(&self, mint_url: &str) -> WalletResult<MintSnapshot>;

    /// Swap `proofs` for a fresh `{keep, send}` split where `send` sums to
    /// `amount`; fees come out of the keep side
    async fn swap(
        &self,
        mint_url: &str,
        amount: u64,
        proofs: Proofs,
        counter: u32,
    ) -> WalletResult<SwapSplit>;

    /// Redeem a decoded inbound token for fresh proofs
    async fn receive(&self, token: &DecodedToken, counter: u32) -> WalletResult<Proofs>;

    /// Create a melt quote for an external payment request
    async fn create_melt_quote(&self, mint_url: &str, request: &str) -> WalletResult<MeltQuote>;

    /// Execute a melt with exact-change proofs
    async fn melt(
        &self,
        mint_url: &str,
        quote: &MeltQuote,
        proofs: Proofs,
        counter: u32,
    ) -> WalletResult<MeltOutcome>;

    /// Check the mint-side state of a proof set (spent / pending / unspent)
    async fn check_proof_states(&self, mint_url: &str, proofs: &Proofs) -> WalletResult<Vec<State>>;

    /// Restore signatures for deterministic outputs starting at
    /// `start_counter`, scanning up to `batch_size` indices
    async fn batch_restore(
        &self,
        mint_url: &str,
        keyset_id: &Id,
        start_counter: u32,
        batch_size: u32,
    ) -> WalletResult<RestoreBatch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_rejects_garbage() {
        assert!(sanitize_token_text("").is_err());
        assert!(sanitize_token_text("lnbc10n1...").is_err());
        assert!(sanitize_token_text("cashuA\u{0007}abc").is_err());
    }

    #[test]
    fn test_sanitize_strips_whitespace() {
        let fixed = sanitize_token_text("  cashuB abc\ndef  ").unwrap();
        assert_eq!(fixed, "cashuBabcdef");
    }

    #[test]
    fn test_sanitize_restores_v3_padding() {
        // body length 6 -> remainder 2 -> two '=' appended
        let fixed = sanitize_token_text("cashuAabcdef").unwrap();
        assert_eq!(fixed, "cashuAabcdef==");

        // aligned body is left alone
        let aligned = sanitize_token_text("cashuAabcdefgh").unwrap();
        assert_eq!(aligned, "cashuAabcdefgh");
    }

    #[test]
    fn test_decode_rejects_unparseable() {
        let err = decode_token("cashuBnotatoken").unwrap_err();
        assert!(matches!(err, WalletError::Decode { .. }));
    }
}
