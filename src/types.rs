//! Wallet data types
//!
//! Persistent records and operation result types shared across the
//! settlement core. Records are serialized to the local store as JSON rows
//! and soft-deleted rather than removed.

use serde::{Deserialize, Serialize};

/// Default unit for ecash proofs
pub fn default_unit() -> String {
    "sat".to_string()
}

// =============================================================================
// Token Records
// =============================================================================

/// Lifecycle state of a stored bearer token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    /// Proofs are held and spendable
    #[default]
    Accepted,
    /// An operation involving these proofs is in flight
    Pending,
    /// The mint asserted the proofs are unusable
    Error,
}

impl TokenState {
    /// Returns true if the record's proofs can fund a spend
    pub fn is_spendable(&self) -> bool {
        matches!(self, TokenState::Accepted)
    }
}

/// A stored bearer ecash token
///
/// One record holds one encoded token (one mint, one unit). `amount` always
/// equals the sum of the live proof amounts inside `encoded_token`. Spending
/// soft-deletes the record; replacement records are persisted first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Record id (uuid)
    pub id: String,
    /// Serialized token (cashuA/cashuB form)
    pub encoded_token: String,
    /// Raw token text as originally received, if it differed after sanitizing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_token: Option<String>,
    /// Normalized mint URL
    pub mint_url: String,
    /// Currency unit (e.g. "sat")
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Sum of live proof amounts
    pub amount: u64,
    /// Lifecycle state
    #[serde(default)]
    pub state: TokenState,
    /// Detail when state is Error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    /// Soft-delete flag
    #[serde(default)]
    pub deleted: bool,
    /// Creation time (unix seconds)
    pub created_at: u64,
}

impl TokenRecord {
    /// Returns true for records that count toward spendable balance
    pub fn is_live(&self) -> bool {
        !self.deleted && self.state.is_spendable()
    }
}

// =============================================================================
// Mint Records
// =============================================================================

/// Stored info about a known mint, keyed by canonical URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintInfoRecord {
    /// Canonical mint URL
    pub mint_url: String,
    /// Display name, if announced by the mint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Icon URL, if announced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    /// Input fee in parts-per-thousand-keys
    #[serde(default)]
    pub input_fee_ppk: u64,
    /// Multi-path payment support (NUT-15 class capability)
    #[serde(default)]
    pub supports_mpp: bool,
    /// Deterministic restore support (NUT-09 class capability)
    #[serde(default)]
    pub supports_restore: bool,
    /// Last time a token or quote from this mint was handled (unix seconds)
    #[serde(default)]
    pub last_seen: u64,
    /// Last time capabilities were refreshed (unix seconds)
    #[serde(default)]
    pub last_checked: u64,
    /// Soft-delete flag
    #[serde(default)]
    pub deleted: bool,
}

impl MintInfoRecord {
    /// Score used when merging duplicate rows: metadata richness, then recency
    ///
    /// Each present metadata field outweighs any recency difference; ties
    /// fall back to the most recently checked row.
    pub fn score(&self) -> u64 {
        let metadata: u64 = [
            self.name.is_some(),
            self.icon_url.is_some(),
            self.supports_mpp,
            self.supports_restore,
            self.input_fee_ppk > 0,
        ]
        .iter()
        .filter(|present| **present)
        .count() as u64;

        metadata
            .saturating_mul(1_000_000_000_000)
            .saturating_add(self.last_checked.max(self.last_seen))
    }

    /// Capability score used by the spend-plan selector
    pub fn capability_score(&self) -> u8 {
        (self.supports_mpp as u8) << 1 | self.supports_restore as u8
    }
}

// =============================================================================
// Payment Intents
// =============================================================================

/// A payment that could not be attempted (no connectivity) and waits in the
/// offline queue for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPaymentIntent {
    /// Intent id (uuid)
    pub id: String,
    /// Contact the payment is addressed to
    pub contact_id: String,
    /// Amount in sats
    pub amount_sat: u64,
    /// Creation time (unix seconds)
    pub created_at: u64,
    /// Client-assigned message id for dedup against the chat timeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Direction of a transport message relative to the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// An inbound (or echoed outbound) transport message as seen by the dedup pass
///
/// Identity resolution order: wrap id, then client-assigned id, then the
/// composite (direction, timestamp, content) fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Wrap identifier assigned by the transport, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_id: Option<String>,
    /// Client-assigned id, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Direction relative to the local user
    pub direction: MessageDirection,
    /// Message timestamp (unix seconds)
    pub created_at: u64,
    /// Decrypted content
    pub content: String,
}

// =============================================================================
// Balances & Spend Plans
// =============================================================================

/// Spendable balance at a single mint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintBalance {
    /// Normalized mint URL
    pub mint_url: String,
    /// Ids of the live token records backing the balance
    pub token_ids: Vec<String>,
    /// Sum of live token amounts
    pub sum: u64,
}

/// One entry of an ordered spend plan
#[derive(Debug, Clone, PartialEq)]
pub struct SpendCandidate {
    /// Mint to draw from
    pub mint_url: String,
    /// Token record ids backing this candidate
    pub token_ids: Vec<String>,
    /// Total spendable at this mint
    pub sum: u64,
}

// =============================================================================
// Operation Results
// =============================================================================

/// Outcome of receiving a token
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveSummary {
    /// Mint the token was issued by
    pub mint_url: String,
    /// Currency unit
    pub unit: String,
    /// Amount credited after the swap
    pub amount: u64,
    /// Id of the persisted token record
    pub record_id: String,
}

/// Outcome of a send-split
#[derive(Debug, Clone, PartialEq)]
pub struct SendSplit {
    /// Encoded token to hand to the recipient
    pub send_token: String,
    /// Amount carried by the send token (may exceed the target when the
    /// fee fallback cut proofs without a swap)
    pub send_amount: u64,
    /// Encoded remainder kept locally, if any value remained
    pub remaining_token: Option<String>,
    /// Amount kept locally
    pub remaining_amount: u64,
    /// True when the fee fallback merged locally instead of swapping
    pub merged_locally: bool,
}

/// Outcome of a successful melt
#[derive(Debug, Clone, PartialEq)]
pub struct MeltSuccess {
    /// Amount paid to the invoice
    pub amount_paid: u64,
    /// Fee actually charged
    pub fee_paid: u64,
    /// Value retained locally (keep + melt change)
    pub remaining_amount: u64,
    /// Payment preimage when the backend returned one
    pub preimage: Option<String>,
}

/// Outcome of a local merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSummary {
    /// Records consolidated
    pub merged_records: usize,
    /// Total value of the merged record
    pub total_amount: u64,
    /// Id of the new consolidated record
    pub record_id: String,
}

/// Outcome of paying a contact
#[derive(Debug, Clone, Default)]
pub struct PaymentOutcome {
    /// Amount the caller asked to pay
    pub requested: u64,
    /// Encoded tokens sent, in candidate order
    pub tokens: Vec<String>,
    /// Total ecash value sent
    pub ecash_amount: u64,
    /// Credo promise covering the shortfall, if one was issued
    pub promise: Option<String>,
    /// Promise amount, when present
    pub promise_amount: u64,
    /// True when the intent was queued instead of attempted
    pub queued: bool,
    /// True when this attempt came from the offline queue replay
    pub from_queue: bool,
}

impl PaymentOutcome {
    /// True when ecash plus promised credit covers the requested amount
    pub fn fully_covered(&self) -> bool {
        self.queued
            || self.ecash_amount.saturating_add(self.promise_amount) >= self.requested
    }
}
