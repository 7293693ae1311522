//! Wallet error types
//!
//! Typed error handling for the settlement core. Every error that could
//! lose funds carries enough context for the caller to persist a recovery
//! token before reporting failure; string-matching heuristics against mint
//! responses are isolated behind named classifier functions.

use std::fmt;

/// Settlement core error type
#[derive(Debug, Clone)]
pub enum WalletError {
    // ==========================================================================
    // Caller / Input Errors
    // ==========================================================================
    /// Malformed token text; fatal to the operation, never retried
    Decode { reason: String },
    /// Source tokens span more than one mint; caller bug, fatal
    MixedMints,
    /// Referenced contact no longer exists; permanent for queued intents
    ContactNotFound { contact_id: String },

    // ==========================================================================
    // Funds Errors
    // ==========================================================================
    /// Not enough spendable value across the drained candidates
    InsufficientFunds { available: u64, required: u64 },
    /// Issuing this promise would exceed the configured credit exposure cap
    CreditCapExceeded { outstanding: u64, requested: u64, cap: u64 },

    // ==========================================================================
    // Mint Errors
    // ==========================================================================
    /// The mint already produced a signature for a presented blinding index;
    /// retried internally with a counter skip, surfaced only after the
    /// attempt budget is exhausted
    SignatureConflict { attempts: u32 },
    /// Network-class failure talking to a mint or relay; eligible for
    /// candidate fallback, never marks tokens invalid
    TransientNetwork { detail: String },
    /// The mint asserts the proofs are unusable; the only error allowed to
    /// mark a token record terminally invalid
    DefinitiveInvalid { detail: String },

    // ==========================================================================
    // Infrastructure Errors
    // ==========================================================================
    /// Local store failure
    Database(String),
    /// Messaging transport failure
    Transport(String),
    /// Promise signature creation or verification failure
    Signature(String),
    /// Anything else
    Internal(String),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode { reason } => write!(f, "Invalid token: {}", reason),
            Self::MixedMints => write!(f, "Source tokens span multiple mints"),
            Self::ContactNotFound { contact_id } => {
                write!(f, "Contact not found: {}", contact_id)
            }
            Self::InsufficientFunds { available, required } => {
                write!(f, "Insufficient funds: available={}, required={}", available, required)
            }
            Self::CreditCapExceeded { outstanding, requested, cap } => write!(
                f,
                "Credit exposure cap exceeded: outstanding={}, requested={}, cap={}",
                outstanding, requested, cap
            ),
            Self::SignatureConflict { attempts } => {
                write!(f, "Signature already produced for counter index after {} attempts", attempts)
            }
            Self::TransientNetwork { detail } => write!(f, "Mint unreachable: {}", detail),
            Self::DefinitiveInvalid { detail } => write!(f, "Proofs unusable: {}", detail),
            Self::Database(msg) => write!(f, "Store error: {}", msg),
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Signature(msg) => write!(f, "Signature error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for WalletError {}

/// Result type alias for settlement operations
pub type WalletResult<T> = Result<T, WalletError>;

impl WalletError {
    /// Errors worth retrying against a different mint candidate
    pub fn is_candidate_fallback(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    /// Errors that permanently poison a queued payment intent
    pub fn is_permanent_for_queue(&self) -> bool {
        matches!(
            self,
            Self::ContactNotFound { .. } | Self::MixedMints | Self::Decode { .. }
        )
    }

    /// Check if this is an insufficient funds error
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, Self::InsufficientFunds { .. })
            || is_insufficient_funds_text(&self.to_string())
    }

    /// Short status string suitable for direct display; detail stays in logs
    pub fn user_message(&self) -> String {
        match self {
            Self::Decode { .. } => "That token could not be read".to_string(),
            Self::MixedMints => "Tokens from different mints cannot be combined".to_string(),
            Self::ContactNotFound { .. } => "Contact no longer exists".to_string(),
            Self::InsufficientFunds { .. } => "Not enough funds".to_string(),
            Self::CreditCapExceeded { .. } => "Credit limit reached".to_string(),
            Self::SignatureConflict { .. } => "Wallet state conflict, try again".to_string(),
            Self::TransientNetwork { .. } => "Mint unreachable".to_string(),
            Self::DefinitiveInvalid { .. } => "Token already spent".to_string(),
            Self::Database(_) => "Storage error".to_string(),
            Self::Transport(_) => "Message could not be delivered".to_string(),
            Self::Signature(_) => "Signature check failed".to_string(),
            Self::Internal(_) => "Something went wrong".to_string(),
        }
    }
}

// =============================================================================
// Melt Failure Sum Type
// =============================================================================

/// Failure branch of a melt operation
///
/// A melt that fails after its preparatory swap succeeded has already
/// exchanged the source proofs; the swapped set is still valid ecash and is
/// carried here so the caller cannot ignore it.
#[derive(Debug, Clone)]
pub enum MeltFailure {
    /// Melt failed after the swap succeeded. The recovery token encodes the
    /// full post-swap proof set (keep + send); persisting it and deleting
    /// the original sources leaves total balance unchanged.
    FundsSafe {
        recovery_token: String,
        recovery_amount: u64,
        reason: String,
    },
    /// Melt failed before any proofs changed hands
    Failed(WalletError),
}

impl fmt::Display for MeltFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FundsSafe { recovery_amount, reason, .. } => write!(
                f,
                "Melt failed after swap ({} sats recovered): {}",
                recovery_amount, reason
            ),
            Self::Failed(err) => write!(f, "Melt failed: {}", err),
        }
    }
}

impl std::error::Error for MeltFailure {}

impl From<WalletError> for MeltFailure {
    fn from(err: WalletError) -> Self {
        Self::Failed(err)
    }
}

// =============================================================================
// Error Text Classifiers
// =============================================================================

/// Check if a mint error message indicates a blinding-index signature conflict
pub fn is_signature_conflict_text(error_msg: &str) -> bool {
    let msg = error_msg.to_lowercase();
    msg.contains("already signed")
        || msg.contains("signature already produced")
        || msg.contains("outputs have already been signed")
        || msg.contains("duplicate output")
}

/// Check if a mint error message indicates insufficient funds for the swap
pub fn is_insufficient_funds_text(error_msg: &str) -> bool {
    error_msg.to_lowercase().contains("insufficient")
}

/// Check if a mint error message indicates the proofs are already spent
pub fn is_token_spent_text(error_msg: &str) -> bool {
    let msg = error_msg.to_lowercase();
    msg.contains("already spent")
        || msg.contains("already redeemed")
        || msg.contains("token pending")
}
