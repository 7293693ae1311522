//! Satchel: local-first peer-to-peer wallet settlement core
//!
//! Users hold bearer ecash tokens at one or more mints, pay contacts
//! directly through a gift-wrapped messaging transport, and extend
//! informal credit via signed IOU tokens (Credo) when ecash runs out.
//! This crate is the orchestration layer between those pieces:
//! - Multi-mint spend planning and candidate fallback
//! - Receive / send-split / melt with deterministic, non-reusable
//!   blinding indices and crash-safe recovery tokens
//! - Per-(mint, unit, keyset) counter serialization
//! - Credo promise/settlement tokens with content-addressed ids
//! - Deterministic restore scans with a deep fallback
//! - An offline payment queue that replays exactly once per intent
//! - Token, mint and message reconciliation
//!
//! The UI, the persistence engine, the ecash protocol client and the relay
//! transport are external collaborators, consumed through the traits in
//! [`store`], [`ecash`] and [`transport`].

pub mod counters;
pub mod credo;
pub mod dedup;
pub mod ecash;
pub mod errors;
pub mod queue;
pub mod restore;
pub mod selector;
pub mod settle;
pub mod store;
pub mod transport;
pub mod types;
pub mod utils;
pub mod wallet;

// Re-export the main entry points
pub use counters::{CounterKey, CounterStore, COUNTER_CONFLICT_SKIP, MAX_COUNTER_ATTEMPTS};
pub use credo::{CredoLedger, CredoToken, PromisePayload, PromiseRecord, SettlementPayload};
pub use ecash::{decode_token, encode_token, DecodedToken, EcashClient};
pub use errors::{MeltFailure, WalletError, WalletResult};
pub use queue::{FlushSummary, IntentReplay, PaymentQueue};
pub use restore::RestoreOutcome;
pub use selector::{allocate, plan_spend};
pub use settle::{EngineConfig, SettlementEngine};
pub use store::{LocalStore, MemoryStore, WalletDb};
pub use transport::MessageTransport;
pub use types::{
    MeltSuccess, MintBalance, MintInfoRecord, PaymentOutcome, PendingPaymentIntent,
    ReceiveSummary, SendSplit, SpendCandidate, TokenRecord, TokenState,
};
pub use utils::normalize_mint_url;
pub use wallet::{ContactDirectory, PaymentMessage, PaymentRequest, Wallet};
