//! Credo promise/settlement protocol
//!
//! When ecash runs out, a payment can complete with a signed IOU: the
//! issuer hands the recipient a content-addressed promise token, later
//! released by one or more settlement tokens signed by the recipient.
//! Everything is plain signed JSON over the messaging identity curve; no
//! mint is involved.
//!
//! - Canonical serialization and content ids: [`canonical`]
//! - BIP-340 signing over identity keys: [`sign`]
//! - Token issue/verify and the outstanding ledger: [`promise`]

pub mod canonical;
pub mod promise;
pub mod sign;

pub use canonical::{canonical_string, content_id};
pub use promise::{
    parse_token, CredoLedger, CredoToken, PromisePayload, PromiseRecord, SettlementPayload,
    CREDO_PREFIX,
};
