//! Promise and settlement tokens
//!
//! A promise is a signed IOU from issuer to recipient, identified by the
//! digest of its canonical payload. Settlements reference a promise and are
//! signed by the promise's recipient, releasing part or all of the
//! issuer's obligation. Invalid tokens are still recorded (the UI shows
//! them as invalid); validity is a derived flag, never a deletion trigger.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use nostr::Keys;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credo::canonical::{content_digest, content_id};
use crate::credo::sign::{identity_hex, sign_digest, verify_digest};
use crate::errors::{WalletError, WalletResult};
use crate::store::{WalletDb, TABLE_PROMISES, TABLE_SETTLEMENTS};
use crate::utils::now_secs;

/// Textual prefix of an encoded Credo token
pub const CREDO_PREFIX: &str = "credoA";

// =============================================================================
// Payloads
// =============================================================================

/// Canonical payload of a promise token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromisePayload {
    /// Always "promise"
    #[serde(rename = "type")]
    pub kind: String,
    /// Issuer identity (hex pubkey)
    pub issuer: String,
    /// Recipient identity (hex pubkey)
    pub recipient: String,
    /// Promised amount
    pub amount: u64,
    /// Currency unit
    pub unit: String,
    /// Random nonce so repeated promises between the same parties get
    /// distinct ids
    pub nonce: String,
    /// Issue time (unix seconds)
    pub created_at: u64,
    /// Expiry (unix seconds); not spendable credit afterwards
    pub expires_at: u64,
}

/// Canonical payload of a settlement token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPayload {
    /// Always "settlement"
    #[serde(rename = "type")]
    pub kind: String,
    /// Id of the promise being settled
    pub promise_id: String,
    /// Promise issuer (hex pubkey)
    pub issuer: String,
    /// Promise recipient (hex pubkey); the settlement signer
    pub recipient: String,
    /// Settled amount; omitted means the promise is fully settled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    /// Unit, when a partial amount is carried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Nonce for partial settlements so repeats get distinct ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Settlement time (unix seconds)
    pub settled_at: u64,
}

/// Transport envelope: payload + claimed id + signature
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredoEnvelope {
    payload: Value,
    id: String,
    sig: String,
}

/// A parsed Credo token
#[derive(Debug, Clone)]
pub enum CredoToken {
    Promise {
        payload: PromisePayload,
        id: String,
        sig: String,
    },
    Settlement {
        payload: SettlementPayload,
        id: String,
        sig: String,
    },
}

// =============================================================================
// Records
// =============================================================================

/// Locally stored promise with derived validity and settlement progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromiseRecord {
    /// Content id of the promise
    pub promise_id: String,
    /// The promise payload
    pub payload: PromisePayload,
    /// Issuer signature (hex)
    pub signature: String,
    /// Derived validity: hash matches, signature verifies, not expired at
    /// record time
    pub valid: bool,
    /// Why the promise is invalid, when it is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    /// Monotonically accumulated settled amount, clamped to the promise
    /// amount
    #[serde(default)]
    pub settled_amount: u64,
    /// When the record was created locally (unix seconds)
    pub recorded_at: u64,
}

impl PromiseRecord {
    /// Unsettled remainder, clamped to `[0, amount]`
    pub fn outstanding(&self) -> u64 {
        self.payload.amount.saturating_sub(self.settled_amount)
    }

    /// True once the expiry has passed
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.payload.expires_at
    }

    /// True while the promise still represents spendable credit
    pub fn is_open(&self, now: u64) -> bool {
        self.valid && !self.is_expired(now) && self.outstanding() > 0
    }
}

/// An applied settlement, kept for idempotent re-delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettlementRecord {
    settlement_id: String,
    promise_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    amount: Option<u64>,
    recorded_at: u64,
}

// =============================================================================
// Encoding
// =============================================================================

fn encode_envelope(payload: &Value, id: &str, sig: &str) -> WalletResult<String> {
    let envelope = CredoEnvelope {
        payload: payload.clone(),
        id: id.to_string(),
        sig: sig.to_string(),
    };
    let json = serde_json::to_string(&envelope)
        .map_err(|e| WalletError::Internal(format!("envelope serialization: {}", e)))?;
    Ok(format!("{}{}", CREDO_PREFIX, URL_SAFE_NO_PAD.encode(json.as_bytes())))
}

/// Parse an encoded Credo token without judging validity
pub fn parse_token(text: &str) -> WalletResult<CredoToken> {
    let trimmed = text.trim();
    let body = trimmed.strip_prefix(CREDO_PREFIX).ok_or_else(|| WalletError::Decode {
        reason: format!("not a credo token (expected '{}' prefix)", CREDO_PREFIX),
    })?;

    let bytes = URL_SAFE_NO_PAD
        .decode(body.as_bytes())
        .map_err(|e| WalletError::Decode { reason: format!("credo body not base64url: {}", e) })?;
    let envelope: CredoEnvelope = serde_json::from_slice(&bytes)
        .map_err(|e| WalletError::Decode { reason: format!("credo envelope: {}", e) })?;

    let kind = envelope
        .payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match kind.as_str() {
        "promise" => {
            let payload: PromisePayload = serde_json::from_value(envelope.payload.clone())
                .map_err(|e| WalletError::Decode { reason: format!("promise payload: {}", e) })?;
            Ok(CredoToken::Promise { payload, id: envelope.id, sig: envelope.sig })
        }
        "settlement" => {
            let payload: SettlementPayload = serde_json::from_value(envelope.payload.clone())
                .map_err(|e| WalletError::Decode { reason: format!("settlement payload: {}", e) })?;
            Ok(CredoToken::Settlement { payload, id: envelope.id, sig: envelope.sig })
        }
        other => Err(WalletError::Decode { reason: format!("unknown credo payload type '{}'", other) }),
    }
}

fn payload_value<T: Serialize>(payload: &T) -> WalletResult<Value> {
    serde_json::to_value(payload)
        .map_err(|e| WalletError::Internal(format!("payload serialization: {}", e)))
}

fn fresh_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

// =============================================================================
// Ledger
// =============================================================================

/// Promise bookkeeping: issuance under the exposure cap, verification,
/// idempotent settlement accumulation
#[derive(Clone)]
pub struct CredoLedger {
    db: WalletDb,
    keys: Keys,
    credit_cap: u64,
}

impl CredoLedger {
    pub fn new(db: WalletDb, keys: Keys, credit_cap: u64) -> Self {
        Self { db, keys, credit_cap }
    }

    /// Local identity as hex
    pub fn identity(&self) -> String {
        identity_hex(&self.keys)
    }

    // ==========================================================================
    // Issuance
    // ==========================================================================

    /// Issue a promise to `recipient`, refusing when it would push total
    /// outstanding issued credit past the cap. Returns the encoded token
    /// and the persisted record.
    pub async fn issue_promise(
        &self,
        recipient: &str,
        amount: u64,
        unit: &str,
        ttl_secs: u64,
    ) -> WalletResult<(String, PromiseRecord)> {
        let recipient_hex = crate::credo::sign::parse_identity(recipient)
            .map(|pk| pk.to_string())
            .map_err(|e| WalletError::Signature(format!("recipient identity: {}", e)))?;

        let outstanding = self.total_outstanding_issued().await?;
        if outstanding.saturating_add(amount) > self.credit_cap {
            return Err(WalletError::CreditCapExceeded {
                outstanding,
                requested: amount,
                cap: self.credit_cap,
            });
        }

        let now = now_secs();
        let payload = PromisePayload {
            kind: "promise".to_string(),
            issuer: self.identity(),
            recipient: recipient_hex,
            amount,
            unit: unit.to_string(),
            nonce: fresh_nonce(),
            created_at: now,
            expires_at: now.saturating_add(ttl_secs),
        };

        let value = payload_value(&payload)?;
        let digest = content_digest(&value);
        let promise_id = content_id(&value);
        let sig = sign_digest(&self.keys, &digest)?;

        let record = PromiseRecord {
            promise_id: promise_id.clone(),
            payload,
            signature: sig.clone(),
            valid: true,
            invalid_reason: None,
            settled_amount: 0,
            recorded_at: now,
        };
        self.put_promise(&record).await?;

        let token = encode_envelope(&value, &promise_id, &sig)?;
        log::info!("Issued promise {} for {} {} to {}", promise_id, amount, unit, recipient);

        Ok((token, record))
    }

    /// Issue a settlement for a promise we received. `amount = None` means
    /// the promise is fully settled. Only the promise's recipient can sign.
    pub async fn issue_settlement(
        &self,
        promise_id: &str,
        amount: Option<u64>,
    ) -> WalletResult<String> {
        let promise = self
            .get_promise(promise_id)
            .await?
            .ok_or_else(|| WalletError::Internal(format!("unknown promise {}", promise_id)))?;

        if promise.payload.recipient != self.identity() {
            return Err(WalletError::Signature(
                "only the promise recipient can issue a settlement".into(),
            ));
        }

        let payload = SettlementPayload {
            kind: "settlement".to_string(),
            promise_id: promise_id.to_string(),
            issuer: promise.payload.issuer.clone(),
            recipient: promise.payload.recipient.clone(),
            amount,
            unit: amount.map(|_| promise.payload.unit.clone()),
            nonce: amount.map(|_| fresh_nonce()),
            settled_at: now_secs(),
        };

        let value = payload_value(&payload)?;
        let digest = content_digest(&value);
        let settlement_id = content_id(&value);
        let sig = sign_digest(&self.keys, &digest)?;

        log::info!(
            "Issued settlement {} for promise {} ({})",
            settlement_id,
            promise_id,
            amount.map(|a| a.to_string()).unwrap_or_else(|| "full".into())
        );

        encode_envelope(&value, &settlement_id, &sig)
    }

    // ==========================================================================
    // Verification & Recording
    // ==========================================================================

    /// Record an inbound promise. Tamper and signature failures do not drop
    /// the token; they mark the record invalid so it can still be shown.
    pub async fn record_promise(
        &self,
        payload: &PromisePayload,
        claimed_id: &str,
        sig: &str,
    ) -> WalletResult<PromiseRecord> {
        // Re-delivery keeps the first record; settlement progress must not
        // reset because a duplicate arrived
        if let Some(existing) = self.get_promise(claimed_id).await? {
            return Ok(existing);
        }

        let invalid_reason = self.verify_promise(payload, claimed_id, sig).err();
        let record = PromiseRecord {
            promise_id: claimed_id.to_string(),
            payload: payload.clone(),
            signature: sig.to_string(),
            valid: invalid_reason.is_none(),
            invalid_reason: invalid_reason.clone(),
            settled_amount: 0,
            recorded_at: now_secs(),
        };
        self.put_promise(&record).await?;

        match &invalid_reason {
            None => log::info!("Recorded promise {} ({} {})", claimed_id, record.payload.amount, record.payload.unit),
            Some(reason) => log::warn!("Recorded invalid promise {}: {}", claimed_id, reason),
        }

        Ok(record)
    }

    /// Check a promise: id matches the canonical hash, the issuer signature
    /// verifies, and the expiry has not passed
    pub fn verify_promise(
        &self,
        payload: &PromisePayload,
        claimed_id: &str,
        sig: &str,
    ) -> Result<(), String> {
        let value = payload_value(payload).map_err(|e| e.to_string())?;
        let digest = content_digest(&value);

        if content_id(&value) != claimed_id {
            return Err("id does not match payload hash".to_string());
        }
        verify_digest(&payload.issuer, &digest, sig).map_err(|e| e.to_string())?;
        if now_secs() >= payload.expires_at {
            return Err("promise expired".to_string());
        }
        Ok(())
    }

    /// Apply a settlement to its promise. Duplicate delivery is a no-op;
    /// accumulation is clamped so `settled_amount` can never exceed the
    /// promise amount.
    pub async fn apply_settlement(
        &self,
        payload: &SettlementPayload,
        claimed_id: &str,
        sig: &str,
    ) -> WalletResult<PromiseRecord> {
        let mut promise = self
            .get_promise(&payload.promise_id)
            .await?
            .ok_or_else(|| {
                WalletError::Internal(format!("settlement for unknown promise {}", payload.promise_id))
            })?;

        let value = payload_value(payload)?;
        let digest = content_digest(&value);
        if content_id(&value) != claimed_id {
            return Err(WalletError::Signature("settlement id does not match payload hash".into()));
        }
        // Settlements are signed by the promise's recipient: they prove the
        // recipient received value and releases the obligation
        verify_digest(&promise.payload.recipient, &digest, sig)?;

        if self.get_settlement(claimed_id).await?.is_some() {
            log::debug!("Settlement {} already applied, skipping", claimed_id);
            return Ok(promise);
        }

        let credited = payload.amount.unwrap_or(promise.payload.amount);
        promise.settled_amount = promise
            .settled_amount
            .saturating_add(credited)
            .min(promise.payload.amount);
        self.put_promise(&promise).await?;

        self.put_settlement(&SettlementRecord {
            settlement_id: claimed_id.to_string(),
            promise_id: payload.promise_id.clone(),
            amount: payload.amount,
            recorded_at: now_secs(),
        })
        .await?;

        log::info!(
            "Applied settlement {} to promise {}: settled {}/{}",
            claimed_id,
            payload.promise_id,
            promise.settled_amount,
            promise.payload.amount
        );

        Ok(promise)
    }

    // ==========================================================================
    // Exposure
    // ==========================================================================

    /// Sum of unsettled amounts across valid, unexpired promises we issued
    pub async fn total_outstanding_issued(&self) -> WalletResult<u64> {
        let me = self.identity();
        let now = now_secs();

        Ok(self
            .all_promises()
            .await?
            .iter()
            .filter(|p| p.payload.issuer == me && p.is_open(now))
            .map(|p| p.outstanding())
            .fold(0u64, |acc, amt| acc.saturating_add(amt)))
    }

    /// All stored promises, valid or not
    pub async fn all_promises(&self) -> WalletResult<Vec<PromiseRecord>> {
        let rows = self.db.raw().list(TABLE_PROMISES).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect())
    }

    pub async fn get_promise(&self, promise_id: &str) -> WalletResult<Option<PromiseRecord>> {
        let row = self.db.raw().get(TABLE_PROMISES, promise_id).await?;
        Ok(row.and_then(|r| serde_json::from_value(r).ok()))
    }

    async fn put_promise(&self, record: &PromiseRecord) -> WalletResult<()> {
        let row = serde_json::to_value(record)
            .map_err(|e| WalletError::Database(e.to_string()))?;
        self.db.raw().update(TABLE_PROMISES, &record.promise_id, row).await
    }

    async fn get_settlement(&self, settlement_id: &str) -> WalletResult<Option<()>> {
        let row = self.db.raw().get(TABLE_SETTLEMENTS, settlement_id).await?;
        Ok(row.filter(|r| !r.is_null()).map(|_| ()))
    }

    async fn put_settlement(&self, record: &SettlementRecord) -> WalletResult<()> {
        let row = serde_json::to_value(record)
            .map_err(|e| WalletError::Database(e.to_string()))?;
        self.db
            .raw()
            .insert(TABLE_SETTLEMENTS, &record.settlement_id, row)
            .await
    }
}
