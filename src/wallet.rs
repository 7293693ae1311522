//! Wallet facade
//!
//! Ties the settlement engine, the Credo ledger, the offline queue and the
//! messaging transport together behind the one entry point the host calls:
//! [`Wallet::pay`]. A payment drains the selector's spend plan through
//! send-splits, wraps each resulting token for the contact, and covers any
//! shortfall with a Credo promise under the exposure cap. When the host
//! reports no connectivity, the whole intent goes to the offline queue
//! instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use nostr::{Keys, PublicKey};
use serde::{Deserialize, Serialize};

use crate::credo::CredoLedger;
use crate::errors::{WalletError, WalletResult};
use crate::queue::{FlushSummary, IntentReplay, PaymentQueue};
use crate::selector::{allocate, plan_spend};
use crate::settle::SettlementEngine;
use crate::transport::{wrap_and_publish, MessageTransport};
use crate::types::{MintInfoRecord, PaymentOutcome, PendingPaymentIntent};

/// Resolves contact ids to messaging identities; owned by the host's
/// profile layer
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Pubkey of a contact, or `None` when the contact no longer exists
    async fn pubkey_of(&self, contact_id: &str) -> WalletResult<Option<PublicKey>>;
}

/// Chat payload carrying a payment, serialized into the wrapped message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PaymentMessage {
    /// A bearer ecash token
    Ecash { token: String },
    /// A Credo promise or settlement token
    Credo { token: String },
}

/// A payment request as the host hands it over
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    /// Contact to pay
    pub contact_id: String,
    /// Amount in sats
    pub amount_sat: u64,
    /// Mint to try first, when the user picked one
    pub preferred_mint: Option<String>,
    /// Set on queue replays; suppresses re-queueing
    pub from_queue: bool,
    /// Client message id, threaded through to the queue for dedup
    pub message_id: Option<String>,
}

impl PaymentRequest {
    pub fn new(contact_id: &str, amount_sat: u64) -> Self {
        Self {
            contact_id: contact_id.to_string(),
            amount_sat,
            preferred_mint: None,
            from_queue: false,
            message_id: None,
        }
    }
}

/// The wallet: settlement engine plus credit, queue and transport
pub struct Wallet {
    engine: SettlementEngine,
    ledger: CredoLedger,
    queue: PaymentQueue,
    transport: Arc<dyn MessageTransport>,
    contacts: Arc<dyn ContactDirectory>,
    keys: Keys,
    online: AtomicBool,
}

impl Wallet {
    pub fn new(
        engine: SettlementEngine,
        transport: Arc<dyn MessageTransport>,
        contacts: Arc<dyn ContactDirectory>,
        keys: Keys,
    ) -> Self {
        let db = engine.db().clone();
        let ledger = CredoLedger::new(db.clone(), keys.clone(), engine.config().credit_cap);
        let queue = PaymentQueue::new(db);

        Self {
            engine,
            ledger,
            queue,
            transport,
            contacts,
            keys,
            online: AtomicBool::new(true),
        }
    }

    pub fn engine(&self) -> &SettlementEngine {
        &self.engine
    }

    pub fn ledger(&self) -> &CredoLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &PaymentQueue {
        &self.queue
    }

    /// Host-reported connectivity. Going online is the natural moment to
    /// call [`Wallet::flush_queue`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    // ==========================================================================
    // Payment
    // ==========================================================================

    /// Pay a contact: ecash first, Credo credit for the shortfall, offline
    /// queue when there is no connectivity
    pub async fn pay(&self, request: PaymentRequest) -> WalletResult<PaymentOutcome> {
        if request.amount_sat == 0 {
            return Err(WalletError::Internal("cannot pay a zero amount".into()));
        }

        if !self.is_online() {
            if request.from_queue {
                // A replay racing a connectivity drop stays queued
                return Err(WalletError::TransientNetwork { detail: "offline during replay".into() });
            }
            let intent = self
                .queue
                .enqueue(&request.contact_id, request.amount_sat, request.message_id.clone())
                .await?;
            log::info!("Offline: payment {} queued for replay", intent.id);
            return Ok(PaymentOutcome {
                requested: request.amount_sat,
                queued: true,
                from_queue: false,
                ..Default::default()
            });
        }

        let recipient = self
            .contacts
            .pubkey_of(&request.contact_id)
            .await?
            .ok_or_else(|| WalletError::ContactNotFound {
                contact_id: request.contact_id.clone(),
            })?;

        // Build the spend plan
        let balances = self.engine.spendable_balances().await?;
        let mint_info = self.mint_info_by_url().await?;
        let plan = plan_spend(
            &balances,
            &mint_info,
            request.preferred_mint.as_deref(),
            request.amount_sat,
        );
        let (_, planned_shortfall) = allocate(&plan, request.amount_sat);

        // Refuse up front when neither ecash nor credit can cover the
        // target; nothing has moved yet
        if planned_shortfall > 0 {
            let outstanding = self.ledger.total_outstanding_issued().await?;
            let credit_left = self.engine.config().credit_cap.saturating_sub(outstanding);
            if planned_shortfall > credit_left {
                let available: u64 = balances.values().map(|b| b.sum).sum();
                return Err(WalletError::InsufficientFunds {
                    available: available.saturating_add(credit_left),
                    required: request.amount_sat,
                });
            }
        }

        let mut outcome = PaymentOutcome {
            requested: request.amount_sat,
            from_queue: request.from_queue,
            ..Default::default()
        };
        let mut remaining = request.amount_sat;

        // Drain candidates in plan order; a transient mint failure moves on
        // to the next candidate rather than failing the payment
        for candidate in &plan {
            if remaining == 0 {
                break;
            }
            let target = candidate.sum.min(remaining);

            match self.engine.send_split(&candidate.mint_url, target).await {
                Ok(split) => {
                    self.deliver(&recipient, PaymentMessage::Ecash { token: split.send_token.clone() })
                        .await;
                    remaining = remaining.saturating_sub(split.send_amount.min(remaining));
                    outcome.ecash_amount =
                        outcome.ecash_amount.saturating_add(split.send_amount);
                    outcome.tokens.push(split.send_token);
                }
                Err(err) if err.is_candidate_fallback() => {
                    log::warn!("Candidate {} unreachable, trying next: {}", candidate.mint_url, err);
                }
                Err(err) if err.is_insufficient_funds() => {
                    log::warn!(
                        "Candidate {} came up short, trying next: {}",
                        candidate.mint_url,
                        err
                    );
                }
                Err(err) => return Err(err),
            }
        }

        // Cover the shortfall with a promise
        if remaining > 0 {
            let unit = crate::types::default_unit();
            match self
                .ledger
                .issue_promise(
                    &recipient.to_hex(),
                    remaining,
                    &unit,
                    self.engine.config().promise_ttl_secs,
                )
                .await
            {
                Ok((token, record)) => {
                    self.deliver(&recipient, PaymentMessage::Credo { token: token.clone() })
                        .await;
                    outcome.promise = Some(token);
                    outcome.promise_amount = record.payload.amount;
                }
                Err(err) => {
                    if outcome.ecash_amount == 0 {
                        return Err(err);
                    }
                    // Partial ecash already left the wallet; report what
                    // happened instead of pretending the whole payment failed
                    log::error!(
                        "Shortfall of {} could not be promised after sending {}: {}",
                        remaining,
                        outcome.ecash_amount,
                        err
                    );
                }
            }
        }

        log::info!(
            "Payment to {}: {} ecash, {} promised (requested {})",
            request.contact_id,
            outcome.ecash_amount,
            outcome.promise_amount,
            request.amount_sat
        );

        Ok(outcome)
    }

    /// Replay every queued intent; joins any flush already in flight
    pub async fn flush_queue(&self) -> WalletResult<FlushSummary> {
        self.queue.flush(self).await
    }

    // ==========================================================================
    // Helpers
    // ==========================================================================

    /// Wrap and publish a payment message. Settlement already happened by
    /// the time this runs, so a delivery failure is logged rather than
    /// unwinding the payment; the transport owns redelivery.
    async fn deliver(&self, recipient: &PublicKey, message: PaymentMessage) {
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Payment message serialization failed: {}", e);
                return;
            }
        };

        match wrap_and_publish(self.transport.as_ref(), &self.keys, recipient, &payload).await {
            Ok(outcome) if outcome.ok() => {}
            Ok(outcome) => {
                log::warn!(
                    "No relay accepted the payment message: {}",
                    outcome.error.as_deref().unwrap_or("unknown")
                );
            }
            Err(e) => log::warn!("Payment message delivery failed: {}", e),
        }
    }

    async fn mint_info_by_url(&self) -> WalletResult<HashMap<String, MintInfoRecord>> {
        let records = crate::dedup::dedupe_mints(self.engine.db().all_mints().await?);
        Ok(records
            .into_iter()
            .filter(|m| !m.deleted)
            .map(|m| (m.mint_url.clone(), m))
            .collect())
    }

    /// Refresh capability snapshots for every known mint, concurrently
    pub async fn refresh_mint_registry(&self) -> WalletResult<usize> {
        let mints = self.mint_info_by_url().await?;
        let urls: Vec<String> = mints.keys().cloned().collect();

        let snapshots = join_all(
            urls.iter()
                .map(|url| self.engine.load_mint(url)),
        )
        .await;

        let mut refreshed = 0usize;
        for (url, snapshot) in urls.iter().zip(snapshots) {
            match snapshot {
                Ok(snapshot) => {
                    let Some(mut record) = mints.get(url).cloned() else {
                        continue;
                    };
                    record.input_fee_ppk = snapshot.input_fee_ppk;
                    record.supports_mpp = snapshot.supports_mpp;
                    record.supports_restore = snapshot.supports_restore;
                    record.last_checked = crate::utils::now_secs();
                    self.engine.db().upsert_mint(&record).await?;
                    refreshed += 1;
                }
                Err(e) => log::warn!("Capability refresh failed for {}: {}", url, e),
            }
        }

        Ok(refreshed)
    }
}

#[async_trait]
impl IntentReplay for Wallet {
    async fn replay(&self, intent: &PendingPaymentIntent) -> WalletResult<PaymentOutcome> {
        let request = PaymentRequest {
            contact_id: intent.contact_id.clone(),
            amount_sat: intent.amount_sat,
            preferred_mint: None,
            from_queue: true,
            message_id: intent.message_id.clone(),
        };
        self.pay(request).await
    }
}
