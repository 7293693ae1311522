//! Offline payment queue
//!
//! Payment intents created while offline are persisted and replayed when
//! connectivity returns. Replay is exactly-once per intent: a single
//! in-flight flush owns the queue (explicit `Idle | Flushing` state
//! machine), and concurrent flush calls join the running one through a
//! watch channel instead of double-running. Each intent is retried through
//! the full settlement orchestrator with the `from_queue` flag set;
//! success removes it, recoverable failures keep it for the next trigger,
//! permanent failures drop it silently.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::errors::{WalletError, WalletResult};
use crate::store::WalletDb;
use crate::types::{PaymentOutcome, PendingPaymentIntent};
use crate::utils::now_secs;

/// Summary of one flush pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    /// Intents settled and removed
    pub replayed: usize,
    /// Intents kept for the next flush
    pub kept: usize,
    /// Intents dropped as permanently failed
    pub dropped: usize,
}

/// Replays a queued intent through the settlement orchestrator
#[async_trait]
pub trait IntentReplay: Send + Sync {
    async fn replay(&self, intent: &PendingPaymentIntent) -> WalletResult<PaymentOutcome>;
}

enum FlushState {
    Idle,
    Flushing(watch::Receiver<Option<FlushSummary>>),
}

/// Durable queue of offline payment intents
#[derive(Clone)]
pub struct PaymentQueue {
    db: WalletDb,
    state: Arc<Mutex<FlushState>>,
}

impl PaymentQueue {
    pub fn new(db: WalletDb) -> Self {
        Self {
            db,
            state: Arc::new(Mutex::new(FlushState::Idle)),
        }
    }

    /// Persist a payment intent for later replay
    pub async fn enqueue(
        &self,
        contact_id: &str,
        amount_sat: u64,
        message_id: Option<String>,
    ) -> WalletResult<PendingPaymentIntent> {
        let intent = PendingPaymentIntent {
            id: uuid::Uuid::new_v4().to_string(),
            contact_id: contact_id.to_string(),
            amount_sat,
            created_at: now_secs(),
            message_id,
        };
        self.db.insert_pending_payment(&intent).await?;
        log::info!(
            "Queued offline payment {}: {} sats to {}",
            intent.id,
            amount_sat,
            contact_id
        );
        Ok(intent)
    }

    /// Number of intents waiting for replay
    pub async fn len(&self) -> WalletResult<usize> {
        Ok(self.db.pending_payments().await?.len())
    }

    pub async fn is_empty(&self) -> WalletResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Replay all queued intents. Idempotent and serialized: if a flush is
    /// already running, this call waits for it and returns its summary.
    pub async fn flush(&self, replayer: &dyn IntentReplay) -> WalletResult<FlushSummary> {
        // Take ownership of the queue, or a handle onto whoever has it;
        // one lock hold makes the check-and-claim atomic
        let (tx, rx) = watch::channel(None);
        let join_rx = {
            let mut state = self.state.lock().await;
            let existing = match &*state {
                FlushState::Flushing(running) => Some(running.clone()),
                FlushState::Idle => None,
            };
            if existing.is_none() {
                *state = FlushState::Flushing(rx);
            }
            existing
        };

        if let Some(mut rx) = join_rx {
            log::debug!("Flush already in flight, joining it");
            loop {
                if let Some(summary) = rx.borrow().clone() {
                    return Ok(summary);
                }
                if rx.changed().await.is_err() {
                    // Flusher dropped without a summary (it failed); report
                    // an empty pass, the next trigger retries
                    return Ok(FlushSummary::default());
                }
            }
        }

        let result = self.run_flush(replayer).await;

        {
            let mut state = self.state.lock().await;
            *state = FlushState::Idle;
        }
        if let Ok(summary) = &result {
            let _ = tx.send(Some(summary.clone()));
        }

        result
    }

    async fn run_flush(&self, replayer: &dyn IntentReplay) -> WalletResult<FlushSummary> {
        let intents = self.db.pending_payments().await?;
        let mut summary = FlushSummary::default();

        if intents.is_empty() {
            return Ok(summary);
        }
        log::info!("Flushing {} queued payments", intents.len());

        for intent in intents {
            match replayer.replay(&intent).await {
                Ok(outcome) => {
                    log::info!(
                        "Replayed intent {}: {} sats ecash, promise {}",
                        intent.id,
                        outcome.ecash_amount,
                        outcome.promise.is_some()
                    );
                    self.db.remove_pending_payment(&intent.id).await?;
                    summary.replayed += 1;
                }
                Err(err) if err.is_permanent_for_queue() => {
                    // Silently dropped; there is nothing a retry could fix
                    log::warn!("Dropping poisoned intent {}: {}", intent.id, err);
                    self.db.remove_pending_payment(&intent.id).await?;
                    summary.dropped += 1;
                }
                Err(err) => {
                    log::debug!("Keeping intent {} after recoverable failure: {}", intent.id, err);
                    summary.kept += 1;
                }
            }
        }

        log::info!(
            "Flush done: {} replayed, {} kept, {} dropped",
            summary.replayed,
            summary.kept,
            summary.dropped
        );
        Ok(summary)
    }
}
