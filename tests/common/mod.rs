//! Shared test doubles: an in-memory mock mint behind the `EcashClient`
//! capability, a recording transport and a fixed contact directory.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cdk::nuts::{CurrencyUnit, Id, Proof, Proofs, PublicKey, State};
use cdk::secret::Secret;
use cdk::Amount;

use satchel::ecash::{
    DecodedToken, EcashClient, MeltOutcome, MeltQuote, MintSnapshot, RestoreBatch, SwapSplit,
};
use satchel::errors::{WalletError, WalletResult};
use satchel::transport::{MessageTransport, PublishOutcome, WrappedMessage};
use satchel::wallet::ContactDirectory;

/// Test keyset id (v1 format: version byte + 7 bytes)
pub const TEST_KEYSET: &str = "009a1f293253e41e";

/// A valid compressed point for proof C values
const TEST_C: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

/// Binary decomposition into power-of-two denominations
pub fn denominations(mut amount: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut bit = 1u64;
    while amount > 0 {
        if amount & 1 == 1 {
            out.push(bit);
        }
        amount >>= 1;
        bit <<= 1;
    }
    out.reverse();
    out
}

/// Build a fresh proof of the given amount under the test keyset
pub fn make_proof(amount: u64) -> Proof {
    Proof {
        keyset_id: Id::from_str(TEST_KEYSET).unwrap(),
        amount: Amount::from(amount),
        secret: Secret::generate(),
        c: PublicKey::from_hex(TEST_C).unwrap(),
        witness: None,
        dleq: None,
    }
}

/// Build proofs summing to `amount` in power-of-two denominations
pub fn make_proofs(amount: u64) -> Proofs {
    denominations(amount).into_iter().map(make_proof).collect()
}

// =============================================================================
// Mock Mint
// =============================================================================

#[derive(Default)]
struct MintState {
    /// Blinding indices a signature was produced for
    signed_indices: HashSet<u32>,
    /// Proofs issued per blinding index, for restore scans
    issued_by_index: BTreeMap<u32, Proof>,
    /// Secrets the mint has seen spent
    spent_secrets: HashSet<String>,
    /// (start, count) of every counter range presented, for overlap checks
    presented_ranges: Vec<(u32, u32)>,
}

/// In-memory mint implementing the ecash capability
pub struct MockMint {
    pub mint_url: String,
    state: Mutex<MintState>,
    /// Flat fee charged per swap/receive
    pub swap_fee: u64,
    /// Reported input fee ppk (drives the engine's fee guard)
    pub input_fee_ppk: u64,
    pub supports_mpp: bool,
    /// When set, every call fails like a dead network
    pub offline: AtomicBool,
    /// When set, melt fails after the quote/swap phase
    pub fail_melt: AtomicBool,
    /// Swaps performed (the local-merge fallback must not add to this)
    pub swap_calls: AtomicUsize,
}

impl MockMint {
    pub fn new(mint_url: &str) -> Self {
        Self {
            mint_url: mint_url.to_string(),
            state: Mutex::new(MintState::default()),
            swap_fee: 0,
            input_fee_ppk: 0,
            supports_mpp: false,
            offline: AtomicBool::new(false),
            fail_melt: AtomicBool::new(false),
            swap_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_fee_ppk(mut self, ppk: u64) -> Self {
        self.input_fee_ppk = ppk;
        self
    }

    pub fn with_swap_fee(mut self, fee: u64) -> Self {
        self.swap_fee = fee;
        self
    }

    pub fn with_mpp(mut self) -> Self {
        self.supports_mpp = true;
        self
    }

    /// Pre-claim indices so the next operations hit signature conflicts
    pub fn poison_indices(&self, range: std::ops::Range<u32>) {
        let mut state = self.state.lock().unwrap();
        for index in range {
            state.signed_indices.insert(index);
        }
    }

    /// Every (start, count) counter range ever presented
    pub fn presented_ranges(&self) -> Vec<(u32, u32)> {
        self.state.lock().unwrap().presented_ranges.clone()
    }

    /// Mark a proof set spent out-of-band (another wallet spent it)
    pub fn mark_spent(&self, proofs: &Proofs) {
        let mut state = self.state.lock().unwrap();
        for proof in proofs {
            state.spent_secrets.insert(proof.secret.to_string());
        }
    }

    fn check_online(&self) -> WalletResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(WalletError::TransientNetwork { detail: "connection refused".into() });
        }
        Ok(())
    }

    fn wrong_mint(&self, mint_url: &str) -> bool {
        mint_url != self.mint_url
    }

    /// Issue fresh proofs at counter indices, recording them for restore
    fn issue(
        &self,
        state: &mut MintState,
        counter: u32,
        amounts: &[u64],
    ) -> WalletResult<Proofs> {
        // Fail the whole request when any requested index was already
        // signed, the way a deterministic mint does
        let range_len = amounts.len() as u32;
        for offset in 0..range_len {
            if state.signed_indices.contains(&(counter + offset)) {
                return Err(WalletError::Internal(
                    "outputs have already been signed before".into(),
                ));
            }
        }

        state.presented_ranges.push((counter, range_len));

        let mut proofs = Vec::new();
        for (offset, amount) in amounts.iter().enumerate() {
            let proof = make_proof(*amount);
            let index = counter + offset as u32;
            state.signed_indices.insert(index);
            state.issued_by_index.insert(index, proof.clone());
            proofs.push(proof);
        }
        Ok(proofs)
    }

    fn consume_inputs(&self, state: &mut MintState, proofs: &Proofs) -> WalletResult<u64> {
        for proof in proofs {
            if state.spent_secrets.contains(&proof.secret.to_string()) {
                return Err(WalletError::DefinitiveInvalid {
                    detail: "token already spent".into(),
                });
            }
        }
        for proof in proofs {
            state.spent_secrets.insert(proof.secret.to_string());
        }
        Ok(proofs.iter().map(|p| u64::from(p.amount)).sum())
    }
}

#[async_trait]
impl EcashClient for MockMint {
    async fn load_mint(&self, mint_url: &str) -> WalletResult<MintSnapshot> {
        self.check_online()?;
        if self.wrong_mint(mint_url) {
            return Err(WalletError::TransientNetwork { detail: format!("unknown mint {}", mint_url) });
        }
        Ok(MintSnapshot {
            mint_url: self.mint_url.clone(),
            active_keyset: Id::from_str(TEST_KEYSET).unwrap(),
            unit: CurrencyUnit::Sat,
            input_fee_ppk: self.input_fee_ppk,
            supports_mpp: self.supports_mpp,
            supports_restore: true,
        })
    }

    async fn swap(
        &self,
        mint_url: &str,
        amount: u64,
        proofs: Proofs,
        counter: u32,
    ) -> WalletResult<SwapSplit> {
        self.check_online()?;
        if self.wrong_mint(mint_url) {
            return Err(WalletError::TransientNetwork { detail: "unknown mint".into() });
        }

        let mut state = self.state.lock().unwrap();
        let total = {
            // Validate inputs before consuming anything
            for proof in &proofs {
                if state.spent_secrets.contains(&proof.secret.to_string()) {
                    return Err(WalletError::DefinitiveInvalid {
                        detail: "token already spent".into(),
                    });
                }
            }
            proofs.iter().map(|p| u64::from(p.amount)).sum::<u64>()
        };

        if total < amount.saturating_add(self.swap_fee) {
            return Err(WalletError::Internal("insufficient funds for swap".into()));
        }

        let keep_amount = total - amount - self.swap_fee;
        let mut amounts = denominations(amount);
        let send_count = amounts.len();
        amounts.extend(denominations(keep_amount));

        let fresh = self.issue(&mut state, counter, &amounts)?;
        // Only consume inputs once the outputs exist
        self.consume_inputs(&mut state, &proofs)?;
        self.swap_calls.fetch_add(1, Ordering::SeqCst);

        let (send, keep) = fresh.split_at(send_count);
        Ok(SwapSplit { keep: keep.to_vec(), send: send.to_vec() })
    }

    async fn receive(&self, token: &DecodedToken, counter: u32) -> WalletResult<Proofs> {
        self.check_online()?;

        let mut state = self.state.lock().unwrap();
        for proof in &token.proofs {
            if state.spent_secrets.contains(&proof.secret.to_string()) {
                return Err(WalletError::DefinitiveInvalid {
                    detail: "token already spent".into(),
                });
            }
        }

        let total: u64 = token.proofs.iter().map(|p| u64::from(p.amount)).sum();
        let credited = total.saturating_sub(self.swap_fee);

        let fresh = self.issue(&mut state, counter, &denominations(credited))?;
        self.consume_inputs(&mut state, &token.proofs)?;
        Ok(fresh)
    }

    async fn create_melt_quote(&self, _mint_url: &str, request: &str) -> WalletResult<MeltQuote> {
        self.check_online()?;

        // Test invoices look like "invoice:<amount>"
        let amount = request
            .strip_prefix("invoice:")
            .and_then(|a| a.parse::<u64>().ok())
            .ok_or_else(|| WalletError::Decode { reason: "bad invoice".into() })?;

        Ok(MeltQuote {
            quote_id: uuid::Uuid::new_v4().to_string(),
            amount,
            fee_reserve: 2,
            expiry: None,
        })
    }

    async fn melt(
        &self,
        _mint_url: &str,
        quote: &MeltQuote,
        proofs: Proofs,
        counter: u32,
    ) -> WalletResult<MeltOutcome> {
        self.check_online()?;
        if self.fail_melt.load(Ordering::SeqCst) {
            return Err(WalletError::TransientNetwork { detail: "payment backend down".into() });
        }

        let mut state = self.state.lock().unwrap();
        let total = self.consume_inputs(&mut state, &proofs)?;

        let fee_paid = 1u64.min(quote.fee_reserve);
        let change_amount = total
            .saturating_sub(quote.amount)
            .saturating_sub(fee_paid);
        let change = if change_amount > 0 {
            self.issue(&mut state, counter, &denominations(change_amount))?
        } else {
            Vec::new()
        };

        Ok(MeltOutcome { change, fee_paid, preimage: Some("00".repeat(32)) })
    }

    async fn check_proof_states(
        &self,
        _mint_url: &str,
        proofs: &Proofs,
    ) -> WalletResult<Vec<State>> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        Ok(proofs
            .iter()
            .map(|p| {
                if state.spent_secrets.contains(&p.secret.to_string()) {
                    State::Spent
                } else {
                    State::Unspent
                }
            })
            .collect())
    }

    async fn batch_restore(
        &self,
        _mint_url: &str,
        _keyset_id: &Id,
        start_counter: u32,
        batch_size: u32,
    ) -> WalletResult<RestoreBatch> {
        self.check_online()?;
        let state = self.state.lock().unwrap();

        let end = start_counter.saturating_add(batch_size);
        let mut proofs = Vec::new();
        let mut last_signed_index = None;
        for (&index, proof) in state.issued_by_index.range(start_counter..end) {
            proofs.push(proof.clone());
            last_signed_index = Some(index);
        }

        Ok(RestoreBatch { proofs, last_signed_index })
    }
}

// =============================================================================
// Multi-Mint Router
// =============================================================================

/// Routes capability calls to per-URL mock mints, the way a multi-mint
/// client fans out
#[derive(Default)]
pub struct MintRouter {
    mints: HashMap<String, Arc<MockMint>>,
}

impl MintRouter {
    pub fn with(mints: Vec<Arc<MockMint>>) -> Self {
        Self {
            mints: mints
                .into_iter()
                .map(|m| (m.mint_url.clone(), m))
                .collect(),
        }
    }

    fn route(&self, mint_url: &str) -> WalletResult<&Arc<MockMint>> {
        self.mints.get(mint_url).ok_or_else(|| WalletError::TransientNetwork {
            detail: format!("unknown mint {}", mint_url),
        })
    }
}

#[async_trait]
impl EcashClient for MintRouter {
    async fn load_mint(&self, mint_url: &str) -> WalletResult<MintSnapshot> {
        self.route(mint_url)?.load_mint(mint_url).await
    }

    async fn swap(
        &self,
        mint_url: &str,
        amount: u64,
        proofs: Proofs,
        counter: u32,
    ) -> WalletResult<SwapSplit> {
        self.route(mint_url)?.swap(mint_url, amount, proofs, counter).await
    }

    async fn receive(&self, token: &DecodedToken, counter: u32) -> WalletResult<Proofs> {
        self.route(&token.mint_url)?.receive(token, counter).await
    }

    async fn create_melt_quote(&self, mint_url: &str, request: &str) -> WalletResult<MeltQuote> {
        self.route(mint_url)?.create_melt_quote(mint_url, request).await
    }

    async fn melt(
        &self,
        mint_url: &str,
        quote: &MeltQuote,
        proofs: Proofs,
        counter: u32,
    ) -> WalletResult<MeltOutcome> {
        self.route(mint_url)?.melt(mint_url, quote, proofs, counter).await
    }

    async fn check_proof_states(
        &self,
        mint_url: &str,
        proofs: &Proofs,
    ) -> WalletResult<Vec<State>> {
        self.route(mint_url)?.check_proof_states(mint_url, proofs).await
    }

    async fn batch_restore(
        &self,
        mint_url: &str,
        keyset_id: &Id,
        start_counter: u32,
        batch_size: u32,
    ) -> WalletResult<RestoreBatch> {
        self.route(mint_url)?
            .batch_restore(mint_url, keyset_id, start_counter, batch_size)
            .await
    }
}

// =============================================================================
// Mock Transport & Contacts
// =============================================================================

/// Transport that records every published payload
#[derive(Default)]
pub struct RecordingTransport {
    pub published: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn wrap(
        &self,
        _sender: &nostr::Keys,
        recipient: &nostr::PublicKey,
        payload: &str,
    ) -> WalletResult<WrappedMessage> {
        Ok(WrappedMessage {
            wrap_id: uuid::Uuid::new_v4().to_string(),
            recipient: recipient.to_hex(),
            payload: payload.to_string(),
        })
    }

    async fn publish(
        &self,
        _wrap_for_self: &WrappedMessage,
        wrap_for_recipient: &WrappedMessage,
    ) -> WalletResult<PublishOutcome> {
        self.published.lock().unwrap().push((
            wrap_for_recipient.recipient.clone(),
            wrap_for_recipient.payload.clone(),
        ));
        Ok(PublishOutcome { any_success: true, error: None })
    }
}

impl RecordingTransport {
    pub fn payloads_for(&self, recipient_hex: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(recipient, _)| recipient == recipient_hex)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

/// Fixed contact book
#[derive(Default)]
pub struct FixedContacts {
    pub contacts: HashMap<String, nostr::PublicKey>,
}

impl FixedContacts {
    pub fn with(contact_id: &str, pubkey: nostr::PublicKey) -> Self {
        let mut contacts = HashMap::new();
        contacts.insert(contact_id.to_string(), pubkey);
        Self { contacts }
    }
}

#[async_trait]
impl ContactDirectory for FixedContacts {
    async fn pubkey_of(&self, contact_id: &str) -> WalletResult<Option<nostr::PublicKey>> {
        Ok(self.contacts.get(contact_id).copied())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub const MINT_URL: &str = "https://mint.example.com";

/// Counter key of the test mint's active keyset
pub fn test_counter_key() -> satchel::CounterKey {
    satchel::CounterKey::new(MINT_URL, "sat", TEST_KEYSET)
}

/// Engine plus the handles tests poke at directly
pub struct Harness {
    pub engine: satchel::SettlementEngine,
    pub counters: satchel::CounterStore,
    pub db: satchel::WalletDb,
    pub mint: Arc<MockMint>,
}

/// Build an engine over a mock mint and a fresh in-memory store
pub fn harness_with(mint: Arc<MockMint>) -> Harness {
    let store: Arc<satchel::MemoryStore> = Arc::new(satchel::MemoryStore::new());
    let db = satchel::WalletDb::new(store.clone());
    let counters = satchel::CounterStore::new(store);
    let engine = satchel::SettlementEngine::new(
        mint.clone(),
        db.clone(),
        counters.clone(),
        satchel::EngineConfig::default(),
    );
    Harness { engine, counters, db, mint }
}

impl Harness {
    /// Seed the wallet with a stored token worth `amount` whose proofs the
    /// mint considers live
    pub async fn seed_record(&self, amount: u64) -> satchel::TokenRecord {
        seed_record_at(&self.db, &self.counters, &self.mint, amount).await
    }
}

/// Seed a stored token at a specific mint, keeping the local counter in
/// step with the indices the seeding consumed
pub async fn seed_record_at(
    db: &satchel::WalletDb,
    counters: &satchel::CounterStore,
    mint: &MockMint,
    amount: u64,
) -> satchel::TokenRecord {
    let (proofs, next_free) = {
        let mut state = mint.state.lock().unwrap();
        let base = state
            .issued_by_index
            .keys()
            .next_back()
            .map(|i| i + 1)
            .unwrap_or(0);
        let amounts = denominations(amount);
        let proofs = mint.issue(&mut state, base, &amounts).unwrap();
        (proofs, base + amounts.len() as u32)
    };

    let key = satchel::CounterKey::new(&mint.mint_url, "sat", TEST_KEYSET);
    counters.ensure_at_least(&key, next_free).await.unwrap();

    let encoded =
        satchel::encode_token(&mint.mint_url, &CurrencyUnit::Sat, proofs, None).unwrap();
    let record = satchel::TokenRecord {
        id: uuid::Uuid::new_v4().to_string(),
        encoded_token: encoded,
        raw_token: None,
        mint_url: mint.mint_url.clone(),
        unit: "sat".to_string(),
        amount,
        state: satchel::TokenState::Accepted,
        error_text: None,
        deleted: false,
        created_at: 1,
    };
    db.insert_token(&record).await.unwrap();
    record
}
