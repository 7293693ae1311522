//! Blinding-index counter store
//!
//! Deterministic ecash outputs are derived from a seed plus a monotonic
//! per-(mint, unit, keyset) index. Reusing an index against a mint is
//! rejected ("signature already produced"), so every counter-consuming
//! operation must hold this store's per-key lock for the full
//! reserve-call-advance cycle. Restore cursors share the key shape but are
//! tracked independently: recovery scans are read-only against the mint.
//!
//! The lock is a keyed FIFO async mutex. It serializes interleaved tasks on
//! this event loop only; there is no cross-process coordination. Another
//! writer (a second app instance) racing the same keyset shows up as a
//! signature-conflict rejection, which callers absorb by skipping the
//! counter forward and retrying. Loss of this state never causes
//! double-spend: the mint is the final arbiter, a reused index fails
//! loudly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::{WalletError, WalletResult};
use crate::store::{counter_key, cursor_key, LocalStore};

/// Indices skipped forward on a signature-conflict rejection
pub const COUNTER_CONFLICT_SKIP: u32 = 64;

/// Bounded attempts for the skip-and-retry loop
pub const MAX_COUNTER_ATTEMPTS: u32 = 5;

/// Key of a counter entry: (normalized mint URL, unit, keyset id)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub mint_url: String,
    pub unit: String,
    pub keyset_id: String,
}

impl CounterKey {
    pub fn new(mint_url: &str, unit: &str, keyset_id: &str) -> Self {
        Self {
            mint_url: mint_url.to_string(),
            unit: unit.to_string(),
            keyset_id: keyset_id.to_string(),
        }
    }

    fn storage_key(&self) -> String {
        counter_key(&self.mint_url, &self.unit, &self.keyset_id)
    }

    fn cursor_storage_key(&self) -> String {
        cursor_key(&self.mint_url, &self.unit, &self.keyset_id)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.mint_url, self.unit, self.keyset_id)
    }
}

/// Guard for a held counter key; released on drop
pub struct CounterGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Per-(mint, unit, keyset) monotonic counters with a keyed FIFO lock
#[derive(Clone)]
pub struct CounterStore {
    store: Arc<dyn LocalStore>,
    locks: Arc<Mutex<HashMap<CounterKey, Arc<Mutex<()>>>>>,
}

impl CounterStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for one key. Waiters queue in FIFO order; holders of
    /// other keys proceed independently.
    pub async fn lock(&self, key: &CounterKey) -> CounterGuard {
        let entry = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let guard = entry.lock_owned().await;
        log::debug!("Acquired counter lock for {}", key);
        CounterGuard { _guard: guard }
    }

    /// Read the next free index for a key
    pub async fn next_counter(&self, key: &CounterKey) -> WalletResult<u32> {
        self.read_u32(&key.storage_key()).await
    }

    /// Advance the counter by `used` indices, returning the new value.
    /// Counters never decrease.
    pub async fn advance(&self, key: &CounterKey, used: u32) -> WalletResult<u32> {
        let current = self.next_counter(key).await?;
        let next = current.saturating_add(used);
        self.write_u32(&key.storage_key(), next).await?;
        log::debug!("Counter {} advanced {} -> {}", key, current, next);
        Ok(next)
    }

    /// Raise the counter to at least `at_least`, returning the stored value.
    /// A lower target is a no-op; monotonicity is preserved.
    pub async fn ensure_at_least(&self, key: &CounterKey, at_least: u32) -> WalletResult<u32> {
        let current = self.next_counter(key).await?;
        if at_least <= current {
            return Ok(current);
        }
        self.write_u32(&key.storage_key(), at_least).await?;
        log::debug!("Counter {} raised {} -> {}", key, current, at_least);
        Ok(at_least)
    }

    // ==========================================================================
    // Restore Cursors
    // ==========================================================================

    /// Highest index a recovery scan has covered for this key
    pub async fn restore_cursor(&self, key: &CounterKey) -> WalletResult<u32> {
        self.read_u32(&key.cursor_storage_key()).await
    }

    /// Raise the restore cursor; like the counter it never decreases
    pub async fn advance_restore_cursor(
        &self,
        key: &CounterKey,
        at_least: u32,
    ) -> WalletResult<u32> {
        let current = self.restore_cursor(key).await?;
        if at_least <= current {
            return Ok(current);
        }
        self.write_u32(&key.cursor_storage_key(), at_least).await?;
        Ok(at_least)
    }

    // ==========================================================================
    // Persistence
    // ==========================================================================

    async fn read_u32(&self, storage_key: &str) -> WalletResult<u32> {
        match self.store.get_kv(storage_key).await? {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|e| WalletError::Database(format!("corrupt counter {}: {}", storage_key, e))),
            None => Ok(0),
        }
    }

    async fn write_u32(&self, storage_key: &str, value: u32) -> WalletResult<()> {
        self.store.put_kv(storage_key, value.to_string()).await
    }
}
