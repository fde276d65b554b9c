//! Per-wallet chain tips
//!
//! Read-through on a miss (the store's newest record), write-through after a
//! successful append, dropped after a failed one. Each wallet has its own
//! slot mutex; holding the slot for the whole read-link-append-update cycle
//! is what keeps two appends for one wallet from reusing the same tip.

use super::record::ChainTip;
use crate::{storage::AuditStore, types::WalletId, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Cached tips keyed by wallet
#[derive(Debug, Default)]
pub struct TipCache {
    slots: DashMap<WalletId, Arc<Mutex<TipSlot>>>,
}

/// One wallet's cached tip
#[derive(Debug, Default)]
pub struct TipSlot {
    loaded: bool,
    tip: Option<ChainTip>,
}

impl TipSlot {
    /// Current tip, loading it from `store` on first use
    pub fn tip(&mut self, store: &dyn AuditStore, wallet_id: &WalletId) -> Result<Option<ChainTip>> {
        if !self.loaded {
            self.tip = store.latest_audit_record(wallet_id)?.map(|r| r.tip());
            self.loaded = true;
        }
        Ok(self.tip.clone())
    }

    /// Record a successful append
    pub fn advance(&mut self, tip: ChainTip) {
        self.tip = Some(tip);
        self.loaded = true;
    }

    /// Forget the cached value; the next read goes to the store
    pub fn invalidate(&mut self) {
        self.tip = None;
        self.loaded = false;
    }

    /// Whether the slot currently holds a store-confirmed value
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

impl TipCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, wallet_id: &WalletId) -> Arc<Mutex<TipSlot>> {
        if let Some(slot) = self.slots.get(wallet_id) {
            return Arc::clone(&slot);
        }
        Arc::clone(&self.slots.entry(wallet_id.clone()).or_default())
    }

    /// Run `f` with exclusive access to one wallet's slot
    pub fn with_slot<T>(&self, wallet_id: &WalletId, f: impl FnOnce(&mut TipSlot) -> T) -> T {
        let slot = self.slot(wallet_id);
        let mut guard: MutexGuard<'_, TipSlot> = slot.lock();
        f(&mut *guard)
    }

    /// Cached tip without touching the store
    pub fn peek(&self, wallet_id: &WalletId) -> Option<ChainTip> {
        let slot = self.slots.get(wallet_id).map(|slot| Arc::clone(&slot))?;
        let tip = slot.lock().tip.clone();
        tip
    }

    /// Number of wallets with a slot
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no wallet has a slot
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
