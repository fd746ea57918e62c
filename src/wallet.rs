//! Wallet notifications
//!
//! Wallets are outside the ledger core; they only observe it. Every
//! registered listener hears about accepted transactions, best chain changes
//! and transactions that can no longer confirm.

use std::sync::Arc;

use crate::types::{Block, Hash, Transaction};

pub trait WalletListener: Send + Sync {
    /// A transaction entered the pool (`block` is `None`) or was connected in
    /// `block`
    fn on_transaction_accepted(&self, tx: &Transaction, block: Option<&Block>);

    fn on_best_chain_changed(&self, locator: &[Hash]);

    /// A transaction was dropped because a conflicting one confirmed, or a
    /// disconnected coinstake lost its block
    fn on_transaction_conflicted(&self, txid: &Hash);
}

#[derive(Default)]
pub struct WalletRegistry {
    listeners: Vec<Arc<dyn WalletListener>>,
}

impl WalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn WalletListener>) {
        self.listeners.push(listener);
    }

    /// Remove a listener by identity; returns whether it was registered
    pub fn unregister(&mut self, listener: &Arc<dyn WalletListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn sync_transaction(&self, tx: &Transaction, block: Option<&Block>) {
        for listener in &self.listeners {
            listener.on_transaction_accepted(tx, block);
        }
    }

    pub fn set_best_chain(&self, locator: &[Hash]) {
        for listener in &self.listeners {
            listener.on_best_chain_changed(locator);
        }
    }

    pub fn transaction_conflicted(&self, txid: &Hash) {
        for listener in &self.listeners {
            listener.on_transaction_conflicted(txid);
        }
    }
}
