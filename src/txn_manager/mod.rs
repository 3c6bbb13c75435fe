use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::lock_manager::LockManager;
use crate::types::Rid;

pub type TxnId = u64;
pub const INVALID_TXN_ID: TxnId = TxnId::MAX;

/// Two-phase locking state. A transaction grows until its first unlock,
/// shrinks afterwards, and may not lock again once shrinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction record: id, isolation level, 2PL state, and the row locks
/// currently held. Ids increase monotonically, so a lower id always means
/// an older transaction; wound-wait leans on that ordering.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
}

impl Transaction {
    fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn get_id(&self) -> TxnId {
        self.id
    }

    pub fn get_isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn get_state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn holds_shared(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn holds_exclusive(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    /// Snapshot of every row this transaction holds a lock on.
    pub fn held_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    pub(crate) fn add_shared(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
    }

    pub(crate) fn add_exclusive(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_exclusive(&self, rid: Rid) {
        self.exclusive_lock_set.lock().remove(&rid);
    }
}

/// Hands out transaction ids and resolves them back to records; the lock
/// manager goes through here to wound lock holders it only knows by id.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    txn_table: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(0),
            txn_table: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let txn = Arc::new(Transaction::new(id, isolation_level));

        self.txn_table.lock().insert(id, txn.clone());

        txn
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_table.lock().get(&txn_id).cloned()
    }

    /// Release every lock, then mark the transaction committed.
    pub fn commit(&self, txn: &Transaction, lock_manager: &LockManager) -> Result<()> {
        lock_manager.release_all(txn)?;
        txn.set_state(TransactionState::Committed);

        Ok(())
    }

    /// Roll the transaction back: drop all its locks and mark it aborted.
    /// Also the cleanup path for wound-wait victims.
    pub fn abort(&self, txn: &Transaction, lock_manager: &LockManager) -> Result<()> {
        lock_manager.release_all(txn)?;
        txn.set_state(TransactionState::Aborted);

        Ok(())
    }
}
