use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::errors::{AbortReason, Error};
use crate::printdbg;
use crate::txn_manager::{
    IsolationLevel, Transaction, TransactionManager, TransactionState, TxnId, INVALID_TXN_ID,
};
use crate::types::Rid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
        }
    }
}

/// Per-row wait queue. The granted prefix is always consistent with
/// `share_count` and `writing`; a granted writer implies no granted
/// readers and vice versa.
#[derive(Debug)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    share_count: usize,
    /// Txn holding the exclusive lock, or [`INVALID_TXN_ID`].
    writing: TxnId,
    /// Txn with an upgrade in flight, or [`INVALID_TXN_ID`]. At most one.
    upgrading: TxnId,
    cv: Arc<Condvar>,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self {
            requests: VecDeque::new(),
            share_count: 0,
            writing: INVALID_TXN_ID,
            upgrading: INVALID_TXN_ID,
            cv: Arc::new(Condvar::new()),
        }
    }
}

type LockTable = HashMap<Rid, LockRequestQueue>;

/// Grant every request from the head of the queue that is compatible with
/// the currently held set, stopping at the first incompatible one.
/// Returns whether anything changed; callers notify the queue if so.
fn grant_lock(queue: &mut LockRequestQueue) -> bool {
    let mut changed = false;

    for request in queue.requests.iter_mut() {
        if request.granted {
            continue;
        }
        if queue.writing == INVALID_TXN_ID && queue.share_count == 0 {
            request.granted = true;
            changed = true;
            match request.mode {
                LockMode::Shared => queue.share_count = 1,
                LockMode::Exclusive => queue.writing = request.txn_id,
            }
        } else if queue.share_count > 0 {
            if request.mode == LockMode::Shared {
                request.granted = true;
                changed = true;
                queue.share_count += 1;
            } else {
                break;
            }
        } else {
            // a writer holds the row
            break;
        }
    }

    changed
}

/// Row-granularity shared/exclusive locks with wound-wait deadlock
/// prevention: an older transaction never waits behind a younger one, it
/// aborts the youngster instead. One mutex guards every queue; waiters
/// park on their queue's condvar, which releases the mutex.
pub struct LockManager {
    txn_manager: Arc<TransactionManager>,
    latch: Mutex<LockTable>,
}

impl LockManager {
    pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
        Self {
            txn_manager,
            latch: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a transaction aborted and strip the lock-set entry for the
    /// queue slot that was just removed on its behalf.
    fn wound(&self, victim_id: TxnId, rid: Rid, mode: LockMode) {
        printdbg!("Wound-wait aborting txn {victim_id} on {rid:?}");

        if let Some(victim) = self.txn_manager.get_transaction(victim_id) {
            match mode {
                LockMode::Shared => victim.remove_shared(rid),
                LockMode::Exclusive => victim.remove_exclusive(rid),
            }
            victim.set_state(TransactionState::Aborted);
        }
    }

    /// Drop a request a dying waiter leaves behind, fixing the held set if
    /// the request got granted between the wound and the wake-up. Keeps
    /// the invariant that no queue holds a granted entry of an aborted
    /// transaction.
    fn abandon_request(table: &mut LockTable, rid: Rid, txn_id: TxnId) {
        let Some(queue) = table.get_mut(&rid) else {
            return;
        };

        if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn_id) {
            let request = queue.requests.remove(pos).unwrap();
            if request.granted {
                match request.mode {
                    LockMode::Shared => queue.share_count -= 1,
                    LockMode::Exclusive => queue.writing = INVALID_TXN_ID,
                }
            }
        }
        if queue.upgrading == txn_id {
            queue.upgrading = INVALID_TXN_ID;
        }

        if grant_lock(queue) {
            queue.cv.notify_all();
        }
        if queue.requests.is_empty() {
            table.remove(&rid);
        }
    }

    /// Park until the request is granted or the transaction is wounded.
    fn wait_for_grant(
        &self,
        table: &mut MutexGuard<'_, LockTable>,
        cv: &Condvar,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<()> {
        loop {
            if txn.get_state() == TransactionState::Aborted {
                Self::abandon_request(table, rid, txn.get_id());
                bail!(Error::TransactionAborted(
                    txn.get_id(),
                    AbortReason::Deadlock
                ));
            }

            let granted = table
                .get(&rid)
                .and_then(|queue| queue.requests.iter().find(|r| r.txn_id == txn.get_id()))
                .map(|r| r.granted);

            match granted {
                Some(true) => return Ok(()),
                _ => cv.wait(table),
            }
        }
    }

    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> Result<bool> {
        let mut table = self.latch.lock();

        if txn.get_state() == TransactionState::Aborted {
            bail!(Error::TransactionAborted(
                txn.get_id(),
                AbortReason::Deadlock
            ));
        }
        if txn.get_isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            bail!(Error::TransactionAborted(
                txn.get_id(),
                AbortReason::LockSharedOnReadUncommitted
            ));
        }
        if txn.get_state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            bail!(Error::TransactionAborted(
                txn.get_id(),
                AbortReason::LockOnShrinking
            ));
        }

        let cv = {
            let queue = table.entry(rid).or_default();

            // walk from the tail, skipping readers: wound every younger
            // writer, stop at the first older one
            let mut wounded = vec![];
            let mut i = queue.requests.len();
            while i > 0 {
                i -= 1;
                let request = &queue.requests[i];
                if request.mode == LockMode::Shared {
                    continue;
                }
                if request.txn_id > txn.get_id() {
                    if request.granted {
                        queue.writing = INVALID_TXN_ID;
                    }
                    wounded.push(request.txn_id);
                    queue.requests.remove(i).unwrap();
                } else {
                    break;
                }
            }

            queue
                .requests
                .push_back(LockRequest::new(txn.get_id(), LockMode::Shared));

            if grant_lock(queue) || !wounded.is_empty() {
                queue.cv.notify_all();
            }
            for victim_id in &wounded {
                self.wound(*victim_id, rid, LockMode::Exclusive);
            }
            queue.cv.clone()
        };

        self.wait_for_grant(&mut table, &cv, txn, rid)?;
        txn.add_shared(rid);

        Ok(true)
    }

    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> Result<bool> {
        let mut table = self.latch.lock();

        if txn.get_state() == TransactionState::Aborted {
            bail!(Error::TransactionAborted(
                txn.get_id(),
                AbortReason::Deadlock
            ));
        }
        if txn.get_state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            bail!(Error::TransactionAborted(
                txn.get_id(),
                AbortReason::LockOnShrinking
            ));
        }

        let cv = {
            let queue = table.entry(rid).or_default();

            // a writer conflicts with everything: wound every younger
            // request in the queue, reader or writer, granted or not
            let mut wounded = vec![];
            let mut i = queue.requests.len();
            while i > 0 {
                i -= 1;
                let request = &queue.requests[i];
                if request.txn_id > txn.get_id() {
                    if request.granted {
                        match request.mode {
                            LockMode::Shared => queue.share_count -= 1,
                            LockMode::Exclusive => queue.writing = INVALID_TXN_ID,
                        }
                    }
                    wounded.push((request.txn_id, request.mode));
                    queue.requests.remove(i).unwrap();
                }
            }

            queue
                .requests
                .push_back(LockRequest::new(txn.get_id(), LockMode::Exclusive));

            if grant_lock(queue) || !wounded.is_empty() {
                queue.cv.notify_all();
            }
            for (victim_id, mode) in &wounded {
                self.wound(*victim_id, rid, *mode);
            }
            queue.cv.clone()
        };

        self.wait_for_grant(&mut table, &cv, txn, rid)?;
        txn.add_exclusive(rid);

        Ok(true)
    }

    /// Trade a granted shared lock for an exclusive one. The new request
    /// slots in right after the granted readers, ahead of every plain
    /// waiter. Only one upgrade may be in flight per row.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> Result<bool> {
        let mut table = self.latch.lock();

        if txn.get_state() == TransactionState::Aborted {
            bail!(Error::TransactionAborted(
                txn.get_id(),
                AbortReason::Deadlock
            ));
        }
        if txn.get_state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            bail!(Error::TransactionAborted(
                txn.get_id(),
                AbortReason::LockOnShrinking
            ));
        }

        let cv = {
            let queue = table.entry(rid).or_default();

            if queue.upgrading != INVALID_TXN_ID {
                bail!(Error::TransactionAborted(
                    txn.get_id(),
                    AbortReason::UpgradeConflict
                ));
            }
            assert!(queue.share_count > 0, "upgrade without a granted reader");

            txn.remove_shared(rid);

            let pos = queue
                .requests
                .iter()
                .position(|r| r.txn_id == txn.get_id())
                .expect("upgrade without a shared lock on the row");
            debug_assert!(
                queue.requests[pos].granted && queue.requests[pos].mode == LockMode::Shared
            );
            queue.requests.remove(pos).unwrap();
            queue.share_count -= 1;

            // boundary between the granted readers and the waiters
            let boundary = queue.share_count;
            queue
                .requests
                .insert(boundary, LockRequest::new(txn.get_id(), LockMode::Exclusive));
            queue.upgrading = txn.get_id();

            // younger granted readers can never coexist with our writer
            let mut wounded = vec![];
            let mut i = boundary;
            while i > 0 {
                i -= 1;
                let request = &queue.requests[i];
                if request.txn_id > txn.get_id() {
                    debug_assert!(request.granted && request.mode == LockMode::Shared);
                    wounded.push(request.txn_id);
                    queue.requests.remove(i).unwrap();
                    queue.share_count -= 1;
                }
            }

            if grant_lock(queue) || !wounded.is_empty() {
                queue.cv.notify_all();
            }
            for victim_id in &wounded {
                self.wound(*victim_id, rid, LockMode::Shared);
            }
            queue.cv.clone()
        };

        self.wait_for_grant(&mut table, &cv, txn, rid)?;

        let queue = table.get_mut(&rid).expect("upgraded queue vanished");
        queue.upgrading = INVALID_TXN_ID;
        txn.add_exclusive(rid);

        Ok(true)
    }

    /// Release whichever lock the transaction holds on the row. Returns
    /// false when it holds none (e.g. it was already stripped by a
    /// wound). First release flips a repeatable-read transaction into its
    /// shrinking phase; weaker levels may keep growing.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> Result<bool> {
        let mut table = self.latch.lock();

        let Some(queue) = table.get_mut(&rid) else {
            return Ok(false);
        };
        let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.get_id())
        else {
            return Ok(false);
        };

        txn.remove_shared(rid);
        txn.remove_exclusive(rid);

        if txn.get_isolation_level() == IsolationLevel::RepeatableRead
            && txn.get_state() == TransactionState::Growing
        {
            txn.set_state(TransactionState::Shrinking);
        }

        let request = queue.requests.remove(pos).unwrap();
        debug_assert!(request.granted, "unlock of a never-granted request");
        if request.granted {
            match request.mode {
                LockMode::Shared => queue.share_count -= 1,
                LockMode::Exclusive => queue.writing = INVALID_TXN_ID,
            }
        }

        if grant_lock(queue) {
            queue.cv.notify_all();
        }
        if queue.requests.is_empty() {
            table.remove(&rid);
        }

        Ok(true)
    }

    /// Release every lock a transaction holds; the commit/abort path.
    pub fn release_all(&self, txn: &Transaction) -> Result<()> {
        for rid in txn.held_rids() {
            self.unlock(txn, rid)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<TransactionManager>, Arc<LockManager>) {
        let tm = Arc::new(TransactionManager::new());
        let lm = Arc::new(LockManager::new(tm.clone()));
        (tm, lm)
    }

    fn abort_reason(err: &anyhow::Error) -> AbortReason {
        match err.downcast_ref::<Error>() {
            Some(Error::TransactionAborted(_, reason)) => *reason,
            other => panic!("expected an abort, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_lock_roundtrip() -> Result<()> {
        let (tm, lm) = setup();
        let rid = Rid::new(1, 1);

        let txn = tm.begin(IsolationLevel::RepeatableRead);
        assert!(lm.lock_shared(&txn, rid)?);
        assert!(txn.holds_shared(rid));

        assert!(lm.unlock(&txn, rid)?);
        assert!(txn.held_rids().is_empty());
        // repeatable read enters its shrinking phase on first release
        assert_eq!(txn.get_state(), TransactionState::Shrinking);

        // the queue is gone once its last request leaves
        assert!(!lm.unlock(&txn, rid)?);

        Ok(())
    }

    #[test]
    fn test_shared_locks_coexist() -> Result<()> {
        let (tm, lm) = setup();
        let rid = Rid::new(1, 1);

        let t0 = tm.begin(IsolationLevel::RepeatableRead);
        let t1 = tm.begin(IsolationLevel::RepeatableRead);

        assert!(lm.lock_shared(&t0, rid)?);
        assert!(lm.lock_shared(&t1, rid)?);

        assert!(t0.holds_shared(rid));
        assert!(t1.holds_shared(rid));

        lm.unlock(&t0, rid)?;
        lm.unlock(&t1, rid)?;

        Ok(())
    }

    #[test]
    fn test_exclusive_then_unlock() -> Result<()> {
        let (tm, lm) = setup();
        let rid = Rid::new(2, 7);

        let txn = tm.begin(IsolationLevel::ReadCommitted);
        assert!(lm.lock_exclusive(&txn, rid)?);
        assert!(txn.holds_exclusive(rid));

        assert!(lm.unlock(&txn, rid)?);
        assert!(txn.held_rids().is_empty());
        // weaker isolation levels may release without shrinking
        assert_eq!(txn.get_state(), TransactionState::Growing);

        Ok(())
    }

    #[test]
    fn test_shared_on_read_uncommitted_aborts() {
        let (tm, lm) = setup();
        let txn = tm.begin(IsolationLevel::ReadUncommitted);

        let err = lm.lock_shared(&txn, Rid::new(1, 1)).unwrap_err();
        assert_eq!(
            abort_reason(&err),
            AbortReason::LockSharedOnReadUncommitted
        );
        assert_eq!(txn.get_state(), TransactionState::Aborted);
    }

    #[test]
    fn test_lock_on_shrinking_aborts() -> Result<()> {
        let (tm, lm) = setup();
        let txn = tm.begin(IsolationLevel::RepeatableRead);

        lm.lock_shared(&txn, Rid::new(1, 1))?;
        lm.unlock(&txn, Rid::new(1, 1))?;
        assert_eq!(txn.get_state(), TransactionState::Shrinking);

        let err = lm.lock_shared(&txn, Rid::new(1, 2)).unwrap_err();
        assert_eq!(abort_reason(&err), AbortReason::LockOnShrinking);
        assert_eq!(txn.get_state(), TransactionState::Aborted);

        // every further acquisition fails as a deadlock abort
        let err = lm.lock_exclusive(&txn, Rid::new(1, 3)).unwrap_err();
        assert_eq!(abort_reason(&err), AbortReason::Deadlock);

        Ok(())
    }

    #[test]
    fn test_older_writer_wounds_younger_holder() -> Result<()> {
        let (tm, lm) = setup();
        let rid = Rid::new(3, 3);

        let t0 = tm.begin(IsolationLevel::RepeatableRead);
        let t1 = tm.begin(IsolationLevel::RepeatableRead);

        // the younger transaction takes the lock first
        assert!(lm.lock_exclusive(&t1, rid)?);

        // the older one does not wait: it kills the youngster
        assert!(lm.lock_exclusive(&t0, rid)?);

        assert_eq!(t1.get_state(), TransactionState::Aborted);
        assert!(!t1.holds_exclusive(rid));
        assert!(t0.holds_exclusive(rid));

        lm.unlock(&t0, rid)?;

        Ok(())
    }

    #[test]
    fn test_wounded_waiter_wakes_and_reports_deadlock() -> Result<()> {
        let (tm, lm) = setup();
        let rid = Rid::new(4, 4);

        let t0 = tm.begin(IsolationLevel::RepeatableRead);
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let t2 = tm.begin(IsolationLevel::RepeatableRead);

        assert!(lm.lock_exclusive(&t1, rid)?);

        // t2 is younger than t1, so it queues up behind it
        let waiter = {
            let lm = lm.clone();
            let t2 = t2.clone();
            thread::spawn(move || lm.lock_exclusive(&t2, rid))
        };
        thread::sleep(Duration::from_millis(50));

        // the oldest transaction wounds both the holder and the waiter
        assert!(lm.lock_exclusive(&t0, rid)?);
        assert!(t0.holds_exclusive(rid));
        assert_eq!(t1.get_state(), TransactionState::Aborted);

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(abort_reason(&err), AbortReason::Deadlock);
        assert_eq!(t2.get_state(), TransactionState::Aborted);

        lm.unlock(&t0, rid)?;

        Ok(())
    }

    #[test]
    fn test_older_reader_waits_behind_older_writer() -> Result<()> {
        let (tm, lm) = setup();
        let rid = Rid::new(5, 5);

        let t0 = tm.begin(IsolationLevel::RepeatableRead);
        let t1 = tm.begin(IsolationLevel::RepeatableRead);

        assert!(lm.lock_exclusive(&t0, rid)?);

        // the younger reader must wait, not wound
        let waiter = {
            let lm = lm.clone();
            let t1 = t1.clone();
            thread::spawn(move || lm.lock_shared(&t1, rid))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(t1.get_state(), TransactionState::Growing);
        assert!(!t1.holds_shared(rid));

        lm.unlock(&t0, rid)?;

        assert!(waiter.join().unwrap()?);
        assert!(t1.holds_shared(rid));
        lm.unlock(&t1, rid)?;

        Ok(())
    }

    #[test]
    fn test_upgrade_wounds_younger_readers() -> Result<()> {
        let (tm, lm) = setup();
        let rid = Rid::new(6, 6);

        let t0 = tm.begin(IsolationLevel::RepeatableRead);
        let t1 = tm.begin(IsolationLevel::RepeatableRead);

        assert!(lm.lock_shared(&t0, rid)?);
        assert!(lm.lock_shared(&t1, rid)?);

        // the younger reader blocks the upgrade, so it gets wounded
        assert!(lm.lock_upgrade(&t0, rid)?);

        assert!(t0.holds_exclusive(rid));
        assert!(!t0.holds_shared(rid));
        assert_eq!(t1.get_state(), TransactionState::Aborted);

        lm.unlock(&t0, rid)?;

        Ok(())
    }

    #[test]
    fn test_concurrent_upgrade_conflicts() -> Result<()> {
        let (tm, lm) = setup();
        let rid = Rid::new(7, 7);

        let t0 = tm.begin(IsolationLevel::RepeatableRead);
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let t2 = tm.begin(IsolationLevel::RepeatableRead);

        assert!(lm.lock_shared(&t0, rid)?);
        assert!(lm.lock_shared(&t1, rid)?);
        assert!(lm.lock_shared(&t2, rid)?);

        // t1's upgrade wounds the younger t2 but still waits for t0
        let upgrader = {
            let lm = lm.clone();
            let t1 = t1.clone();
            thread::spawn(move || lm.lock_upgrade(&t1, rid))
        };
        thread::sleep(Duration::from_millis(50));

        assert_eq!(t2.get_state(), TransactionState::Aborted);
        assert_eq!(t1.get_state(), TransactionState::Growing);

        // a second upgrade on the same row is refused outright
        let err = lm.lock_upgrade(&t0, rid).unwrap_err();
        assert_eq!(abort_reason(&err), AbortReason::UpgradeConflict);

        // releasing the last reader lets the upgrade through
        lm.unlock(&t0, rid)?;
        assert!(upgrader.join().unwrap()?);
        assert!(t1.holds_exclusive(rid));

        lm.unlock(&t1, rid)?;

        Ok(())
    }

    #[test]
    fn test_release_all_on_commit() -> Result<()> {
        let (tm, lm) = setup();

        let txn = tm.begin(IsolationLevel::RepeatableRead);
        lm.lock_shared(&txn, Rid::new(8, 1))?;
        lm.lock_exclusive(&txn, Rid::new(8, 2))?;

        tm.commit(&txn, &lm)?;

        assert!(txn.held_rids().is_empty());
        assert_eq!(txn.get_state(), TransactionState::Committed);

        // the rows are free for others
        let other = tm.begin(IsolationLevel::RepeatableRead);
        assert!(lm.lock_exclusive(&other, Rid::new(8, 1))?);
        assert!(lm.lock_exclusive(&other, Rid::new(8, 2))?);

        Ok(())
    }

    #[test]
    fn test_release_all_on_abort() -> Result<()> {
        let (tm, lm) = setup();

        let txn = tm.begin(IsolationLevel::ReadCommitted);
        lm.lock_exclusive(&txn, Rid::new(9, 1))?;

        tm.abort(&txn, &lm)?;

        assert!(txn.held_rids().is_empty());
        assert_eq!(txn.get_state(), TransactionState::Aborted);

        Ok(())
    }
}
