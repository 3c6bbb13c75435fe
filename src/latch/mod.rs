use parking_lot::lock_api::RawRwLock;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A reader/writer latch with both raw (caller-paired) lock/unlock and
/// RAII guards. Raw locking is for latches that outlive a single scope,
/// e.g. a page latch held across buffer pool calls.
#[derive(Debug, Default)]
pub struct Latch {
    lock: RwLock<()>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    pub fn rlock(&self) {
        unsafe { self.lock.raw() }.lock_shared();
    }

    pub fn runlock(&self) {
        unsafe { self.lock.raw().unlock_shared() };
    }

    pub fn wlock(&self) {
        unsafe { self.lock.raw() }.lock_exclusive();
    }

    pub fn wunlock(&self) {
        unsafe { self.lock.raw().unlock_exclusive() };
    }

    pub fn rguard(&self) -> RwLockReadGuard<()> {
        self.lock.read()
    }

    pub fn wguard(&self) -> RwLockWriteGuard<()> {
        self.lock.write()
    }

    #[allow(unused)]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
