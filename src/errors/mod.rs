use crate::pages::PageId;
use crate::txn_manager::TxnId;

/// Why the lock manager aborted a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Deadlock,
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Internal(String),
    NoFreeFrames,
    PageNotResident(PageId),
    DirectoryFull,
    TransactionAborted(TxnId, AbortReason),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Internal(context) => write!(f, "Internal Error: {context}."),
            Error::NoFreeFrames => write!(f, "No free frames to evict."),
            Error::PageNotResident(page_id) => {
                write!(f, "Page {page_id} is not in the buffer pool.")
            }
            Error::DirectoryFull => {
                write!(f, "Hash directory reached its maximum depth.")
            }
            Error::TransactionAborted(txn_id, reason) => {
                write!(f, "Transaction {txn_id} aborted: {reason:?}.")
            }
        }
    }
}
