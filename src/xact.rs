use std::collections::HashMap;

use crate::undo::log::Persistence;

/// Transaction identifier. A newtype rather than a bare `u64` so that
/// mixing it up with an undo offset or a block number is a type error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Xid(pub u64);

impl Xid {
    pub const INVALID: Xid = Xid(0);
}

/// The minimal contract the undo and redo subsystems need from a foreground
/// transaction manager: a current transaction id, the persistence class it
/// is writing at, and the per-persistence "last xid seen on this log" table
/// that `PrepareUndoInsert` consults to detect the first record of a new top
/// transaction. Snapshot computation, visibility, and commit/abort bookkeeping
/// live outside this crate.
pub struct TransactionContext {
    pub xid: Xid,
    persistence: Persistence,
    attached_log: Option<u32>,
    prev_txid: HashMap<Persistence, u64>,
}

impl TransactionContext {
    pub fn new(xid: Xid, persistence: Persistence) -> Self {
        TransactionContext {
            xid,
            persistence,
            attached_log: None,
            prev_txid: HashMap::new(),
        }
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn attached_log(&self) -> Option<u32> {
        self.attached_log
    }

    pub fn set_attached_log(&mut self, log_number: u32) {
        self.attached_log = Some(log_number);
    }

    /// True when no record has yet been written for `self.xid` on the
    /// current persistence's log — i.e. this will be the first record of a
    /// new top transaction there.
    pub fn is_first_record_of_transaction(&self) -> bool {
        self.prev_txid.get(&self.persistence) != Some(&self.xid.0)
    }

    pub fn note_record_written(&mut self) {
        self.prev_txid.insert(self.persistence, self.xid.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_record_detection_flips_after_one_write() {
        let mut ctx = TransactionContext::new(Xid(7), Persistence::Permanent);
        assert!(ctx.is_first_record_of_transaction());
        ctx.note_record_written();
        assert!(!ctx.is_first_record_of_transaction());
    }

    #[test]
    fn a_new_xid_is_first_again() {
        let mut ctx = TransactionContext::new(Xid(7), Persistence::Permanent);
        ctx.note_record_written();
        ctx.xid = Xid(8);
        assert!(ctx.is_first_record_of_transaction());
    }
}
