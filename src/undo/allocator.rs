use std::collections::HashMap;

use anyhow::Result;

use super::log::{Persistence, UndoLogRegistry};
use super::UndoRecPtr;

/// Attaches sessions to logs and reserves address space for records, either
/// during normal operation or while reproducing the exact addresses a crash
/// needs during recovery.
pub struct UndoAllocator<'r> {
    registry: &'r UndoLogRegistry,
}

impl<'r> UndoAllocator<'r> {
    pub fn new(registry: &'r UndoLogRegistry) -> Self {
        UndoAllocator { registry }
    }

    pub fn attach(&self, persistence: Persistence, tablespace: u32) -> Result<u32> {
        self.registry.attach(persistence, tablespace)
    }

    pub fn detach(&self, log_number: u32) {
        self.registry.detach(log_number)
    }

    /// Reserves `size` bytes on `log_number`, advancing `insert` past any
    /// segment boundary crossed. Returns the pointer the record will start
    /// at; the caller still owes a matching `advance_insert` once the bytes
    /// are actually written.
    pub fn allocate(&self, log_number: u32, size: u64) -> Result<UndoRecPtr> {
        self.registry.with_log(log_number, |log| log.reserve(size))
    }

    /// Recovery-time counterpart of `allocate`: looks up (or creates) the log
    /// a given transaction was writing to before the crash via `recovery_map`,
    /// so the replayed allocation lands at the identical address the DO side
    /// produced.
    pub fn allocate_in_recovery(
        &self,
        recovery_map: &mut HashMap<u64, u32>,
        xid: u64,
        persistence: Persistence,
        tablespace: u32,
        size: u64,
    ) -> Result<UndoRecPtr> {
        let log_number = match recovery_map.get(&xid) {
            Some(&number) => number,
            None => {
                let number = self.registry.attach(persistence, tablespace)?;
                recovery_map.insert(xid, number);
                number
            }
        };
        self.allocate(log_number, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn recovery_allocation_reuses_the_same_log_for_a_repeat_xid() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let allocator = UndoAllocator::new(&registry);
        let mut map = HashMap::new();

        let first = allocator
            .allocate_in_recovery(&mut map, 100, Persistence::Permanent, 0, 32)
            .unwrap();
        let second = allocator
            .allocate_in_recovery(&mut map, 100, Persistence::Permanent, 0, 32)
            .unwrap();

        assert_eq!(first.log_number(), second.log_number());
    }
}
