use anyhow::Result;

use crate::error::UndoError;
use crate::xact::TransactionContext;

use super::chain;
use super::log::UndoLogRegistry;
use super::record::UnpackedUndoRecord;
use super::UndoRecPtr;

const DEFAULT_CAPACITY: usize = 2;

struct PreparedUndo {
    record: UnpackedUndoRecord,
    log_number: u32,
    urp: UndoRecPtr,
    size: u64,
    is_first: bool,
    chain_update: Option<UndoRecPtr>,
}

/// Two-phase "prepare outside the critical section, insert inside it"
/// builder. `prepare_undo_insert` sizes, allocates and decides whether a
/// transaction-chain patch is needed; `insert_prepared_undo` performs the
/// actual byte writes. Dropping the stage without inserting simply discards
/// the reservations — nothing has been written yet, so there is nothing to
/// roll back.
pub struct UndoStage {
    prepared: Vec<PreparedUndo>,
    capacity: usize,
}

impl Default for UndoStage {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoStage {
    pub fn new() -> Self {
        UndoStage {
            prepared: Vec::with_capacity(DEFAULT_CAPACITY),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Grows the staging area to hold at least `n` records. Never shrinks —
    /// that happens automatically after `insert_prepared_undo` commits.
    pub fn set_prepare_size(&mut self, n: usize) {
        self.capacity = self.capacity.max(n);
    }

    pub fn prepare_undo_insert(
        &mut self,
        registry: &UndoLogRegistry,
        ctx: &mut TransactionContext,
        mut record: UnpackedUndoRecord,
    ) -> Result<UndoRecPtr> {
        if self.prepared.len() >= self.capacity {
            return Err(UndoError::StagingFull.into());
        }

        let log_number = match ctx.attached_log() {
            Some(n) => n,
            None => {
                let n = registry.attach(ctx.persistence(), 0)?;
                ctx.set_attached_log(n);
                n
            }
        };

        let is_first = ctx.is_first_record_of_transaction();
        if is_first {
            record = record.mark_transaction_start();
        }
        let size = record.expected_size() as u64;

        let (urp, prevlen, last_xact_start) = registry.with_log(log_number, |log| {
            let urp = log.reserve(size)?;
            // When the reservation had to skip a page header to reach its
            // start, fold that header into prevlen too, so `urp - prevlen`
            // still lands on the previous record's first byte.
            let prevlen = log.prevlen as u64 + log.last_reserve_header_skip;
            Ok((urp, prevlen as u32, log.last_xact_start))
        })?;
        record.prevlen = prevlen;

        let chain_update = if is_first && last_xact_start != 0 {
            Some(UndoRecPtr::new(log_number, last_xact_start))
        } else {
            None
        };

        self.prepared.push(PreparedUndo {
            record,
            log_number,
            urp,
            size,
            is_first,
            chain_update,
        });
        ctx.note_record_written();

        Ok(urp)
    }

    /// Performs the actual writes. Callers are expected to hold whatever
    /// serializes concurrent writers to these logs — in this crate that is
    /// simply the single-writer-per-log rule the registry enforces via
    /// attachment.
    pub fn insert_prepared_undo(&mut self, registry: &UndoLogRegistry) -> Result<()> {
        for staged in self.prepared.drain(..) {
            registry.with_log(staged.log_number, |log| {
                let bytes = staged.record.encode();
                log.write_bytes(staged.urp.offset(), &bytes)?;
                log.advance_insert(staged.urp, staged.size)?;
                if staged.is_first {
                    log.last_xact_start = staged.urp.offset();
                }
                Ok(())
            })?;

            if let Some(prev_urp) = staged.chain_update {
                registry.with_log(staged.log_number, |log| {
                    chain::update_trans_info(log, prev_urp, staged.urp)
                })?;
            }
        }

        if self.capacity > DEFAULT_CAPACITY {
            self.capacity = DEFAULT_CAPACITY;
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.prepared.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::log::Persistence;
    use crate::undo::record::UndoRecordType;
    use crate::xact::Xid;
    use tempfile::TempDir;

    #[test]
    fn first_record_of_a_transaction_gets_the_transaction_header() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let mut ctx = TransactionContext::new(Xid(100), Persistence::Permanent);
        let mut stage = UndoStage::new();

        let record = UnpackedUndoRecord::new(UndoRecordType::Insert, 100, 1).with_block(0, 0, UndoRecPtr::INVALID);
        let urp = stage.prepare_undo_insert(&registry, &mut ctx, record).unwrap();
        stage.insert_prepared_undo(&registry).unwrap();

        let read_back = registry
            .with_log(urp.log_number(), |log| log.read_bytes(urp.offset(), 64))
            .unwrap();
        let (decoded, _) = UnpackedUndoRecord::decode(&read_back).unwrap();
        assert!(decoded.is_transaction_start());
    }

    #[test]
    fn second_record_of_same_transaction_has_no_transaction_header() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let mut ctx = TransactionContext::new(Xid(100), Persistence::Permanent);
        let mut stage = UndoStage::new();

        let first = UnpackedUndoRecord::new(UndoRecordType::Insert, 100, 1).with_block(0, 0, UndoRecPtr::INVALID);
        stage.prepare_undo_insert(&registry, &mut ctx, first).unwrap();
        stage.insert_prepared_undo(&registry).unwrap();

        let second = UnpackedUndoRecord::new(UndoRecordType::Delete, 100, 1).with_block(0, 0, UndoRecPtr::INVALID);
        let urp = stage.prepare_undo_insert(&registry, &mut ctx, second).unwrap();
        stage.insert_prepared_undo(&registry).unwrap();

        let read_back = registry
            .with_log(urp.log_number(), |log| log.read_bytes(urp.offset(), 64))
            .unwrap();
        let (decoded, _) = UnpackedUndoRecord::decode(&read_back).unwrap();
        assert!(!decoded.is_transaction_start());
    }

    #[test]
    fn staging_beyond_capacity_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let mut ctx = TransactionContext::new(Xid(1), Persistence::Permanent);
        let mut stage = UndoStage::new();

        for _ in 0..2 {
            let record = UnpackedUndoRecord::new(UndoRecordType::Insert, 1, 1).with_block(0, 0, UndoRecPtr::INVALID);
            stage.prepare_undo_insert(&registry, &mut ctx, record).unwrap();
        }
        let record = UnpackedUndoRecord::new(UndoRecordType::Insert, 1, 1).with_block(0, 0, UndoRecPtr::INVALID);
        assert!(stage.prepare_undo_insert(&registry, &mut ctx, record).is_err());
    }
}
