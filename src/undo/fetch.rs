use anyhow::Result;

use super::log::UndoLogRegistry;
use super::record::UnpackedUndoRecord;
use super::UndoRecPtr;

const PROBE_LEN: usize = 8192;

/// Address of the record immediately preceding `urp` on the same log, given
/// that record's on-disk length.
pub fn prev_record_pointer(urp: UndoRecPtr, prevlen: u64) -> UndoRecPtr {
    urp.prev(prevlen)
}

/// Walks the per-block `blkprev` chain starting at `urp`, calling `callback`
/// on each record. Stops and returns that record when the callback returns
/// true, when the chain runs into the log's discard boundary, or — when
/// `block` is `None`, meaning the caller only wants the record `urp` points
/// at unconditionally — after the very first record.
pub fn fetch_record(
    registry: &UndoLogRegistry,
    urp: UndoRecPtr,
    block: Option<u32>,
    mut callback: impl FnMut(&UnpackedUndoRecord) -> bool,
) -> Result<Option<UnpackedUndoRecord>> {
    let mut current = urp;
    loop {
        if !current.is_valid() {
            return Ok(None);
        }

        let decoded = registry.with_log(current.log_number(), |log| {
            if current.offset() < log.discard {
                return Ok(None);
            }
            let available = log.insert.saturating_sub(current.offset());
            if available == 0 {
                return Ok(None);
            }
            let len = (available as usize).min(PROBE_LEN);
            let bytes = log.read_bytes(current.offset(), len)?;
            let (record, _) = UnpackedUndoRecord::decode(&bytes)?;
            Ok(Some(record))
        })?;

        let record = match decoded {
            Some(record) => record,
            None => return Ok(None),
        };

        if block.is_none() || callback(&record) {
            return Ok(Some(record));
        }

        current = match record.blkprev {
            Some(prev) if prev.is_valid() => prev,
            _ => return Ok(None),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::log::{Persistence, UndoLogRegistry};
    use crate::undo::record::UndoRecordType;
    use crate::xact::{TransactionContext, Xid};
    use crate::undo::stage::UndoStage;
    use tempfile::TempDir;

    fn insert_chained(registry: &UndoLogRegistry, ctx: &mut TransactionContext, stage: &mut UndoStage, blkprev: UndoRecPtr, xmax: u64) -> UndoRecPtr {
        let record = UnpackedUndoRecord::new(UndoRecordType::Delete, ctx.xid.0, 1)
            .with_block(0, 0, blkprev)
            .with_payload(xmax.to_le_bytes().to_vec());
        let urp = stage.prepare_undo_insert(registry, ctx, record).unwrap();
        stage.insert_prepared_undo(registry).unwrap();
        urp
    }

    #[test]
    fn walks_blkprev_chain_until_callback_matches() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let mut ctx = TransactionContext::new(Xid(1), Persistence::Permanent);
        let mut stage = UndoStage::new();

        let first = insert_chained(&registry, &mut ctx, &mut stage, UndoRecPtr::INVALID, 1);
        let second = insert_chained(&registry, &mut ctx, &mut stage, first, 2);
        let third = insert_chained(&registry, &mut ctx, &mut stage, second, 3);

        let found = fetch_record(&registry, third, Some(0), |record| record.payload == 1u64.to_le_bytes()).unwrap();
        assert_eq!(found.unwrap().blkprev, Some(first));
    }

    #[test]
    fn block_none_returns_unconditionally() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let mut ctx = TransactionContext::new(Xid(1), Persistence::Permanent);
        let mut stage = UndoStage::new();
        let urp = insert_chained(&registry, &mut ctx, &mut stage, UndoRecPtr::INVALID, 42);

        let found = fetch_record(&registry, urp, None, |_| false).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn stops_at_discard_boundary() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let mut ctx = TransactionContext::new(Xid(1), Persistence::Permanent);
        let mut stage = UndoStage::new();
        let urp = insert_chained(&registry, &mut ctx, &mut stage, UndoRecPtr::INVALID, 1);

        registry
            .with_log(urp.log_number(), |log| log.advance_discard(log.insert))
            .unwrap();

        let found = fetch_record(&registry, urp, Some(0), |_| true).unwrap();
        assert!(found.is_none());
    }
}
