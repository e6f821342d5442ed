use anyhow::{bail, Result};

use super::log::{Persistence, UndoLog};
use super::record::UnpackedUndoRecord;
use super::UndoRecPtr;

/// Enough bytes to cover a record's header plus every optional sub-block up
/// to and including TRANSACTION, but never its payload — that's all
/// `peek_next_field_offset` needs.
const PROBE_LEN: usize = 64;

/// Patches the previous top-transaction's first record's `next` field to
/// point at `new_urp`, in place. Silently does nothing for TEMP logs (no
/// other session can ever read them) or when the previous record has already
/// been discarded — the chain would be useless past that point anyway.
pub fn update_trans_info(log: &mut UndoLog, prev_urp: UndoRecPtr, new_urp: UndoRecPtr) -> Result<()> {
    if log.persistence == Persistence::Temp {
        return Ok(());
    }
    if prev_urp.offset() < log.discard {
        return Ok(());
    }
    if prev_urp.log_number() != log.log_number {
        bail!("transaction chain update crosses log boundary");
    }

    let probe = log.read_bytes(prev_urp.offset(), PROBE_LEN)?;
    let field_offset = UnpackedUndoRecord::peek_next_field_offset(&probe)?
        .ok_or_else(|| anyhow::anyhow!("previous transaction's first record has no transaction header"))?;

    log.write_bytes(prev_urp.offset() + field_offset as u64, &new_urp.as_raw().to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::log::UndoLogRegistry;
    use crate::undo::record::UndoRecordType;
    use tempfile::TempDir;

    #[test]
    fn patches_previous_transactions_next_pointer() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let log_number = registry.attach(Persistence::Permanent, 0).unwrap();

        let first_urp = registry
            .with_log(log_number, |log| {
                let record = UnpackedUndoRecord::new(UndoRecordType::Insert, 100, 1).mark_transaction_start();
                let size = record.expected_size() as u64;
                let urp = log.reserve(size)?;
                log.write_bytes(urp.offset(), &record.encode())?;
                log.advance_insert(urp, size)?;
                Ok(urp)
            })
            .unwrap();

        let second_urp = UndoRecPtr::new(log_number, first_urp.offset() + 1000);
        registry
            .with_log(log_number, |log| update_trans_info(log, first_urp, second_urp))
            .unwrap();

        let patched = registry
            .with_log(log_number, |log| {
                let bytes = log.read_bytes(first_urp.offset(), PROBE_LEN)?;
                let (record, _) = UnpackedUndoRecord::decode(&bytes)?;
                Ok(record.next)
            })
            .unwrap();
        assert_eq!(patched, Some(second_urp));
    }

    #[test]
    fn skips_when_already_discarded() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let log_number = registry.attach(Persistence::Permanent, 0).unwrap();

        registry
            .with_log(log_number, |log| {
                log.discard = 10_000_000;
                let prev = UndoRecPtr::new(log_number, 0);
                let next = UndoRecPtr::new(log_number, 1);
                // Would panic trying to read real bytes if not short-circuited.
                update_trans_info(log, prev, next)
            })
            .unwrap();
    }
}
