use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Result};

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::error::UndoError;
use crate::fsm::{FreeSpaceMap, InMemoryFreeSpaceMap};
use crate::page::{Page, PAGE_SIZE};
use crate::undo::{
    chain, Persistence, UndoAllocator, UndoLogRegistry, UndoRecPtr, UndoRecordType, UnpackedUndoRecord,
};
use crate::wal::{Lsn, WalRecord, WalRecordType};
use crate::xact::{TransactionContext, Xid};

const LOW_SPACE_THRESHOLD: usize = PAGE_SIZE / 5;

fn encode_newtid(block: u32, offset: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.extend_from_slice(&block.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf
}

/// Replays a WAL stream against a data page store and the undo subsystem,
/// reproducing the exact undo addresses the DO side computed.
///
/// Recovery is single-threaded: one dispatcher, one pass over the record
/// stream, reusing `recovery_map` and `xact_contexts` across every record so
/// a transaction's later records keep landing on the log it started on.
pub struct RedoDispatcher<F: FreeSpaceMap = InMemoryFreeSpaceMap> {
    data_pool: BufferPoolManager,
    undo_registry: UndoLogRegistry,
    recovery_map: HashMap<u64, u32>,
    xact_contexts: HashMap<u64, TransactionContext>,
    last_block_urp: HashMap<u32, UndoRecPtr>,
    fsm: F,
}

impl RedoDispatcher<InMemoryFreeSpaceMap> {
    pub fn open(data_file: impl AsRef<Path>, undo_dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        let disk = DiskManager::open(data_file)?;
        Ok(RedoDispatcher {
            data_pool: BufferPoolManager::new(disk),
            undo_registry: UndoLogRegistry::new(undo_dir),
            recovery_map: HashMap::new(),
            xact_contexts: HashMap::new(),
            last_block_urp: HashMap::new(),
            fsm: InMemoryFreeSpaceMap::new(),
        })
    }
}

impl<F: FreeSpaceMap> RedoDispatcher<F> {
    fn ctx_for(&mut self, xid: u64) -> &mut TransactionContext {
        self.xact_contexts
            .entry(xid)
            .or_insert_with(|| TransactionContext::new(Xid(xid), Persistence::Permanent))
    }

    fn next_blkprev(&self, block: u32) -> UndoRecPtr {
        self.last_block_urp.get(&block).copied().unwrap_or(UndoRecPtr::INVALID)
    }

    /// Recovery-time counterpart of `UndoStage` — reserves via
    /// `AllocateInRecovery` instead of attaching to any free log, so the
    /// replayed address matches the one the DO side produced.
    fn replay_undo_record(&mut self, xid: u64, mut record: UnpackedUndoRecord) -> Result<UndoRecPtr> {
        let is_first = self.ctx_for(xid).is_first_record_of_transaction();
        if is_first {
            record = record.mark_transaction_start();
        }
        let size = record.expected_size() as u64;

        let allocator = UndoAllocator::new(&self.undo_registry);
        let urp = allocator.allocate_in_recovery(&mut self.recovery_map, xid, Persistence::Permanent, 0, size)?;
        let log_number = urp.log_number();

        let (prevlen, last_xact_start) = self.undo_registry.with_log(log_number, |log| {
            let prevlen = log.prevlen as u64 + log.last_reserve_header_skip;
            Ok((prevlen as u32, log.last_xact_start))
        })?;
        record.prevlen = prevlen;

        let chain_update = if is_first && last_xact_start != 0 {
            Some(UndoRecPtr::new(log_number, last_xact_start))
        } else {
            None
        };

        self.undo_registry.with_log(log_number, |log| {
            let bytes = record.encode();
            log.write_bytes(urp.offset(), &bytes)?;
            log.advance_insert(urp, size)?;
            if is_first {
                log.last_xact_start = urp.offset();
            }
            Ok(())
        })?;

        if let Some(prev_urp) = chain_update {
            self.undo_registry
                .with_log(log_number, |log| chain::update_trans_info(log, prev_urp, urp))?;
        }

        self.ctx_for(xid).note_record_written();
        Ok(urp)
    }

    fn assert_urp_matches(expected_raw: u64, computed: UndoRecPtr) -> Result<()> {
        if computed.as_raw() != expected_raw {
            return Err(UndoError::ProtocolViolation(format!(
                "redo undo pointer {computed} does not match wal-embedded pointer {}",
                UndoRecPtr::from_raw(expected_raw)
            ))
            .into());
        }
        Ok(())
    }

    fn should_redo(&mut self, block: u32, lsn: Lsn) -> Result<bool> {
        if block as u64 >= self.data_pool.page_count() as u64 {
            return Ok(true);
        }
        let page_arc = self.data_pool.fetch_page(block)?;
        let page_lsn = page_arc.read().unwrap().page_lsn;
        self.data_pool.unpin_page(block, false)?;
        Ok(page_lsn < lsn)
    }

    fn with_page_mut<R>(&mut self, block: u32, lsn: Lsn, f: impl FnOnce(&mut Page) -> Result<R>) -> Result<R> {
        while self.data_pool.page_count() <= block {
            self.data_pool.new_page()?;
        }
        let page_arc = self.data_pool.fetch_page_mut(block)?;
        let result = {
            let mut page = page_arc.write().unwrap();
            let result = f(&mut page)?;
            page.set_page_lsn(lsn);
            result
        };
        self.data_pool.unpin_page(block, true)?;
        Ok(result)
    }

    fn maybe_report_free_space(&mut self, block: u32) -> Result<()> {
        if block as u64 >= self.data_pool.page_count() as u64 {
            return Ok(());
        }
        let page_arc = self.data_pool.fetch_page(block)?;
        let free = page_arc.read().unwrap().free_space();
        self.data_pool.unpin_page(block, false)?;
        if free < LOW_SPACE_THRESHOLD {
            self.fsm.record_free_space(block, free as u16);
        }
        Ok(())
    }

    /// Replays every record in order, returning the number that actually
    /// mutated a data page (as opposed to ones skipped because the page was
    /// already ahead of the record's LSN).
    pub fn replay(&mut self, records: &[WalRecord]) -> Result<usize> {
        let mut applied = 0;
        for record in records {
            if self.dispatch(record)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn dispatch(&mut self, record: &WalRecord) -> Result<bool> {
        let txn_id = record.txn_id;
        let lsn = record.lsn;

        match &record.record_type {
            WalRecordType::Insert { block, offset, tuple, urec_ptr, init_page } => {
                let blkprev = self.next_blkprev(*block);
                let undo = UnpackedUndoRecord::new(UndoRecordType::Insert, txn_id, 0).with_block(*block, *offset, blkprev);
                let computed = self.replay_undo_record(txn_id, undo)?;
                Self::assert_urp_matches(*urec_ptr, computed)?;
                self.last_block_urp.insert(*block, computed);

                if *init_page {
                    while self.data_pool.page_count() <= *block {
                        self.data_pool.new_page()?;
                    }
                }
                if self.should_redo(*block, lsn)? {
                    let tuple = tuple.clone();
                    let offset = *offset;
                    self.with_page_mut(*block, lsn, |page| {
                        page.insert_at(offset, &tuple)?;
                        Ok(())
                    })?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::Delete { block, offset, old_tuple, urec_ptr } => {
                let blkprev = self.next_blkprev(*block);
                let undo = UnpackedUndoRecord::new(UndoRecordType::Delete, txn_id, 0)
                    .with_block(*block, *offset, blkprev)
                    .with_tuple(old_tuple.clone());
                let computed = self.replay_undo_record(txn_id, undo)?;
                Self::assert_urp_matches(*urec_ptr, computed)?;
                self.last_block_urp.insert(*block, computed);

                if self.should_redo(*block, lsn)? {
                    let offset = *offset;
                    self.with_page_mut(*block, lsn, |page| {
                        if page.get_tuple(offset).is_some() {
                            page.set_tuple_xmax(offset, txn_id)?;
                        }
                        Ok(())
                    })?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::InplaceUpdate { block, offset, new_tuple, old_tuple, urec_ptr } => {
                let blkprev = self.next_blkprev(*block);
                let undo = UnpackedUndoRecord::new(UndoRecordType::InplaceUpdate, txn_id, 0)
                    .with_block(*block, *offset, blkprev)
                    .with_tuple(old_tuple.clone());
                let computed = self.replay_undo_record(txn_id, undo)?;
                Self::assert_urp_matches(*urec_ptr, computed)?;
                self.last_block_urp.insert(*block, computed);

                if self.should_redo(*block, lsn)? {
                    let new_tuple = new_tuple.clone();
                    let offset = *offset;
                    self.with_page_mut(*block, lsn, |page| {
                        if let Some(slot) = page.get_tuple_mut(offset) {
                            if slot.len() != new_tuple.len() {
                                bail!("in-place update length mismatch at slot {offset}");
                            }
                            slot.copy_from_slice(&new_tuple);
                        }
                        Ok(())
                    })?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::Update {
                old_block,
                old_offset,
                new_block,
                new_offset,
                new_tuple,
                old_tuple,
                delete_urec_ptr,
                insert_urec_ptr,
            } => {
                let old_blkprev = self.next_blkprev(*old_block);
                let delete_undo = UnpackedUndoRecord::new(UndoRecordType::Update, txn_id, 0)
                    .with_block(*old_block, *old_offset, old_blkprev)
                    .with_payload(encode_newtid(*new_block, *new_offset))
                    .with_tuple(old_tuple.clone());
                let computed_delete = self.replay_undo_record(txn_id, delete_undo)?;
                Self::assert_urp_matches(*delete_urec_ptr, computed_delete)?;
                self.last_block_urp.insert(*old_block, computed_delete);

                let new_blkprev = self.next_blkprev(*new_block);
                let insert_undo =
                    UnpackedUndoRecord::new(UndoRecordType::Insert, txn_id, 0).with_block(*new_block, *new_offset, new_blkprev);
                let computed_insert = self.replay_undo_record(txn_id, insert_undo)?;
                Self::assert_urp_matches(*insert_urec_ptr, computed_insert)?;
                self.last_block_urp.insert(*new_block, computed_insert);

                let mut did_redo = false;
                if self.should_redo(*old_block, lsn)? {
                    let old_offset = *old_offset;
                    self.with_page_mut(*old_block, lsn, |page| {
                        if page.get_tuple(old_offset).is_some() {
                            page.set_tuple_xmax(old_offset, txn_id)?;
                        }
                        Ok(())
                    })?;
                    did_redo = true;
                }
                if self.should_redo(*new_block, lsn)? {
                    let new_tuple = new_tuple.clone();
                    let new_offset = *new_offset;
                    self.with_page_mut(*new_block, lsn, |page| {
                        page.insert_at(new_offset, &new_tuple)?;
                        Ok(())
                    })?;
                    did_redo = true;
                }
                self.maybe_report_free_space(*old_block)?;
                Ok(did_redo)
            }

            WalRecordType::MultiInsert { block, ranges, tuples, urec_ptrs } => {
                let mut tuple_iter = tuples.iter();
                let mut did_redo = false;
                for (i, (lo, hi)) in ranges.iter().enumerate() {
                    let blkprev = self.next_blkprev(*block);
                    let mut payload = Vec::with_capacity(4);
                    payload.extend_from_slice(&lo.to_le_bytes());
                    payload.extend_from_slice(&hi.to_le_bytes());
                    let undo = UnpackedUndoRecord::new(UndoRecordType::MultiInsert, txn_id, 0)
                        .with_block(*block, *lo, blkprev)
                        .with_payload(payload);
                    let computed = self.replay_undo_record(txn_id, undo)?;
                    Self::assert_urp_matches(urec_ptrs[i], computed)?;
                    self.last_block_urp.insert(*block, computed);

                    if self.should_redo(*block, lsn)? {
                        for offset in *lo..=*hi {
                            if let Some(tuple) = tuple_iter.next() {
                                let tuple = tuple.clone();
                                self.with_page_mut(*block, lsn, |page| {
                                    page.insert_at(offset, &tuple)?;
                                    Ok(())
                                })?;
                            }
                        }
                        did_redo = true;
                    }
                }
                Ok(did_redo)
            }

            WalRecordType::Lock { block, offset, mode, urec_ptr } => {
                let blkprev = self.next_blkprev(*block);
                let undo = UnpackedUndoRecord::new(UndoRecordType::XidLockOnly, txn_id, 0)
                    .with_block(*block, *offset, blkprev)
                    .with_payload(vec![*mode]);
                let computed = self.replay_undo_record(txn_id, undo)?;
                Self::assert_urp_matches(*urec_ptr, computed)?;
                self.last_block_urp.insert(*block, computed);

                if self.should_redo(*block, lsn)? {
                    self.with_page_mut(*block, lsn, |_page| Ok(()))?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::Clean { block } => {
                if self.should_redo(*block, lsn)? {
                    self.with_page_mut(*block, lsn, |_page| Ok(()))?;
                    self.maybe_report_free_space(*block)?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::Unused { block, offsets, urec_ptr } => {
                let blkprev = self.next_blkprev(*block);
                let mut payload = Vec::with_capacity(offsets.len() * 2);
                for offset in offsets {
                    payload.extend_from_slice(&offset.to_le_bytes());
                }
                let undo = UnpackedUndoRecord::new(UndoRecordType::ItemIdUnused, txn_id, 0)
                    .with_block(*block, offsets.first().copied().unwrap_or(0), blkprev)
                    .with_payload(payload);
                let computed = self.replay_undo_record(txn_id, undo)?;
                Self::assert_urp_matches(*urec_ptr, computed)?;
                self.last_block_urp.insert(*block, computed);

                if self.should_redo(*block, lsn)? {
                    let offsets = offsets.clone();
                    self.with_page_mut(*block, lsn, |page| {
                        for offset in offsets {
                            let _ = page.mark_unused(offset);
                        }
                        Ok(())
                    })?;
                    self.maybe_report_free_space(*block)?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::Confirm { block, offset, succeeded } => {
                if self.should_redo(*block, lsn)? {
                    let offset = *offset;
                    let succeeded = *succeeded;
                    self.with_page_mut(*block, lsn, |page| {
                        if !succeeded && page.get_tuple(offset).is_some() {
                            page.delete(offset)?;
                        }
                        Ok(())
                    })?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::FreezeSlot { block, slot } => {
                if self.should_redo(*block, lsn)? {
                    let slot = *slot as usize;
                    self.with_page_mut(*block, lsn, |page| {
                        page.set_trans_slot(slot, 0, 0, UndoRecPtr::INVALID);
                        Ok(())
                    })?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::InvalidateSlot { block, slot } => {
                if self.should_redo(*block, lsn)? {
                    let slot = *slot as usize;
                    self.with_page_mut(*block, lsn, |page| {
                        let (_, _, urp) = page.get_trans_slot(slot);
                        page.set_trans_slot(slot, 0, 0, urp);
                        Ok(())
                    })?;
                    return Ok(true);
                }
                Ok(false)
            }

            WalRecordType::AllocateUndoSegment { log_number, segment_start } => {
                let _ = segment_start;
                self.undo_registry.ensure_log(*log_number, Persistence::Permanent, 0);
                Ok(false)
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.data_pool.flush_all()
    }

    pub fn data_pool(&mut self) -> &mut BufferPoolManager {
        &mut self.data_pool
    }

    pub fn undo_registry(&self) -> &UndoLogRegistry {
        &self.undo_registry
    }

    pub fn fsm(&self) -> &F {
        &self.fsm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dispatcher(dir: &TempDir) -> RedoDispatcher {
        let data_file = dir.path().join("data.db");
        let undo_dir = dir.path().join("undo");
        RedoDispatcher::open(data_file, undo_dir).unwrap()
    }

    fn mvcc_tuple(xmin: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&xmin.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.push(0);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn replays_a_single_insert_and_reproduces_the_undo_pointer() {
        let dir = TempDir::new().unwrap();
        let mut dispatcher = dispatcher(&dir);

        let tuple = mvcc_tuple(100, b"row-a");

        // Compute the urp a DO-side PrepareUndoInsert would have produced: the
        // first reservation on the first attached log always lands right past
        // the page header.
        let expected_urp = UndoRecPtr::new(1, crate::page::PAGE_HDR as u64);

        let wal = WalRecord {
            lsn: 1,
            txn_id: 100,
            record_type: WalRecordType::Insert {
                block: 0,
                offset: 0,
                tuple: tuple.clone(),
                urec_ptr: expected_urp.as_raw(),
                init_page: true,
            },
        };

        let applied = dispatcher.replay(std::slice::from_ref(&wal)).unwrap();
        assert_eq!(applied, 1);

        let page_arc = dispatcher.data_pool().fetch_page(0).unwrap();
        assert_eq!(page_arc.read().unwrap().get_tuple(0).unwrap(), tuple.as_slice());
        dispatcher.data_pool().unpin_page(0, false).unwrap();
    }

    #[test]
    fn mismatched_urec_ptr_is_a_protocol_violation() {
        let dir = TempDir::new().unwrap();
        let mut dispatcher = dispatcher(&dir);

        let wal = WalRecord {
            lsn: 1,
            txn_id: 100,
            record_type: WalRecordType::Insert {
                block: 0,
                offset: 0,
                tuple: mvcc_tuple(1, b"x"),
                urec_ptr: UndoRecPtr::new(9, 9999).as_raw(),
                init_page: true,
            },
        };

        assert!(dispatcher.replay(std::slice::from_ref(&wal)).is_err());
    }

    #[test]
    fn already_applied_page_skips_redo_but_still_replays_undo() {
        let dir = TempDir::new().unwrap();
        let mut dispatcher = dispatcher(&dir);

        let expected_urp = UndoRecPtr::new(1, crate::page::PAGE_HDR as u64);
        let wal = WalRecord {
            lsn: 1,
            txn_id: 100,
            record_type: WalRecordType::Insert {
                block: 0,
                offset: 0,
                tuple: mvcc_tuple(1, b"x"),
                urec_ptr: expected_urp.as_raw(),
                init_page: true,
            },
        };
        dispatcher.replay(std::slice::from_ref(&wal)).unwrap();

        // Second record at an lsn the page has already advanced past.
        let expected_second_urp = expected_urp.advance(
            UnpackedUndoRecord::new(UndoRecordType::Insert, 100, 0)
                .with_block(0, 0, expected_urp)
                .mark_transaction_start()
                .expected_size() as u64,
        );
        let stale = WalRecord {
            lsn: 0,
            txn_id: 100,
            record_type: WalRecordType::Insert {
                block: 0,
                offset: 1,
                tuple: mvcc_tuple(2, b"y"),
                urec_ptr: expected_second_urp.as_raw(),
                init_page: false,
            },
        };
        let applied = dispatcher.replay(std::slice::from_ref(&stale)).unwrap();
        assert_eq!(applied, 0);
    }
}
