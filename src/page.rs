use anyhow::{bail, Result};

use crate::undo::UndoRecPtr;

pub const PAGE_SIZE: usize = 4096;
pub const NO_NEXT_PAGE: u32 = u32::MAX;
pub const NO_TPD_BLOCK: u32 = u32::MAX;

/// Number of transaction slots kept inline in a page header before a TPD
/// overflow page is needed.
pub const TRANS_SLOT_COUNT: usize = 4;

// Page layout:
//   Header (28 bytes):
//     - page_id: u32
//     - tuple_count: u16
//     - free_space_offset: u16  (points to end of free space)
//     - page_lsn: u64
//     - next_page_id: u32       (NO_NEXT_PAGE if this is the last page of its chain)
//     - tpd_block: u32          (NO_TPD_BLOCK if no overflow slots are in use)
//   Transaction slot array (TRANS_SLOT_COUNT * 20 bytes, grows from offset 28):
//     - each slot: xid_epoch: u32, xid: u64, urec_ptr: u64
//   Tuple slot array (grows forward from end of trans slots):
//     - each slot: u16 offset + u16 length (4 bytes per slot, length == 0 means deleted)
//   Tuple data (grows backward from end of page)
//
// Tuple bytes are themselves MVCC-headed: xmin: u64, xmax: u64, trans_slot: u8, then payload.

const HEADER_SIZE: usize = 28;
const TRANS_SLOT_SIZE: usize = 20;
const TRANS_SLOTS_SIZE: usize = TRANS_SLOT_COUNT * TRANS_SLOT_SIZE;
const SLOT_ARRAY_START: usize = HEADER_SIZE + TRANS_SLOTS_SIZE;
/// Bytes reserved at the start of every page (data or undo) before usable
/// content; undo storage addresses its byte offsets around this boundary.
pub const PAGE_HDR: usize = SLOT_ARRAY_START;
const TUPLE_SLOT_SIZE: usize = 4;
pub const TUPLE_HEADER_SIZE: usize = 17; // xmin(8) + xmax(8) + trans_slot(1)

pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_lsn: u64,
}

impl Page {
    pub fn new(page_id: u32) -> Self {
        let mut page = Page {
            data: [0; PAGE_SIZE],
            page_lsn: 0,
        };
        page.set_page_id(page_id);
        page.set_tuple_count(0);
        page.set_free_space_offset(PAGE_SIZE as u16);
        page.set_next_page_id(NO_NEXT_PAGE);
        page.set_tpd_block(NO_TPD_BLOCK);
        for slot in 0..TRANS_SLOT_COUNT {
            page.set_trans_slot(slot, 0, 0, UndoRecPtr::INVALID);
        }
        page
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0; PAGE_SIZE];
        data.copy_from_slice(bytes);
        let page_lsn = u64::from_ne_bytes(data[8..16].try_into().unwrap());
        Page { data, page_lsn }
    }

    pub fn page_id(&self) -> u32 {
        u32::from_ne_bytes(self.data[0..4].try_into().unwrap())
    }

    fn set_page_id(&mut self, id: u32) {
        self.data[0..4].copy_from_slice(&id.to_ne_bytes());
    }

    pub fn tuple_count(&self) -> u16 {
        u16::from_ne_bytes(self.data[4..6].try_into().unwrap())
    }

    fn set_tuple_count(&mut self, count: u16) {
        self.data[4..6].copy_from_slice(&count.to_ne_bytes());
    }

    pub fn free_space_offset(&self) -> u16 {
        u16::from_ne_bytes(self.data[6..8].try_into().unwrap())
    }

    fn set_free_space_offset(&mut self, offset: u16) {
        self.data[6..8].copy_from_slice(&offset.to_ne_bytes());
    }

    pub fn set_page_lsn(&mut self, lsn: u64) {
        self.page_lsn = lsn;
        self.data[8..16].copy_from_slice(&lsn.to_ne_bytes());
    }

    pub fn next_page_id(&self) -> u32 {
        u32::from_ne_bytes(self.data[16..20].try_into().unwrap())
    }

    pub fn set_next_page_id(&mut self, id: u32) {
        self.data[16..20].copy_from_slice(&id.to_ne_bytes());
    }

    pub fn tpd_block(&self) -> u32 {
        u32::from_ne_bytes(self.data[20..24].try_into().unwrap())
    }

    pub fn set_tpd_block(&mut self, block: u32) {
        self.data[20..24].copy_from_slice(&block.to_ne_bytes());
    }

    fn trans_slot_offset(slot: usize) -> usize {
        HEADER_SIZE + slot * TRANS_SLOT_SIZE
    }

    /// Reads an inline transaction slot: (xid_epoch, xid, last urec_ptr).
    pub fn get_trans_slot(&self, slot: usize) -> (u32, u64, UndoRecPtr) {
        let off = Self::trans_slot_offset(slot);
        let xid_epoch = u32::from_ne_bytes(self.data[off..off + 4].try_into().unwrap());
        let xid = u64::from_ne_bytes(self.data[off + 4..off + 12].try_into().unwrap());
        let urp = u64::from_ne_bytes(self.data[off + 12..off + 20].try_into().unwrap());
        (xid_epoch, xid, UndoRecPtr::from_raw(urp))
    }

    pub fn set_trans_slot(&mut self, slot: usize, xid_epoch: u32, xid: u64, urp: UndoRecPtr) {
        let off = Self::trans_slot_offset(slot);
        self.data[off..off + 4].copy_from_slice(&xid_epoch.to_ne_bytes());
        self.data[off + 4..off + 12].copy_from_slice(&xid.to_ne_bytes());
        self.data[off + 12..off + 20].copy_from_slice(&urp.as_raw().to_ne_bytes());
    }

    /// Finds an inline slot already owned by `xid`, or the first slot whose
    /// owner is invalid. Returns `None` when every inline slot is occupied by
    /// a distinct live transaction and the page needs a TPD overflow page.
    pub fn find_trans_slot(&self, xid: u64) -> Option<usize> {
        for slot in 0..TRANS_SLOT_COUNT {
            let (_, owner, urp) = self.get_trans_slot(slot);
            if owner == xid || !urp.is_valid() {
                return Some(slot);
            }
        }
        None
    }

    fn get_slot(&self, slot_id: u16) -> (u16, u16) {
        let slot_offset = SLOT_ARRAY_START + (slot_id as usize) * TUPLE_SLOT_SIZE;
        let offset = u16::from_ne_bytes(self.data[slot_offset..slot_offset + 2].try_into().unwrap());
        let length =
            u16::from_ne_bytes(self.data[slot_offset + 2..slot_offset + 4].try_into().unwrap());
        (offset, length)
    }

    fn set_slot(&mut self, slot_id: u16, offset: u16, length: u16) {
        let slot_offset = SLOT_ARRAY_START + (slot_id as usize) * TUPLE_SLOT_SIZE;
        self.data[slot_offset..slot_offset + 2].copy_from_slice(&offset.to_ne_bytes());
        self.data[slot_offset + 2..slot_offset + 4].copy_from_slice(&length.to_ne_bytes());
    }

    pub fn free_space(&self) -> usize {
        let slots_end = SLOT_ARRAY_START + (self.tuple_count() as usize) * TUPLE_SLOT_SIZE;
        self.free_space_offset() as usize - slots_end
    }

    pub fn insert(&mut self, tuple_data: &[u8]) -> Result<u16> {
        let tuple_len = tuple_data.len();
        let required_space = tuple_len + TUPLE_SLOT_SIZE;

        if self.free_space() < required_space {
            bail!("not enough space in page");
        }

        let new_offset = self.free_space_offset() - tuple_len as u16;
        self.data[new_offset as usize..new_offset as usize + tuple_len].copy_from_slice(tuple_data);

        let slot_id = self.tuple_count();
        self.set_slot(slot_id, new_offset, tuple_len as u16);
        self.set_tuple_count(slot_id + 1);
        self.set_free_space_offset(new_offset);

        Ok(slot_id)
    }

    /// Inserts at an explicit offset within the slot array, used by redo to
    /// reproduce the exact offsets recorded for a MULTI_INSERT range. Unlike
    /// `insert`, the target slot can sit past the current tuple count — the
    /// gap is filled with empty (zero-length) slots so the page ends up with
    /// a tuple at exactly that offset, matching what the DO side produced.
    pub fn insert_at(&mut self, slot_id: u16, tuple_data: &[u8]) -> Result<()> {
        if slot_id < self.tuple_count() {
            if self.get_tuple(slot_id).is_none() {
                self.restore(slot_id, tuple_data)?;
            }
            return Ok(());
        }

        let gap_slots = (slot_id - self.tuple_count()) as usize;
        let required_space = tuple_data.len() + TUPLE_SLOT_SIZE * (gap_slots + 1);
        if self.free_space() < required_space {
            bail!("not enough space in page to place tuple at slot {slot_id}");
        }

        while self.tuple_count() < slot_id {
            let gap_slot = self.tuple_count();
            self.set_slot(gap_slot, 0, 0);
            self.set_tuple_count(gap_slot + 1);
        }

        let new_offset = self.free_space_offset() - tuple_data.len() as u16;
        self.data[new_offset as usize..new_offset as usize + tuple_data.len()].copy_from_slice(tuple_data);
        self.set_slot(slot_id, new_offset, tuple_data.len() as u16);
        self.set_tuple_count(slot_id + 1);
        self.set_free_space_offset(new_offset);

        Ok(())
    }

    pub fn get_tuple(&self, slot_id: u16) -> Option<&[u8]> {
        if slot_id >= self.tuple_count() {
            return None;
        }
        let (offset, length) = self.get_slot(slot_id);
        if length == 0 {
            return None;
        }
        Some(&self.data[offset as usize..(offset + length) as usize])
    }

    pub fn get_tuple_mut(&mut self, slot_id: u16) -> Option<&mut [u8]> {
        if slot_id >= self.tuple_count() {
            return None;
        }
        let (offset, length) = self.get_slot(slot_id);
        if length == 0 {
            return None;
        }
        Some(&mut self.data[offset as usize..(offset + length) as usize])
    }

    pub fn delete(&mut self, slot_id: u16) -> Result<()> {
        if slot_id >= self.tuple_count() {
            bail!("slot {slot_id} does not exist");
        }
        let (offset, length) = self.get_slot(slot_id);
        if length == 0 {
            bail!("slot {slot_id} is already deleted");
        }
        self.set_slot(slot_id, offset, 0);
        Ok(())
    }

    /// Restores a deleted tuple (used both by rollback and by redo).
    pub fn restore(&mut self, slot_id: u16, data: &[u8]) -> Result<()> {
        if slot_id >= self.tuple_count() {
            bail!("slot {slot_id} does not exist");
        }
        let (offset, length) = self.get_slot(slot_id);
        if length != 0 {
            bail!("slot {slot_id} is not deleted");
        }
        let data_len = data.len() as u16;
        self.data[offset as usize..(offset + data_len) as usize].copy_from_slice(data);
        self.set_slot(slot_id, offset, data_len);
        Ok(())
    }

    pub fn mark_unused(&mut self, slot_id: u16) -> Result<()> {
        if slot_id >= self.tuple_count() {
            bail!("slot {slot_id} does not exist");
        }
        self.set_slot(slot_id, 0, 0);
        Ok(())
    }

    // MVCC tuple header: [xmin: 8][xmax: 8][trans_slot: 1][payload...]
    pub fn tuple_xmin(&self, slot_id: u16) -> Result<u64> {
        let tuple = self.get_tuple(slot_id).ok_or_else(|| anyhow::anyhow!("slot {slot_id} is deleted"))?;
        Ok(u64::from_le_bytes(tuple[0..8].try_into().unwrap()))
    }

    pub fn tuple_xmax(&self, slot_id: u16) -> Result<u64> {
        let tuple = self.get_tuple(slot_id).ok_or_else(|| anyhow::anyhow!("slot {slot_id} is deleted"))?;
        Ok(u64::from_le_bytes(tuple[8..16].try_into().unwrap()))
    }

    pub fn tuple_trans_slot(&self, slot_id: u16) -> Result<u8> {
        let tuple = self.get_tuple(slot_id).ok_or_else(|| anyhow::anyhow!("slot {slot_id} is deleted"))?;
        Ok(tuple[16])
    }

    pub fn set_tuple_xmax(&mut self, slot_id: u16, xmax: u64) -> Result<()> {
        if slot_id >= self.tuple_count() {
            bail!("slot {slot_id} does not exist");
        }
        let (offset, length) = self.get_slot(slot_id);
        if length == 0 {
            bail!("slot {slot_id} is deleted");
        }
        if (length as usize) < TUPLE_HEADER_SIZE {
            bail!("tuple too short for MVCC header");
        }
        let xmax_offset = offset as usize + 8;
        self.data[xmax_offset..xmax_offset + 8].copy_from_slice(&xmax.to_le_bytes());
        Ok(())
    }

    pub fn set_tuple_trans_slot(&mut self, slot_id: u16, trans_slot: u8) -> Result<()> {
        if slot_id >= self.tuple_count() {
            bail!("slot {slot_id} does not exist");
        }
        let (offset, length) = self.get_slot(slot_id);
        if length == 0 {
            bail!("slot {slot_id} is deleted");
        }
        if (length as usize) < TUPLE_HEADER_SIZE {
            bail!("tuple too short for MVCC header");
        }
        self.data[offset as usize + 16] = trans_slot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mvcc_tuple(xmin: u64, xmax: u64, trans_slot: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TUPLE_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&xmin.to_le_bytes());
        buf.extend_from_slice(&xmax.to_le_bytes());
        buf.push(trans_slot);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn insert_and_read_back() {
        let mut page = Page::new(0);
        let tuple = mvcc_tuple(100, 0, 0, b"hello");
        let slot = page.insert(&tuple).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(page.get_tuple(0).unwrap(), tuple.as_slice());
        assert_eq!(page.tuple_xmin(0).unwrap(), 100);
    }

    #[test]
    fn delete_then_restore_round_trips() {
        let mut page = Page::new(0);
        let tuple = mvcc_tuple(1, 0, 0, b"row");
        page.insert(&tuple).unwrap();
        page.delete(0).unwrap();
        assert!(page.get_tuple(0).is_none());
        page.restore(0, &tuple).unwrap();
        assert_eq!(page.get_tuple(0).unwrap(), tuple.as_slice());
    }

    #[test]
    fn trans_slot_round_trips() {
        let mut page = Page::new(0);
        page.set_trans_slot(1, 7, 42, UndoRecPtr::new(3, 500));
        let (epoch, xid, urp) = page.get_trans_slot(1);
        assert_eq!(epoch, 7);
        assert_eq!(xid, 42);
        assert_eq!(urp, UndoRecPtr::new(3, 500));
    }

    #[test]
    fn find_trans_slot_reuses_owner_or_free_slot() {
        let mut page = Page::new(0);
        page.set_trans_slot(0, 0, 10, UndoRecPtr::new(1, 1));
        assert_eq!(page.find_trans_slot(10), Some(0));
        assert_eq!(page.find_trans_slot(99), Some(1));
    }

    #[test]
    fn insert_at_past_tuple_count_fills_the_gap() {
        let mut page = Page::new(0);
        let tuple = mvcc_tuple(5, 0, 0, b"far");
        page.insert_at(5, &tuple).unwrap();

        assert_eq!(page.tuple_count(), 6);
        assert_eq!(page.get_tuple(5).unwrap(), tuple.as_slice());
        for slot in 0..5 {
            assert!(page.get_tuple(slot).is_none());
        }
    }

    #[test]
    fn insert_at_existing_slot_is_a_no_op_restore_guard() {
        let mut page = Page::new(0);
        let tuple = mvcc_tuple(1, 0, 0, b"row");
        page.insert(&tuple).unwrap();
        page.insert_at(0, &tuple).unwrap();
        assert_eq!(page.tuple_count(), 1);
    }
}
