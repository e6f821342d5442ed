use anyhow::{bail, Result};

use super::UndoRecPtr;

/// Which physical operation produced this undo record. Mirrors the opcodes
/// the redo dispatcher knows how to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoRecordType {
    Insert,
    Delete,
    InplaceUpdate,
    Update,
    MultiInsert,
    XidLockOnly,
    XidMultiLockOnly,
    ItemIdUnused,
}

impl UndoRecordType {
    fn tag(self) -> u8 {
        match self {
            UndoRecordType::Insert => 0,
            UndoRecordType::Delete => 1,
            UndoRecordType::InplaceUpdate => 2,
            UndoRecordType::Update => 3,
            UndoRecordType::MultiInsert => 4,
            UndoRecordType::XidLockOnly => 5,
            UndoRecordType::XidMultiLockOnly => 6,
            UndoRecordType::ItemIdUnused => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => UndoRecordType::Insert,
            1 => UndoRecordType::Delete,
            2 => UndoRecordType::InplaceUpdate,
            3 => UndoRecordType::Update,
            4 => UndoRecordType::MultiInsert,
            5 => UndoRecordType::XidLockOnly,
            6 => UndoRecordType::XidMultiLockOnly,
            7 => UndoRecordType::ItemIdUnused,
            other => bail!("unknown undo record type tag {other}"),
        })
    }
}

const INFO_RELATION_DETAILS: u8 = 1 << 0;
const INFO_BLOCK: u8 = 1 << 1;
const INFO_TRANSACTION: u8 = 1 << 2;
const INFO_PAYLOAD: u8 = 1 << 3;

const HEADER_LEN: usize = 1 + 1 + 4 + 4 + 8 + 8 + 4; // type,info,prevlen,relfilenode,prev_xid,xid,cid
const RELATION_DETAILS_LEN: usize = 4 + 1; // tsid, fork
const BLOCK_LEN: usize = 8 + 4 + 2; // blkprev, block, offset
const TRANSACTION_LEN: usize = 8 + 4; // next, xid_epoch
const PAYLOAD_HEADER_LEN: usize = 4 + 4; // payload_len, tuple_len

/// The in-memory, fully materialized form of an undo record. Optional
/// sub-blocks are gated by the presence of their fields; `info` is derived,
/// never set directly by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedUndoRecord {
    pub record_type: UndoRecordType,
    pub prevlen: u32,
    pub relfilenode: u32,
    pub prev_xid: u64,
    pub xid: u64,
    pub cid: u32,

    pub tsid: Option<u32>,
    pub fork: Option<u8>,

    pub blkprev: Option<UndoRecPtr>,
    pub block: Option<u32>,
    pub offset: Option<u16>,

    pub next: Option<UndoRecPtr>,
    pub xid_epoch: Option<u32>,

    pub payload: Vec<u8>,
    pub tuple: Vec<u8>,
}

impl UnpackedUndoRecord {
    pub fn new(record_type: UndoRecordType, xid: u64, relfilenode: u32) -> Self {
        UnpackedUndoRecord {
            record_type,
            prevlen: 0,
            relfilenode,
            prev_xid: xid,
            xid,
            cid: 0,
            tsid: None,
            fork: None,
            blkprev: None,
            block: None,
            offset: None,
            next: None,
            xid_epoch: None,
            payload: Vec::new(),
            tuple: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: u32, offset: u16, blkprev: UndoRecPtr) -> Self {
        self.block = Some(block);
        self.offset = Some(offset);
        self.blkprev = Some(blkprev);
        self
    }

    pub fn with_relation_details(mut self, tsid: u32, fork: u8) -> Self {
        self.tsid = Some(tsid);
        self.fork = Some(fork);
        self
    }

    pub fn with_tuple(mut self, tuple: Vec<u8>) -> Self {
        self.tuple = tuple;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn mark_transaction_start(mut self) -> Self {
        self.next = Some(UndoRecPtr::INVALID);
        self.xid_epoch = Some(0);
        self
    }

    pub fn is_transaction_start(&self) -> bool {
        self.next.is_some()
    }

    fn info(&self) -> u8 {
        let mut info = 0u8;
        if self.tsid.is_some() {
            info |= INFO_RELATION_DETAILS;
        }
        if self.block.is_some() {
            info |= INFO_BLOCK;
        }
        if self.next.is_some() {
            info |= INFO_TRANSACTION;
        }
        if !self.payload.is_empty() || !self.tuple.is_empty() {
            info |= INFO_PAYLOAD;
        }
        info
    }

    /// Exact wire size of this record, used by the allocator to reserve
    /// address space before a single byte is written.
    pub fn expected_size(&self) -> usize {
        let info = self.info();
        let mut size = HEADER_LEN;
        if info & INFO_RELATION_DETAILS != 0 {
            size += RELATION_DETAILS_LEN;
        }
        if info & INFO_BLOCK != 0 {
            size += BLOCK_LEN;
        }
        if info & INFO_TRANSACTION != 0 {
            size += TRANSACTION_LEN;
        }
        if info & INFO_PAYLOAD != 0 {
            size += PAYLOAD_HEADER_LEN + self.payload.len() + self.tuple.len();
        }
        size
    }

    /// Flat byte-exact serialization in strict field order: header, then
    /// relation details, block, transaction, payload-length, payload bytes,
    /// tuple bytes — any sub-block not implied by `info` is omitted entirely.
    pub fn encode(&self) -> Vec<u8> {
        let info = self.info();
        let mut buf = Vec::with_capacity(self.expected_size());

        buf.push(self.record_type.tag());
        buf.push(info);
        buf.extend_from_slice(&self.prevlen.to_le_bytes());
        buf.extend_from_slice(&self.relfilenode.to_le_bytes());
        buf.extend_from_slice(&self.prev_xid.to_le_bytes());
        buf.extend_from_slice(&self.xid.to_le_bytes());
        buf.extend_from_slice(&self.cid.to_le_bytes());

        if info & INFO_RELATION_DETAILS != 0 {
            buf.extend_from_slice(&self.tsid.unwrap().to_le_bytes());
            buf.push(self.fork.unwrap());
        }
        if info & INFO_BLOCK != 0 {
            buf.extend_from_slice(&self.blkprev.unwrap().as_raw().to_le_bytes());
            buf.extend_from_slice(&self.block.unwrap().to_le_bytes());
            buf.extend_from_slice(&self.offset.unwrap().to_le_bytes());
        }
        if info & INFO_TRANSACTION != 0 {
            buf.extend_from_slice(&self.next.unwrap().as_raw().to_le_bytes());
            buf.extend_from_slice(&self.xid_epoch.unwrap().to_le_bytes());
        }
        if info & INFO_PAYLOAD != 0 {
            buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(&(self.tuple.len() as u32).to_le_bytes());
            buf.extend_from_slice(&self.payload);
            buf.extend_from_slice(&self.tuple);
        }

        buf
    }

    /// Inverse of `encode`. Returns the record and the number of bytes of
    /// `data` it consumed, so callers assembling a record split across
    /// multiple pages know where the next chunk begins.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_LEN {
            bail!("undo record header truncated");
        }
        let mut pos = 0usize;
        let record_type = UndoRecordType::from_tag(data[pos])?;
        pos += 1;
        let info = data[pos];
        pos += 1;
        let prevlen = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let relfilenode = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let prev_xid = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let xid = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let cid = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;

        let mut record = UnpackedUndoRecord {
            record_type,
            prevlen,
            relfilenode,
            prev_xid,
            xid,
            cid,
            tsid: None,
            fork: None,
            blkprev: None,
            block: None,
            offset: None,
            next: None,
            xid_epoch: None,
            payload: Vec::new(),
            tuple: Vec::new(),
        };

        if info & INFO_RELATION_DETAILS != 0 {
            if data.len() < pos + RELATION_DETAILS_LEN {
                bail!("undo record relation-details truncated");
            }
            record.tsid = Some(u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()));
            pos += 4;
            record.fork = Some(data[pos]);
            pos += 1;
        }
        if info & INFO_BLOCK != 0 {
            if data.len() < pos + BLOCK_LEN {
                bail!("undo record block-ref truncated");
            }
            let blkprev = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            pos += 8;
            record.blkprev = Some(UndoRecPtr::from_raw(blkprev));
            record.block = Some(u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()));
            pos += 4;
            record.offset = Some(u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap()));
            pos += 2;
        }
        if info & INFO_TRANSACTION != 0 {
            if data.len() < pos + TRANSACTION_LEN {
                bail!("undo record transaction-header truncated");
            }
            let next = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            pos += 8;
            record.next = Some(UndoRecPtr::from_raw(next));
            record.xid_epoch = Some(u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()));
            pos += 4;
        }
        if info & INFO_PAYLOAD != 0 {
            if data.len() < pos + PAYLOAD_HEADER_LEN {
                bail!("undo record payload-length truncated");
            }
            let payload_len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let tuple_len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if data.len() < pos + payload_len + tuple_len {
                bail!("undo record payload/tuple bytes truncated");
            }
            record.payload = data[pos..pos + payload_len].to_vec();
            pos += payload_len;
            record.tuple = data[pos..pos + tuple_len].to_vec();
            pos += tuple_len;
        }

        Ok((record, pos))
    }

    /// Reads just enough of a record's header to locate the byte offset of
    /// its `next` field, without requiring the full payload/tuple bytes to be
    /// present in `data`. Returns `None` when the record has no TRANSACTION
    /// sub-block. Used by transaction-chain maintenance, which only ever
    /// needs to patch those 8 bytes in place.
    pub fn peek_next_field_offset(data: &[u8]) -> Result<Option<usize>> {
        if data.len() < HEADER_LEN {
            bail!("undo record header truncated");
        }
        let info = data[1];
        let mut pos = HEADER_LEN;
        if info & INFO_RELATION_DETAILS != 0 {
            pos += RELATION_DETAILS_LEN;
        }
        if info & INFO_BLOCK != 0 {
            pos += BLOCK_LEN;
        }
        if info & INFO_TRANSACTION == 0 {
            return Ok(None);
        }
        Ok(Some(pos))
    }

    /// Byte offset, within this record's own encoding, of the `next` field
    /// inside the TRANSACTION sub-block — used by transaction-chain
    /// maintenance to patch it in place without re-encoding the record.
    pub fn next_field_offset(&self) -> Option<usize> {
        if self.next.is_none() {
            return None;
        }
        let info = self.info();
        let mut pos = HEADER_LEN;
        if info & INFO_RELATION_DETAILS != 0 {
            pos += RELATION_DETAILS_LEN;
        }
        if info & INFO_BLOCK != 0 {
            pos += BLOCK_LEN;
        }
        Some(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UnpackedUndoRecord {
        UnpackedUndoRecord::new(UndoRecordType::Insert, 100, 7)
            .with_relation_details(1, 0)
            .with_block(5, 2, UndoRecPtr::new(0, 40))
            .with_tuple(b"hello world".to_vec())
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let record = sample();
        let bytes = record.encode();
        let (decoded, consumed) = UnpackedUndoRecord::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn expected_size_matches_encoded_length() {
        let record = sample();
        assert_eq!(record.expected_size(), record.encode().len());
    }

    #[test]
    fn transaction_start_round_trips_next_pointer() {
        let record = sample().mark_transaction_start();
        assert!(record.is_transaction_start());
        let bytes = record.encode();
        let (decoded, _) = UnpackedUndoRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.next, Some(UndoRecPtr::INVALID));
    }

    #[test]
    fn next_field_offset_points_at_the_next_pointer_bytes() {
        let record = sample().mark_transaction_start();
        let bytes = record.encode();
        let offset = record.next_field_offset().unwrap();
        let patched = UndoRecPtr::new(9, 123);
        let mut bytes = bytes;
        bytes[offset..offset + 8].copy_from_slice(&patched.as_raw().to_le_bytes());
        let (decoded, _) = UnpackedUndoRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.next, Some(patched));
    }

    #[test]
    fn peek_next_field_offset_matches_full_decode() {
        let record = sample().mark_transaction_start();
        let bytes = record.encode();
        let peeked = UnpackedUndoRecord::peek_next_field_offset(&bytes[..HEADER_LEN + RELATION_DETAILS_LEN + BLOCK_LEN + TRANSACTION_LEN])
            .unwrap()
            .unwrap();
        assert_eq!(peeked, record.next_field_offset().unwrap());
    }

    #[test]
    fn peek_next_field_offset_is_none_without_transaction_block() {
        let record = sample();
        let bytes = record.encode();
        assert_eq!(UnpackedUndoRecord::peek_next_field_offset(&bytes).unwrap(), None);
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let record = sample();
        let bytes = record.encode();
        assert!(UnpackedUndoRecord::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
