use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::page::{Page, PAGE_HDR, PAGE_SIZE};

use super::UndoRecPtr;

/// Persistence class an undo log belongs to. Each class keeps its own set of
/// logs so that, for example, a crash never needs to replay TEMP undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Persistence {
    Permanent,
    Unlogged,
    Temp,
}

/// Size of one undo segment file. A new one is created whenever a reservation
/// would otherwise cross this boundary.
pub const SEGMENT_BYTES: u64 = 1024 * 1024;
const PAGES_PER_SEGMENT: u64 = SEGMENT_BYTES / PAGE_SIZE as u64;
const USABLE_PER_PAGE: u64 = (PAGE_SIZE - PAGE_HDR) as u64;

/// Moves `offset` past a page header if it currently lands inside one, so
/// that record bytes are never split into the reserved header region.
pub fn skip_header(offset: u64) -> u64 {
    let in_page = offset % PAGE_SIZE as u64;
    if in_page < PAGE_HDR as u64 {
        offset - in_page + PAGE_HDR as u64
    } else {
        offset
    }
}

/// Walks `size` logical bytes forward from `start`, skipping a page header
/// at every page boundary crossed, and returns the resulting physical
/// offset. Mirrors the per-page chunking `UndoSegmentStore` uses to write
/// and read record bytes, so the insert pointer always reflects the actual
/// physical span a record consumed rather than just its logical size.
fn advance_offset(start: u64, size: u64) -> u64 {
    let mut pos = start;
    let mut remaining = size;
    while remaining > 0 {
        let pos_aligned = skip_header(pos);
        let in_page = pos_aligned % PAGE_SIZE as u64;
        let chunk_len = (PAGE_SIZE as u64 - in_page).min(remaining);
        remaining -= chunk_len;
        pos = pos_aligned + chunk_len;
    }
    pos
}

/// Per-log control state: monotone discard/insert/end pointers plus the
/// bookkeeping needed to chain consecutive top transactions together.
pub struct UndoLog {
    pub log_number: u32,
    pub persistence: Persistence,
    pub tablespace: u32,
    pub discard: u64,
    pub insert: u64,
    pub end: u64,
    pub last_xact_start: u64,
    pub prevlen: u32,
    /// Header bytes skipped to reach the start of the most recent
    /// reservation, so callers can fold them into the next record's
    /// `prevlen` and still land on the previous record's first byte.
    pub last_reserve_header_skip: u64,
    attached: bool,
    store: UndoSegmentStore,
}

impl UndoLog {
    fn new(log_number: u32, persistence: Persistence, tablespace: u32, dir: PathBuf) -> Self {
        UndoLog {
            log_number,
            persistence,
            tablespace,
            discard: PAGE_HDR as u64,
            insert: PAGE_HDR as u64,
            end: PAGES_PER_SEGMENT * PAGE_SIZE as u64,
            last_xact_start: 0,
            prevlen: 0,
            last_reserve_header_skip: 0,
            attached: false,
            store: UndoSegmentStore::new(log_number, dir),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Reserves `size` bytes at the current insert pointer, creating a new
    /// segment first if the reservation would cross `end`. Returns the
    /// pointer the record will start at.
    pub fn reserve(&mut self, size: u64) -> Result<UndoRecPtr> {
        let mut natural_insert = self.insert;
        let mut start = skip_header(natural_insert);
        if advance_offset(start, size) > self.end {
            self.store.create_segment(self.end)?;
            natural_insert = self.end;
            self.end += SEGMENT_BYTES;
            start = skip_header(natural_insert);
        }
        self.last_reserve_header_skip = start - natural_insert;
        Ok(UndoRecPtr::new(self.log_number, start))
    }

    /// Commits a reservation after its bytes have actually been written.
    /// `insert` moves to the physical end of the record, not just its
    /// logical size, so a record straddling a page boundary correctly
    /// accounts for the header bytes `write_bytes` skipped past.
    pub fn advance_insert(&mut self, urp: UndoRecPtr, size: u64) -> Result<()> {
        if urp.log_number() != self.log_number {
            bail!("urp belongs to a different log");
        }
        self.insert = advance_offset(urp.offset(), size);
        self.prevlen = size as u32;
        Ok(())
    }

    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.store.write_bytes(offset, bytes)
    }

    pub fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.store.read_bytes(offset, len)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.store.flush_all()
    }

    /// Advances `discard` to `new_discard`, the exclusive end of the range
    /// being reclaimed. Callers must already hold the log's discard-lock.
    pub fn advance_discard(&mut self, new_discard: u64) -> Result<()> {
        if new_discard < self.discard {
            bail!("discard pointer may not move backward");
        }
        if new_discard > self.insert {
            bail!("discard pointer may not pass the insert pointer");
        }
        self.discard = new_discard;
        Ok(())
    }
}

/// Maps a log's flat byte-offset space onto a sequence of 1 MiB segment
/// files, each itself a sequence of fixed-size pages.
struct UndoSegmentStore {
    log_number: u32,
    dir: PathBuf,
    segments: HashMap<u64, BufferPoolManager>,
}

impl UndoSegmentStore {
    fn new(log_number: u32, dir: PathBuf) -> Self {
        UndoSegmentStore {
            log_number,
            dir,
            segments: HashMap::new(),
        }
    }

    fn segment_path(&self, segment_start: u64) -> PathBuf {
        self.dir.join(format!("{}.{:010x}", self.log_number, segment_start))
    }

    fn create_segment(&mut self, segment_start: u64) -> Result<()> {
        self.ensure_segment(segment_start)?;
        Ok(())
    }

    fn ensure_segment(&mut self, segment_start: u64) -> Result<&mut BufferPoolManager> {
        if !self.segments.contains_key(&segment_start) {
            std::fs::create_dir_all(&self.dir)?;
            let disk = DiskManager::open(self.segment_path(segment_start))?;
            self.segments.insert(segment_start, BufferPoolManager::new(disk));
        }
        Ok(self.segments.get_mut(&segment_start).unwrap())
    }

    fn locate(offset: u64) -> (u64, u32, usize) {
        let segment_start = (offset / SEGMENT_BYTES) * SEGMENT_BYTES;
        let in_segment = offset - segment_start;
        let page_id = (in_segment / PAGE_SIZE as u64) as u32;
        let in_page = (in_segment % PAGE_SIZE as u64) as usize;
        (segment_start, page_id, in_page)
    }

    fn with_page_mut<F, R>(&mut self, offset: u64, f: F) -> Result<R>
    where
        F: FnOnce(&mut Page, usize) -> R,
    {
        let (segment_start, page_id, in_page) = Self::locate(offset);
        let pool = self.ensure_segment(segment_start)?;
        while pool.page_count() <= page_id {
            pool.new_page()?;
        }
        let page_arc = pool.fetch_page_mut(page_id)?;
        let result = {
            let mut page = page_arc.write().unwrap();
            f(&mut page, in_page)
        };
        pool.unpin_page(page_id, true)?;
        Ok(result)
    }

    fn with_page<F, R>(&mut self, offset: u64, f: F) -> Result<R>
    where
        F: FnOnce(&Page, usize) -> R,
    {
        let (segment_start, page_id, in_page) = Self::locate(offset);
        let pool = self.ensure_segment(segment_start)?;
        if pool.page_count() <= page_id {
            bail!("read past end of undo segment");
        }
        let page_arc = pool.fetch_page(page_id)?;
        let result = {
            let page = page_arc.read().unwrap();
            f(&page, in_page)
        };
        pool.unpin_page(page_id, false)?;
        Ok(result)
    }

    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut pos = offset;
        let mut written = 0usize;
        while written < bytes.len() {
            let pos_aligned = skip_header(pos);
            let in_page = (pos_aligned % PAGE_SIZE as u64) as usize;
            let chunk_len = (PAGE_SIZE - in_page).min(bytes.len() - written);
            let chunk = &bytes[written..written + chunk_len];
            self.with_page_mut(pos_aligned, |page, off| {
                page.data[off..off + chunk.len()].copy_from_slice(chunk);
            })?;
            written += chunk_len;
            pos = pos_aligned + chunk_len as u64;
        }
        Ok(())
    }

    fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;
        while out.len() < len {
            let pos_aligned = skip_header(pos);
            let in_page = (pos_aligned % PAGE_SIZE as u64) as usize;
            let chunk_len = (PAGE_SIZE - in_page).min(len - out.len());
            self.with_page(pos_aligned, |page, off| {
                out.extend_from_slice(&page.data[off..off + chunk_len]);
            })?;
            pos = pos_aligned + chunk_len as u64;
        }
        Ok(out)
    }

    fn flush_all(&mut self) -> Result<()> {
        for pool in self.segments.values_mut() {
            pool.flush_all()?;
        }
        Ok(())
    }
}

/// Process-wide table of active undo logs, keyed by log number. Allocates a
/// fresh log on `attach` when every existing log of the requested persistence
/// is already attached or exhausted.
pub struct UndoLogRegistry {
    base_dir: PathBuf,
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    logs: HashMap<u32, Mutex<UndoLog>>,
    next_log_number: u32,
}

impl UndoLogRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        UndoLogRegistry {
            base_dir: base_dir.into(),
            inner: Mutex::new(RegistryInner {
                logs: HashMap::new(),
                next_log_number: 1,
            }),
        }
    }

    fn persistence_dir(&self, persistence: Persistence) -> PathBuf {
        let leaf = match persistence {
            Persistence::Permanent => "base/undo",
            Persistence::Unlogged => "unlogged/undo",
            Persistence::Temp => "temp/undo",
        };
        self.base_dir.join(leaf)
    }

    /// Attaches the caller to an existing unattached, non-exhausted log of
    /// the given persistence, or creates a new one.
    pub fn attach(&self, persistence: Persistence, tablespace: u32) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let candidate = inner
            .logs
            .iter()
            .find(|(_, log)| {
                let log = log.lock().unwrap();
                log.persistence == persistence && log.tablespace == tablespace && !log.attached
            })
            .map(|(number, _)| *number);

        let log_number = if let Some(number) = candidate {
            number
        } else {
            let number = inner.next_log_number;
            inner.next_log_number += 1;
            let dir = self.persistence_dir(persistence);
            let log = UndoLog::new(number, persistence, tablespace, dir);
            inner.logs.insert(number, Mutex::new(log));
            number
        };

        inner.logs[&log_number].lock().unwrap().attached = true;
        Ok(log_number)
    }

    pub fn detach(&self, log_number: u32) {
        let inner = self.inner.lock().unwrap();
        if let Some(log) = inner.logs.get(&log_number) {
            log.lock().unwrap().attached = false;
        }
    }

    pub fn with_log<F, R>(&self, log_number: u32, f: F) -> Result<R>
    where
        F: FnOnce(&mut UndoLog) -> Result<R>,
    {
        let inner = self.inner.lock().unwrap();
        let log = inner
            .logs
            .get(&log_number)
            .ok_or_else(|| anyhow::anyhow!("unknown undo log {log_number}"))?;
        f(&mut log.lock().unwrap())
    }

    /// Used by recovery to reattach to the log a given xid was writing to
    /// before the crash, without going through the normal attach-to-any-free
    /// log path.
    pub fn ensure_log(&self, log_number: u32, persistence: Persistence, tablespace: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_log_number = inner.next_log_number.max(log_number + 1);
        inner.logs.entry(log_number).or_insert_with(|| {
            let dir = self.persistence_dir(persistence);
            Mutex::new(UndoLog::new(log_number, persistence, tablespace, dir))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn attach_creates_distinct_logs_per_persistence() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let permanent = registry.attach(Persistence::Permanent, 0).unwrap();
        let temp = registry.attach(Persistence::Temp, 0).unwrap();
        assert_ne!(permanent, temp);
    }

    #[test]
    fn reserve_then_write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let log_number = registry.attach(Persistence::Permanent, 0).unwrap();

        let payload = b"undo record bytes".to_vec();
        let urp = registry
            .with_log(log_number, |log| {
                let urp = log.reserve(payload.len() as u64)?;
                log.write_bytes(urp.offset(), &payload)?;
                log.advance_insert(urp, payload.len() as u64)?;
                Ok(urp)
            })
            .unwrap();

        let read_back = registry
            .with_log(log_number, |log| log.read_bytes(urp.offset(), payload.len()))
            .unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn sequential_reservations_do_not_overlap_across_a_page_boundary() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let log_number = registry.attach(Persistence::Permanent, 0).unwrap();

        // Each record is large enough that a handful of them cross the first
        // page boundary (4096 bytes in). Every write must land in disjoint
        // bytes and read back exactly what was written.
        let mut written = Vec::new();
        for i in 0..40u64 {
            let payload = vec![(i % 251) as u8; 150];
            let urp = registry
                .with_log(log_number, |log| {
                    let urp = log.reserve(payload.len() as u64)?;
                    log.write_bytes(urp.offset(), &payload)?;
                    log.advance_insert(urp, payload.len() as u64)?;
                    Ok(urp)
                })
                .unwrap();
            written.push((urp, payload));
        }

        for (urp, payload) in &written {
            let read_back = registry
                .with_log(log_number, |log| log.read_bytes(urp.offset(), payload.len()))
                .unwrap();
            assert_eq!(&read_back, payload);
        }

        for i in 1..written.len() {
            let (prev_urp, prev_payload) = &written[i - 1];
            let (urp, _) = &written[i];
            assert!(urp.offset() >= prev_urp.offset() + prev_payload.len() as u64);
        }
    }

    #[test]
    fn reserve_rotates_segment_at_boundary() {
        let dir = TempDir::new().unwrap();
        let registry = UndoLogRegistry::new(dir.path());
        let log_number = registry.attach(Persistence::Permanent, 0).unwrap();

        registry
            .with_log(log_number, |log| {
                log.insert = log.end - 8;
                let urp = log.reserve(64)?;
                assert!(urp.offset() >= SEGMENT_BYTES);
                Ok(())
            })
            .unwrap();
    }
}
