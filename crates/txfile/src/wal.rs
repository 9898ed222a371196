//! Double-buffered write-ahead log occupying a fixed prefix of a file.
//!
//! The region `[off, off + len)` holds two equally sized segments. Each
//! segment starts with `{seq: u32, file_size: u64}` and contains a run
//! of records terminated by an `end` marker (four zero bytes). The
//! segment whose `seq` is newer under the sliding-window ordering is
//! authoritative; the other one is recyclable and is rewritten by
//! compaction.
//!
//! Appending a record happens in two steps: the record body plus a new
//! `end` marker are written *past* the current end marker and synced,
//! and only then is the old end marker overwritten with the record's
//! header. That header flip is the commit point — a crash before it
//! leaves the log terminated at the old marker, a crash after it leaves
//! the record fully present.

use std::collections::HashMap;
use std::fs::File;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::io::{ReadAt, WriteAt};
use crate::{sliding_lt, Error, ReplacementMap, Result};

/// Transaction ids are 24 bits; the upper 8 bits of a record header
/// hold the record kind.
pub const TX_ID_MASK: u32 = 0x00ff_ffff;

/// `{seq: u32, file_size: u64}`.
const SEGMENT_HEADER_LEN: u64 = 12;
/// An `end` record is a bare header.
const END_LEN: usize = 4;
/// Smallest region able to hold two segments of header + end marker.
pub const MIN_REGION_LEN: u64 = 2 * (SEGMENT_HEADER_LEN + END_LEN as u64);

const KIND_END: u32 = 0;
const KIND_COMMIT: u32 = 1;
const KIND_WRITE: u32 = 10;
const KIND_RESIZE: u32 = 11;

/// One WAL record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WalRecord {
    End,
    Commit { tx_id: u32 },
    Write { tx_id: u32, offset: u64, data: Vec<u8> },
    Resize { tx_id: u32, new_size: u64 },
}

impl WalRecord {
    pub fn tx_id(&self) -> u32 {
        match *self {
            WalRecord::End => 0,
            WalRecord::Commit { tx_id } => tx_id,
            WalRecord::Write { tx_id, .. } => tx_id,
            WalRecord::Resize { tx_id, .. } => tx_id,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, WalRecord::End)
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, WalRecord::Commit { .. })
    }

    /// Serialize, appending to `out`. The first four bytes are always
    /// the record header.
    pub fn encode(&self, out: &mut Vec<u8>) {
        fn header(out: &mut Vec<u8>, kind: u32, tx_id: u32) {
            debug_assert_eq!(tx_id & TX_ID_MASK, tx_id);
            out.extend_from_slice(&((tx_id << 8) | kind).to_be_bytes());
        }

        match self {
            WalRecord::End => header(out, KIND_END, 0),
            WalRecord::Commit { tx_id } => header(out, KIND_COMMIT, *tx_id),
            WalRecord::Write { tx_id, offset, data } => {
                header(out, KIND_WRITE, *tx_id);
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
                let pad = (4 - data.len() % 4) % 4;
                out.extend_from_slice(&[0u8; 3][..pad]);
            }
            WalRecord::Resize { tx_id, new_size } => {
                header(out, KIND_RESIZE, *tx_id);
                out.extend_from_slice(&new_size.to_be_bytes());
            }
        }
    }

    /// Parse one record from `buf` at `*pos`, advancing `*pos`.
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<WalRecord> {
        let hdr = take_u32(buf, pos)?;
        let kind = hdr & 0xff;
        let tx_id = hdr >> 8;
        match kind {
            KIND_END => {
                if tx_id != 0 {
                    return Err(Error::BadWalEntry);
                }
                Ok(WalRecord::End)
            }
            KIND_COMMIT => Ok(WalRecord::Commit { tx_id }),
            KIND_WRITE => {
                let offset = take_u64(buf, pos)?;
                let len = take_u32(buf, pos)? as usize;
                let data = take_bytes(buf, pos, len)?.to_vec();
                let pad = (4 - len % 4) % 4;
                let padding = take_bytes(buf, pos, pad)?;
                if padding.iter().any(|&b| b != 0) {
                    return Err(Error::BadWalEntry);
                }
                Ok(WalRecord::Write { tx_id, offset, data })
            }
            KIND_RESIZE => {
                let new_size = take_u64(buf, pos)?;
                Ok(WalRecord::Resize { tx_id, new_size })
            }
            _ => Err(Error::BadWalEntry),
        }
    }
}

fn take_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(len).ok_or(Error::BadWalEntry)?;
    if end > buf.len() {
        return Err(Error::BadWalEntry);
    }
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

fn take_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    Ok(u32::from_be_bytes(take_bytes(buf, pos, 4)?.try_into().unwrap()))
}

fn take_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    Ok(u64::from_be_bytes(take_bytes(buf, pos, 8)?.try_into().unwrap()))
}

struct LogState {
    current_slot: usize,
    current_seq: u32,
    /// Absolute file offset of the current end marker.
    slot_off: u64,
}

struct DataState {
    repl: ReplacementMap,
    /// Logical size of the data region.
    fd_size: u64,
}

struct AllocState {
    /// `states[id]` is true while transaction `id` is live.
    states: Vec<bool>,
    /// Recyclable ids.
    avail: Vec<u32>,
    /// Transactions finished (committed or rolled back) since the last
    /// compaction. Compaction is pointless while this is zero.
    completed_count: u64,
}

struct SegmentData {
    seq: u32,
    file_size: u64,
    records: Vec<WalRecord>,
}

/// The WAL region plus the file it governs.
///
/// Lock order: `log` before `data` before `alloc`, matching the outer
/// hierarchy (tree locks are always taken before any of these).
pub struct WalRegion {
    off: u64,
    len: u64,
    file: File,
    writable: bool,
    log: Mutex<LogState>,
    data: RwLock<DataState>,
    alloc: Mutex<AllocState>,
}

impl WalRegion {
    /// Initialize a fresh WAL region over `[off, off + len)` of `file`.
    ///
    /// Segment 0 becomes active with `seq = 0`; segment 1 is seeded
    /// with `seq = u32::MAX`, which is the immediate predecessor of 0
    /// under the sliding ordering.
    pub fn create(file: File, off: u64, len: u64) -> Result<Self> {
        if len < MIN_REGION_LEN || len % 2 != 0 {
            return Err(Error::WalBadAlloc("WAL region too small"));
        }

        let region = WalRegion {
            off,
            len,
            file,
            writable: true,
            log: Mutex::new(LogState {
                current_slot: 0,
                current_seq: 0,
                slot_off: off + SEGMENT_HEADER_LEN,
            }),
            data: RwLock::new(DataState {
                repl: ReplacementMap::new(),
                fd_size: 0,
            }),
            alloc: Mutex::new(AllocState {
                states: Vec::new(),
                avail: Vec::new(),
                completed_count: 0,
            }),
        };

        if region.file.metadata()?.len() < region.data_begin() {
            region.file.set_len(region.data_begin())?;
        }

        let mut seg = Vec::with_capacity((SEGMENT_HEADER_LEN as usize) + END_LEN);
        write_segment_header(&mut seg, 0, 0);
        WalRecord::End.encode(&mut seg);
        region.file.write_all_at(region.slot_begin(0), &seg)?;

        seg.clear();
        write_segment_header(&mut seg, u32::MAX, 0);
        WalRecord::End.encode(&mut seg);
        region.file.write_all_at(region.slot_begin(1), &seg)?;

        region.file.sync_data()?;
        Ok(region)
    }

    /// Open an existing WAL region, replaying the authoritative segment
    /// and (when writable) recovering its effects into the data region.
    pub fn open(file: File, off: u64, len: u64, writable: bool) -> Result<Self> {
        if len < MIN_REGION_LEN || len % 2 != 0 {
            return Err(Error::WalBadAlloc("WAL region too small"));
        }
        let segment_len = len / 2;

        let seq0 = read_segment_header_raw(&file, off)?.0;
        let seq1 = read_segment_header_raw(&file, off + segment_len)?.0;
        // The authoritative segment has the greater seq.
        let auth_slot: usize = if sliding_lt(seq0, seq1) { 1 } else { 0 };
        let recycle_slot = 1 - auth_slot;

        let auth = read_segment_raw(&file, off + auth_slot as u64 * segment_len, segment_len)?;
        debug!(
            "opening WAL: authoritative slot {} seq {} file_size {} ({} records)",
            auth_slot,
            auth.seq,
            auth.file_size,
            auth.records.len(),
        );

        // In-memory application of the log: committed transactions
        // merge into the replacement map, uncommitted groups drop.
        let mut repl = ReplacementMap::new();
        let mut fd_size = auth.file_size;
        let mut by_tx: HashMap<u32, Vec<WalRecord>> = HashMap::new();
        for record in auth.records {
            match record {
                WalRecord::End => {}
                WalRecord::Commit { tx_id } => {
                    for r in by_tx.remove(&tx_id).unwrap_or_default() {
                        match r {
                            WalRecord::Write { offset, data: bytes, .. } => repl.put(offset, bytes),
                            WalRecord::Resize { new_size, .. } => fd_size = new_size,
                            WalRecord::End | WalRecord::Commit { .. } => unreachable!(),
                        }
                    }
                }
                other => by_tx.entry(other.tx_id()).or_default().push(other),
            }
        }

        let next_seq = auth.seq.wrapping_add(1);
        let slot_begin = off + recycle_slot as u64 * segment_len;

        if writable {
            // Recover: apply pending writes into the data region, then
            // start a fresh segment in the recyclable slot.
            for (woff, bytes) in repl.iter() {
                file.write_all_at(off + len + woff, bytes)?;
            }
            repl.clear();
            file.set_len(off + len + fd_size)?;
            file.sync_data()?;

            let mut seg = Vec::with_capacity((SEGMENT_HEADER_LEN as usize) + END_LEN);
            write_segment_header(&mut seg, next_seq, fd_size);
            WalRecord::End.encode(&mut seg);
            file.write_all_at(slot_begin, &seg)?;
            file.sync_data()?;
        }

        Ok(WalRegion {
            off,
            len,
            file,
            writable,
            log: Mutex::new(LogState {
                current_slot: recycle_slot,
                current_seq: next_seq,
                slot_off: slot_begin + SEGMENT_HEADER_LEN,
            }),
            data: RwLock::new(DataState { repl, fd_size }),
            alloc: Mutex::new(AllocState {
                states: Vec::new(),
                avail: Vec::new(),
                completed_count: 0,
            }),
        })
    }

    fn segment_len(&self) -> u64 {
        self.len / 2
    }

    fn slot_begin(&self, slot: usize) -> u64 {
        self.off + slot as u64 * self.segment_len()
    }

    fn slot_end(&self, slot: usize) -> u64 {
        self.slot_begin(slot) + self.segment_len()
    }

    /// First file offset past the WAL region; logical offset 0 of the
    /// data region maps here.
    fn data_begin(&self) -> u64 {
        self.off + self.len
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_segment(&self, slot: usize) -> Result<SegmentData> {
        read_segment_raw(&self.file, self.slot_begin(slot), self.segment_len())
    }

    /// Logical size of the data region.
    pub fn size(&self) -> u64 {
        self.data.read().fd_size
    }

    /// Read from the logical file view: pending writes layered over
    /// the data region, zero-filled where the physical file is shorter
    /// than the logical size.
    pub fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        if off >= data.fd_size || buf.is_empty() {
            return Ok(0);
        }
        let mut len = (buf.len() as u64).min(data.fd_size - off) as usize;

        let n = data.repl.read_at(off, &mut buf[..len]);
        if n != 0 {
            return Ok(n);
        }
        // In a gap of the replacement map: the file may only serve
        // bytes up to the next pending interval.
        if let Some(gap) = data.repl.gap_len(off) {
            len = len.min(gap as usize);
        }
        let buf = &mut buf[..len];

        let n = self.file.read_at(self.data_begin() + off, buf)?;
        if n != 0 {
            return Ok(n);
        }

        // Physical file is shorter than the logical size: the grown
        // tail reads as zeroes.
        buf.fill(0);
        Ok(len)
    }

    /// Allocate a 24-bit transaction id, recycling completed ids and
    /// compacting the log when the id space looks exhausted.
    pub fn allocate_tx_id(&self) -> Result<u32> {
        loop {
            {
                let mut alloc = self.alloc.lock();
                if let Some(id) = alloc.avail.pop() {
                    debug_assert!(!alloc.states[id as usize]);
                    alloc.states[id as usize] = true;
                    return Ok(id);
                }
                if alloc.states.len() <= TX_ID_MASK as usize {
                    let id = alloc.states.len() as u32;
                    alloc.states.push(true);
                    return Ok(id);
                }
                if alloc.completed_count == 0 {
                    return Err(Error::WalBadAlloc("out of WAL transaction ids"));
                }
            }
            // Compaction resets the id state; retry afterwards.
            self.compact()?;
        }
    }

    /// Log a `write` record for an in-progress transaction.
    pub fn tx_write(&self, tx_id: u32, offset: u64, data: &[u8]) -> Result<()> {
        let record = WalRecord::Write {
            tx_id,
            offset,
            data: data.to_vec(),
        };
        let mut buf = Vec::with_capacity(16 + data.len() + END_LEN);
        record.encode(&mut buf);
        WalRecord::End.encode(&mut buf);

        let mut log = self.log.lock();
        self.log_append(&mut log, &buf)
    }

    /// Log a `resize` record for an in-progress transaction.
    pub fn tx_resize(&self, tx_id: u32, new_size: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(12 + END_LEN);
        WalRecord::Resize { tx_id, new_size }.encode(&mut buf);
        WalRecord::End.encode(&mut buf);

        let mut log = self.log.lock();
        self.log_append(&mut log, &buf)
    }

    /// Append `buf` (a serialized record followed by a new end marker)
    /// at the current end marker.
    ///
    /// The trailing part goes in first and is synced; the flip of the
    /// old end marker into the record header is the last write.
    fn log_append(&self, log: &mut LogState, buf: &[u8]) -> Result<()> {
        debug_assert!(buf.len() > END_LEN);
        self.log_ensure_space(log, buf.len() as u64)?;

        self.file.write_all_at(log.slot_off + END_LEN as u64, &buf[END_LEN..])?;
        self.file.sync_data()?;
        self.file.write_all_at(log.slot_off, &buf[..END_LEN])?;

        log.slot_off += (buf.len() - END_LEN) as u64;
        Ok(())
    }

    fn log_ensure_space(&self, log: &mut LogState, need: u64) -> Result<()> {
        if self.slot_end(log.current_slot) - log.slot_off < need {
            self.compact_locked(log)?;
            if self.slot_end(log.current_slot) - log.slot_off < need {
                return Err(Error::WalBadAlloc("no space in WAL"));
            }
        }
        Ok(())
    }

    /// Commit a transaction: durably log the commit marker, then merge
    /// its writes into the in-memory state.
    ///
    /// `undo_fn` receives the bytes displaced by this commit (reading
    /// gaps as zeroes), for use as a compensation trail by callers that
    /// must logically roll back an already-committed step.
    pub fn tx_commit(
        &self,
        tx_id: u32,
        writes: ReplacementMap,
        new_file_size: Option<u64>,
        undo_fn: impl FnOnce(ReplacementMap),
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(2 * END_LEN);
        WalRecord::Commit { tx_id }.encode(&mut buf);
        WalRecord::End.encode(&mut buf);

        let mut log = self.log.lock();
        self.log_ensure_space(&mut log, buf.len() as u64)?;

        // Excludes readers of the in-memory state for the whole flip.
        let mut data = self.data.write();

        // Capture the undo image before anything is merged.
        let mut undo = ReplacementMap::new();
        for (woff, wdata) in writes.iter() {
            let end = woff + wdata.len() as u64;
            let mut off = woff;
            let mut tmp = vec![0u8; wdata.len()];
            while off < end {
                let len = (end - off) as usize;
                let n = data.repl.read_at(off, &mut tmp[..len]);
                if n != 0 {
                    undo.put(off, tmp[..n].to_vec());
                    off += n as u64;
                } else if off >= data.fd_size {
                    undo.put(off, vec![0u8; len]);
                    off = end;
                } else {
                    let mut flen = (len as u64).min(data.fd_size - off);
                    if let Some(gap) = data.repl.gap_len(off) {
                        flen = flen.min(gap);
                    }
                    let mut fbuf = vec![0u8; flen as usize];
                    read_full_zero(&self.file, self.data_begin() + off, &mut fbuf)?;
                    undo.put(off, fbuf);
                    off += flen;
                }
            }
        }

        // Write everything but the record header. Until the header is
        // flipped the log still terminates before this commit.
        self.file.write_all_at(log.slot_off + END_LEN as u64, &buf[END_LEN..])?;
        self.file.sync_data()?;

        let mut alloc = self.alloc.lock();
        debug_assert!(alloc.states[tx_id as usize]);

        // The flip. This is the commit point.
        self.file.write_all_at(log.slot_off, &buf[..END_LEN])?;
        // If this sync fails the commit has already been written in
        // full, and undoing it would most likely hit the same error.
        // Log and continue.
        if let Err(err) = self.file.sync_all() {
            warn!("failed to flush WAL log after commit: {err}");
        }

        for (woff, wdata) in writes.iter() {
            data.repl.put(woff, wdata.to_vec());
        }
        alloc.states[tx_id as usize] = false;
        alloc.completed_count += 1;
        if let Some(new_size) = new_file_size {
            data.fd_size = new_size;
            data.repl.truncate(new_size);
        }

        log.slot_off += (buf.len() - END_LEN) as u64;

        undo_fn(undo);
        Ok(())
    }

    /// Roll back a transaction. Nothing needs to hit disk: writes only
    /// merge into the shared state at commit time.
    pub fn tx_rollback(&self, tx_id: u32) {
        let mut alloc = self.alloc.lock();
        debug_assert!(alloc.states[tx_id as usize]);
        alloc.states[tx_id as usize] = false;
        alloc.completed_count += 1;
    }

    /// Compact the log by replaying it into the data region and
    /// switching to a fresh segment carrying only in-flight records.
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        self.compact_locked(&mut log)
    }

    fn compact_locked(&self, log: &mut LogState) -> Result<()> {
        {
            // Nothing to reclaim while no transaction has finished.
            let alloc = self.alloc.lock();
            if alloc.completed_count == 0 {
                return Ok(());
            }
        }

        let current = self.read_segment(log.current_slot)?;
        let live: Vec<bool> = self.alloc.lock().states.clone();

        // Copy records of still-live transactions into the new segment.
        let mut body = Vec::new();
        for record in &current.records {
            if record.is_end() {
                continue;
            }
            let tx_id = record.tx_id() as usize;
            if tx_id < live.len() && live[tx_id] {
                record.encode(&mut body);
            }
        }
        let live_len = body.len() as u64;
        WalRecord::End.encode(&mut body);

        let new_slot = 1 - log.current_slot;
        let new_seq = log.current_seq.wrapping_add(1);
        debug_assert!(SEGMENT_HEADER_LEN + body.len() as u64 <= self.segment_len());
        self.file
            .write_all_at(self.slot_begin(new_slot) + SEGMENT_HEADER_LEN, &body)?;

        // Apply the replacement map into the data region.
        let fd_size;
        {
            let mut data = self.data.write();
            for (woff, bytes) in data.repl.iter() {
                self.file.write_all_at(self.data_begin() + woff, bytes)?;
            }
            data.repl.clear();
            fd_size = data.fd_size;
        }
        self.file.sync_data()?;

        // All data is on disk; activating the new segment by writing
        // its header makes it authoritative. No sync is needed: until
        // the next commit both segments describe the same state.
        let mut header = Vec::with_capacity(SEGMENT_HEADER_LEN as usize);
        write_segment_header(&mut header, new_seq, fd_size);
        self.file.write_all_at(self.slot_begin(new_slot), &header)?;

        {
            let mut alloc = self.alloc.lock();
            while alloc.states.last() == Some(&false) {
                alloc.states.pop();
            }
            alloc.avail.clear();
            let free: Vec<u32> = alloc
                .states
                .iter()
                .enumerate()
                .filter(|(_, &live)| !live)
                .map(|(id, _)| id as u32)
                .collect();
            alloc.avail = free;
            alloc.completed_count = 0;
        }

        debug!(
            "WAL compaction: slot {} -> {} seq {} ({} live bytes)",
            log.current_slot, new_slot, new_seq, live_len,
        );
        log.current_slot = new_slot;
        log.current_seq = new_seq;
        log.slot_off = self.slot_begin(new_slot) + SEGMENT_HEADER_LEN + live_len;
        Ok(())
    }
}

fn write_segment_header(out: &mut Vec<u8>, seq: u32, file_size: u64) {
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&file_size.to_be_bytes());
}

fn read_segment_header_raw(file: &File, begin: u64) -> Result<(u32, u64)> {
    let mut buf = [0u8; SEGMENT_HEADER_LEN as usize];
    read_full_zero(file, begin, &mut buf)?;
    let seq = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let file_size = u64::from_be_bytes(buf[4..12].try_into().unwrap());
    Ok((seq, file_size))
}

fn read_segment_raw(file: &File, begin: u64, segment_len: u64) -> Result<SegmentData> {
    let mut buf = vec![0u8; segment_len as usize];
    read_full_zero(file, begin, &mut buf)?;

    let mut pos = 0usize;
    let seq = take_u32(&buf, &mut pos)?;
    let file_size = take_u64(&buf, &mut pos)?;

    let mut records = Vec::new();
    loop {
        let record = WalRecord::decode(&buf, &mut pos)?;
        let end = record.is_end();
        records.push(record);
        if end {
            break;
        }
    }

    Ok(SegmentData { seq, file_size, records })
}

/// Read into `buf`, zero-filling whatever lies past the physical end
/// of the file.
fn read_full_zero(file: &File, mut off: u64, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = file.read_at(off, buf)?;
        if n == 0 {
            buf.fill(0);
            return Ok(());
        }
        off += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}
