//! One append-only run of a topic's messages on disk.
//!
//! A segment covers the offsets `[base_offset, next_offset)` and consists of two files
//! in the topic directory:
//!
//! - `{base_offset:020}.log`: framed records, see [`crate::codec`]
//! - `{base_offset:020}.index`: sparse index of 16-byte `(offset u64 BE, position u64 BE)`
//!   pairs, one every `index_interval` bytes of records; the first record is always indexed
//!
//! Opening a segment recovers it: the tail after the last usable index entry is scanned,
//! a torn or corrupt trailing record is cut off and index entries are rebuilt as needed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use crate::codec::{self, Frame};
use crate::error::ResultExt;
use crate::types::{Message, Offset, Record, SegmentInfo, TimestampMillis};
use crate::utils::timestamp_millis;
use crate::{BrokerError, Result};

pub const LOG_SUFFIX: &str = "log";
pub const INDEX_SUFFIX: &str = "index";

const INDEX_ENTRY_LEN: usize = 16;

#[inline]
pub fn log_file_name(base_offset: Offset) -> String {
    format!("{base_offset:020}.{LOG_SUFFIX}")
}

#[inline]
pub fn index_file_name(base_offset: Offset) -> String {
    format!("{base_offset:020}.{INDEX_SUFFIX}")
}

/// Base offset encoded in a segment log file name, `None` for any other file.
#[inline]
pub fn parse_base_offset(file_name: &str) -> Option<Offset> {
    let stem = file_name.strip_suffix(LOG_SUFFIX)?.strip_suffix('.')?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    offset: Offset,
    position: u64,
}

impl IndexEntry {
    #[inline]
    fn to_bytes(self) -> [u8; INDEX_ENTRY_LEN] {
        let mut b = [0u8; INDEX_ENTRY_LEN];
        b[..8].copy_from_slice(&self.offset.to_be_bytes());
        b[8..].copy_from_slice(&self.position.to_be_bytes());
        b
    }

    #[inline]
    fn from_bytes(b: &[u8]) -> Self {
        let mut offset = [0u8; 8];
        let mut position = [0u8; 8];
        offset.copy_from_slice(&b[..8]);
        position.copy_from_slice(&b[8..INDEX_ENTRY_LEN]);
        Self { offset: u64::from_be_bytes(offset), position: u64::from_be_bytes(position) }
    }
}

//Borrowed form of Message, encodes to the same bytes.
#[derive(Serialize)]
struct EntryRef<'a> {
    offset: Offset,
    timestamp: TimestampMillis,
    key: &'a Option<Bytes>,
    payload: &'a Bytes,
}

struct State {
    log: File,
    index_file: File,
    index: Vec<IndexEntry>,
    flushed_index: usize,
    next_offset: Offset,
    size: u64,
    since_index: u64,
    created_at: TimestampMillis,
    last_append: TimestampMillis,
    read_only: bool,
}

/// Where a segment ended before an append, see [`Segment::rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    next_offset: Offset,
    size: u64,
    since_index: u64,
    index_len: usize,
    created_at: TimestampMillis,
    last_append: TimestampMillis,
}

pub struct Segment {
    base_offset: Offset,
    log_path: PathBuf,
    index_path: PathBuf,
    index_interval: u64,
    state: Mutex<State>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("base_offset", &self.base_offset).field("path", &self.log_path).finish()
    }
}

struct Scan {
    end: u64,
    next_offset: Offset,
    since_index: u64,
    entries: Vec<IndexEntry>,
    torn: bool,
    start_mismatch: bool,
}

impl Segment {
    /// Opens the segment starting at `base_offset` in `dir`, creating empty files if
    /// needed and recovering existing ones.
    pub fn open(dir: &Path, base_offset: Offset, index_interval: u64) -> Result<Self> {
        let log_path = dir.join(log_file_name(base_offset));
        let index_path = dir.join(index_file_name(base_offset));
        let open = |path: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .with_context(|| format!("open {path:?}"))
        };
        let log = open(&log_path)?;
        let index_file = open(&index_path)?;

        let mut state = State {
            log,
            index_file,
            index: Vec::new(),
            flushed_index: 0,
            next_offset: base_offset,
            size: 0,
            since_index: 0,
            created_at: timestamp_millis(),
            last_append: 0,
            read_only: false,
        };
        Self::recover(base_offset, index_interval.max(1), &log_path, &mut state)
            .with_context(|| format!("recover segment {log_path:?}"))?;

        Ok(Self { base_offset, log_path, index_path, index_interval: index_interval.max(1), state: Mutex::new(state) })
    }

    fn recover(base_offset: Offset, interval: u64, path: &Path, st: &mut State) -> Result<()> {
        let file_len = st.log.metadata()?.len();

        let mut raw = Vec::new();
        st.index_file.seek(SeekFrom::Start(0))?;
        st.index_file.read_to_end(&mut raw)?;
        let mut dirty = raw.len() % INDEX_ENTRY_LEN != 0;

        let mut index: Vec<IndexEntry> = Vec::with_capacity(raw.len() / INDEX_ENTRY_LEN);
        for e in raw.chunks_exact(INDEX_ENTRY_LEN).map(IndexEntry::from_bytes) {
            let first_ok = !index.is_empty() || (e.offset == base_offset && e.position == 0);
            let ordered = index.last().map(|p: &IndexEntry| e.offset > p.offset && e.position > p.position);
            if !first_ok || e.position >= file_len || ordered == Some(false) {
                dirty = true;
                break;
            }
            index.push(e);
        }

        let mut scan = Self::scan(&st.log, base_offset, index.last().copied(), interval)?;
        if scan.start_mismatch {
            log::warn!("{path:?} index does not match the log, rebuilding it");
            index.clear();
            dirty = true;
            scan = Self::scan(&st.log, base_offset, None, interval)?;
        }

        if scan.torn || scan.end < file_len {
            log::warn!(
                "{:?} has a torn or corrupt tail, truncating from {} to {} bytes, next offset {}",
                path,
                file_len,
                scan.end,
                scan.next_offset
            );
            st.log.set_len(scan.end)?;
            st.log.sync_all()?;
        }

        let before = index.len();
        index.retain(|e| e.position < scan.end);
        dirty |= before != index.len() || !scan.entries.is_empty();
        index.extend(scan.entries);

        if dirty {
            let mut buf = Vec::with_capacity(index.len() * INDEX_ENTRY_LEN);
            for e in &index {
                buf.extend_from_slice(&e.to_bytes());
            }
            st.index_file.set_len(0)?;
            st.index_file.seek(SeekFrom::Start(0))?;
            st.index_file.write_all(&buf)?;
            st.index_file.sync_all()?;
        }

        //segment age is wall-clock time, record timestamps belong to the producers
        if scan.end > 0 {
            let meta = st.log.metadata()?;
            let modified = meta.modified().ok().map(to_millis);
            if let Some(t) = meta.created().ok().map(to_millis).or(modified) {
                st.created_at = st.created_at.min(t);
            }
            st.last_append = modified.unwrap_or(st.created_at).max(st.created_at);
        } else {
            st.last_append = st.created_at;
        }
        st.flushed_index = index.len();
        st.index = index;
        st.size = scan.end;
        st.next_offset = scan.next_offset;
        st.since_index = scan.since_index;
        log::debug!("{:?} opened, next offset {}, {} bytes", path, st.next_offset, st.size);
        Ok(())
    }

    fn scan(log: &File, base_offset: Offset, start: Option<IndexEntry>, interval: u64) -> Result<Scan> {
        let start_entry = start.unwrap_or(IndexEntry { offset: base_offset, position: 0 });
        let mut reader = BufReader::new(log);
        reader.seek(SeekFrom::Start(start_entry.position))?;

        let mut scan = Scan {
            end: start_entry.position,
            next_offset: start_entry.offset,
            since_index: 0,
            entries: Vec::new(),
            torn: false,
            start_mismatch: false,
        };
        let mut have_index = start.is_some();
        loop {
            let (body, len) = match codec::read_frame(&mut reader)? {
                Frame::Eof => break,
                Frame::Torn => {
                    scan.torn = true;
                    break;
                }
                Frame::Record { body, len } => (body, len),
            };
            let msg = match codec::decode::<Message>(&body) {
                Ok(msg) if msg.offset == scan.next_offset => msg,
                _ => {
                    if scan.end == start_entry.position && start.is_some() {
                        scan.start_mismatch = true;
                    }
                    scan.torn = true;
                    break;
                }
            };

            let indexed = start.is_some() && scan.end == start_entry.position;
            if indexed {
                scan.since_index = 0;
            } else if !have_index || scan.since_index >= interval {
                scan.entries.push(IndexEntry { offset: msg.offset, position: scan.end });
                have_index = true;
                scan.since_index = 0;
            }
            scan.since_index += len;
            scan.end += len;
            scan.next_offset += 1;
        }
        Ok(scan)
    }

    #[inline]
    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    #[inline]
    pub fn next_offset(&self) -> Offset {
        self.state.lock().next_offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.log_path
    }

    pub fn info(&self) -> SegmentInfo {
        let st = self.state.lock();
        SegmentInfo {
            base_offset: self.base_offset,
            next_offset: st.next_offset,
            size: st.size,
            created_at: st.created_at,
            last_append: st.last_append,
            read_only: st.read_only,
        }
    }

    /// Whether a non-empty segment has reached its size or age limit. `segment_ms == 0`
    /// disables the age limit.
    #[inline]
    pub fn should_roll(&self, segment_bytes: u64, segment_ms: u64, now: TimestampMillis) -> bool {
        let st = self.state.lock();
        if st.next_offset == self.base_offset {
            return false;
        }
        st.size >= segment_bytes || (segment_ms > 0 && now.saturating_sub(st.created_at) >= segment_ms as i64)
    }

    #[inline]
    pub fn append(&self, record: &Record, now: TimestampMillis) -> Result<Offset> {
        self.append_batch(std::slice::from_ref(record), now)
    }

    /// Appends all records or none, returns the offset of the first one. `now` is the
    /// append time used for rolling and retention.
    pub fn append_batch(&self, records: &[Record], now: TimestampMillis) -> Result<Offset> {
        let mut st = self.state.lock();
        if st.read_only {
            return Err(anyhow!("segment {:?} is read-only", self.log_path).into());
        }
        let first = st.next_offset;
        if records.is_empty() {
            return Ok(first);
        }

        let mut buf = Vec::with_capacity(records.iter().map(|r| r.size() + 64).sum());
        let mut entries = Vec::new();
        let mut since = st.since_index;
        let mut pos = st.size;
        for (i, r) in records.iter().enumerate() {
            let offset = first + i as u64;
            if (st.index.is_empty() && entries.is_empty()) || since >= self.index_interval {
                entries.push(IndexEntry { offset, position: pos });
                since = 0;
            }
            let len = codec::encode(&EntryRef { offset, timestamp: r.timestamp, key: &r.key, payload: &r.payload }, &mut buf)?;
            since += len;
            pos += len;
        }

        let pre = st.size;
        if let Err(e) = Self::write_at(&mut st.log, pre, &buf) {
            //never leave a partial record behind
            if let Err(te) = st.log.set_len(pre) {
                log::error!("{:?} rollback to {} bytes failed, {:?}", self.log_path, pre, te);
            }
            return Err(BrokerError::from(e).context(format!("append to segment {:?}", self.log_path)));
        }

        if first == self.base_offset {
            st.created_at = now;
            st.last_append = now;
        } else {
            st.last_append = st.last_append.max(now);
        }
        st.size = pos;
        st.next_offset = first + records.len() as u64;
        st.since_index = since;
        st.index.extend(entries);
        Ok(first)
    }

    #[inline]
    pub fn mark(&self) -> Mark {
        let st = self.state.lock();
        Mark {
            next_offset: st.next_offset,
            size: st.size,
            since_index: st.since_index,
            index_len: st.index.len(),
            created_at: st.created_at,
            last_append: st.last_append,
        }
    }

    /// Cuts off everything appended after `mark`, on disk and in memory. The next append
    /// reuses the offsets.
    pub fn rollback(&self, mark: Mark) -> Result<()> {
        let mut st = self.state.lock();
        if mark.next_offset > st.next_offset || mark.index_len > st.index.len() {
            return Err(anyhow!("segment {:?} cannot roll back to offset {}", self.log_path, mark.next_offset).into());
        }
        Self::truncate_files(&mut st, &mark)
            .map_err(|e| BrokerError::from(e).context(format!("roll back segment {:?}", self.log_path)))?;
        st.index.truncate(mark.index_len);
        st.next_offset = mark.next_offset;
        st.size = mark.size;
        st.since_index = mark.since_index;
        st.created_at = mark.created_at;
        st.last_append = mark.last_append;
        log::warn!("{:?} rolled back to offset {}, {} bytes", self.log_path, mark.next_offset, mark.size);
        Ok(())
    }

    fn truncate_files(st: &mut State, mark: &Mark) -> io::Result<()> {
        st.log.set_len(mark.size)?;
        if st.flushed_index > mark.index_len {
            st.index_file.set_len((mark.index_len * INDEX_ENTRY_LEN) as u64)?;
            st.flushed_index = mark.index_len;
        }
        Ok(())
    }

    #[inline]
    fn write_at(log: &mut File, pos: u64, buf: &[u8]) -> io::Result<()> {
        log.seek(SeekFrom::Start(pos))?;
        log.write_all(buf)
    }

    /// Writes pending index entries; with `sync` also fsyncs both files.
    pub fn flush(&self, sync: bool) -> Result<()> {
        let mut st = self.state.lock();
        Self::flush_locked(&mut st, sync).with_context(|| format!("flush segment {:?}", self.log_path))
    }

    fn flush_locked(st: &mut State, sync: bool) -> Result<()> {
        if st.flushed_index < st.index.len() {
            let mut buf = Vec::with_capacity((st.index.len() - st.flushed_index) * INDEX_ENTRY_LEN);
            for e in &st.index[st.flushed_index..] {
                buf.extend_from_slice(&e.to_bytes());
            }
            st.index_file.seek(SeekFrom::End(0))?;
            st.index_file.write_all(&buf)?;
            st.flushed_index = st.index.len();
        }
        if sync {
            st.log.sync_data()?;
            st.index_file.sync_data()?;
        }
        Ok(())
    }

    /// Flushes, fsyncs and makes the segment read-only.
    pub fn close(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.read_only {
            return Ok(());
        }
        Self::flush_locked(&mut st, true).with_context(|| format!("close segment {:?}", self.log_path))?;
        st.read_only = true;
        Ok(())
    }

    /// Marks a recovered segment read-only without touching the files.
    #[inline]
    pub fn seal(&self) {
        self.state.lock().read_only = true;
    }

    #[inline]
    pub fn read_at(&self, offset: Offset) -> Result<Message> {
        let next = self.next_offset();
        let mut msgs = self.read_batch(offset, 1, next)?;
        msgs.pop().ok_or(BrokerError::OffsetOutOfRange { offset, start: self.base_offset, end: next })
    }

    /// Reads up to `max` consecutive messages starting at `offset`, stopping before `upto`.
    pub fn read_batch(&self, offset: Offset, max: usize, upto: Offset) -> Result<Vec<Message>> {
        let mut st = self.state.lock();
        if offset < self.base_offset || offset >= st.next_offset {
            return Err(BrokerError::OffsetOutOfRange { offset, start: self.base_offset, end: st.next_offset });
        }
        let end = upto.min(st.next_offset);
        let mut msgs = Vec::with_capacity(max.min((end.saturating_sub(offset)) as usize));
        if max == 0 || offset >= end {
            return Ok(msgs);
        }

        let i = st.index.partition_point(|e| e.offset <= offset);
        let mut pos = if i == 0 { 0 } else { st.index[i - 1].position };
        let size = st.size;
        st.log.seek(SeekFrom::Start(pos))?;
        let mut reader = BufReader::new(Read::take(&st.log, size - pos));
        let mut expected = offset;
        while expected < end && msgs.len() < max {
            let (body, len) = match codec::read_frame(&mut reader)? {
                Frame::Record { body, len } => (body, len),
                Frame::Eof | Frame::Torn => {
                    return Err(BrokerError::Corrupted { segment: self.base_offset, position: pos });
                }
            };
            let msg = codec::decode::<Message>(&body)
                .map_err(|_| BrokerError::Corrupted { segment: self.base_offset, position: pos })?;
            pos += len;
            if msg.offset < expected {
                continue;
            }
            if msg.offset > expected {
                return Err(BrokerError::Corrupted { segment: self.base_offset, position: pos - len });
            }
            expected += 1;
            msgs.push(msg);
        }
        Ok(msgs)
    }

    /// Removes both files. Readers still holding the segment keep their open handles.
    pub fn delete(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.read_only = true;
        for path in [&self.log_path, &self.index_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(BrokerError::from(e).context(format!("delete {path:?}"))),
            }
        }
        log::debug!("deleted segment {:?}", self.log_path);
        Ok(())
    }
}

#[inline]
fn to_millis(t: SystemTime) -> TimestampMillis {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as TimestampMillis).unwrap_or_default()
}
