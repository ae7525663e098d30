//! Durable committed offsets per (topic, group).
//!
//! Commits are appended to `<data_dir>/__offsets/offsets.log` with the same framing as
//! segment files. Replaying the file on open keeps the highest offset per key, a
//! tombstone removes a key. The file is rewritten with one record per key once it holds
//! `compact_threshold` times more records than live keys.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec::{self, Frame};
use crate::error::ResultExt;
use crate::types::{DashMap, GroupName, Offset, TimestampMillis, TopicName};
use crate::utils::timestamp_millis;
use crate::Result;

pub const OFFSETS_DIR: &str = "__offsets";
pub const OFFSETS_FILE: &str = "offsets.log";

type Key = (TopicName, GroupName);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitRecord {
    topic: String,
    group: String,
    //None removes the key
    offset: Option<Offset>,
    timestamp: TimestampMillis,
}

struct LogFile {
    file: File,
    records: usize,
}

pub struct OffsetTracker {
    path: PathBuf,
    sync: bool,
    compact_threshold: usize,
    committed: DashMap<Key, Offset>,
    log: Mutex<LogFile>,
}

impl std::fmt::Debug for OffsetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetTracker").field("path", &self.path).field("keys", &self.committed.len()).finish()
    }
}

impl OffsetTracker {
    pub fn open(data_dir: &Path, sync: bool, compact_threshold: usize) -> Result<Self> {
        let dir = data_dir.join(OFFSETS_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("create offsets directory {dir:?}"))?;
        let path = dir.join(OFFSETS_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open {path:?}"))?;

        let committed = DashMap::default();
        let records = Self::replay(&path, &mut file, &committed).with_context(|| format!("replay {path:?}"))?;
        log::info!("offsets loaded from {:?}, {} group offset(s), {} record(s)", path, committed.len(), records);

        let tracker = Self {
            path,
            sync,
            compact_threshold: compact_threshold.max(2),
            committed,
            log: Mutex::new(LogFile { file, records }),
        };
        {
            let mut log = tracker.log.lock();
            tracker.maybe_compact(&mut log)?;
        }
        Ok(tracker)
    }

    fn replay(path: &Path, file: &mut File, committed: &DashMap<Key, Offset>) -> Result<usize> {
        let len = file.metadata()?.len();
        let (pos, records) = {
            let mut reader = BufReader::new(&*file);
            reader.seek(SeekFrom::Start(0))?;
            let mut pos = 0u64;
            let mut records = 0;
            while let Frame::Record { body, len } = codec::read_frame(&mut reader)? {
                let rec: CommitRecord = match codec::decode(&body) {
                    Ok(rec) => rec,
                    Err(_) => break,
                };
                let key = (TopicName::from(rec.topic), GroupName::from(rec.group));
                match rec.offset {
                    Some(offset) => {
                        let mut cur = committed.entry(key).or_insert(offset);
                        if *cur < offset {
                            *cur = offset;
                        }
                    }
                    None => {
                        committed.remove(&key);
                    }
                }
                pos += len;
                records += 1;
            }
            (pos, records)
        };
        if pos < len {
            log::warn!("{:?} has a torn tail, truncating from {} to {} bytes", path, len, pos);
            file.set_len(pos)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(pos))?;
        Ok(records)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records `offset` as processed by `group` on `topic`. Returns `false` without
    /// writing anything when an equal or higher offset is already committed.
    pub fn commit(&self, topic: &TopicName, group: &GroupName, offset: Offset) -> Result<bool> {
        let key = (topic.clone(), group.clone());
        if matches!(self.committed.get(&key), Some(cur) if *cur >= offset) {
            return Ok(false);
        }
        let mut log = self.log.lock();
        //check again, another commit may have won the race for the file
        if matches!(self.committed.get(&key), Some(cur) if *cur >= offset) {
            return Ok(false);
        }
        let rec = CommitRecord {
            topic: topic.to_string(),
            group: group.to_string(),
            offset: Some(offset),
            timestamp: timestamp_millis(),
        };
        self.append(&mut log, &rec).with_context(|| format!("commit offset {offset} of {topic}/{group}"))?;
        self.committed.insert(key, offset);
        self.maybe_compact(&mut log)?;
        Ok(true)
    }

    #[inline]
    pub fn fetch_committed(&self, topic: &TopicName, group: &GroupName) -> Option<Offset> {
        self.committed.get(&(topic.clone(), group.clone())).map(|v| *v)
    }

    /// Forgets the committed offset of `group` on `topic`.
    pub fn delete(&self, topic: &TopicName, group: &GroupName) -> Result<bool> {
        let key = (topic.clone(), group.clone());
        let mut log = self.log.lock();
        if !self.committed.contains_key(&key) {
            return Ok(false);
        }
        let rec = CommitRecord { topic: topic.to_string(), group: group.to_string(), offset: None, timestamp: timestamp_millis() };
        self.append(&mut log, &rec).with_context(|| format!("delete offset of {topic}/{group}"))?;
        self.committed.remove(&key);
        Ok(true)
    }

    /// Forgets the committed offsets of every group on `topic`.
    pub fn delete_topic(&self, topic: &TopicName) -> Result<usize> {
        let groups: Vec<GroupName> =
            self.committed.iter().filter(|e| &e.key().0 == topic).map(|e| e.key().1.clone()).collect();
        let mut n = 0;
        for group in groups {
            if self.delete(topic, &group)? {
                n += 1;
            }
        }
        Ok(n)
    }

    pub fn list(&self) -> Vec<(TopicName, GroupName, Offset)> {
        let mut all: Vec<_> =
            self.committed.iter().map(|e| (e.key().0.clone(), e.key().1.clone(), *e.value())).collect();
        all.sort();
        all
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    pub fn sync(&self) -> Result<()> {
        let log = self.log.lock();
        log.file.sync_data().with_context(|| format!("sync {:?}", self.path))
    }

    fn append(&self, log: &mut LogFile, rec: &CommitRecord) -> Result<()> {
        let mut buf = Vec::with_capacity(64);
        codec::encode(rec, &mut buf)?;
        let pos = log.file.stream_position()?;
        if let Err(e) = Self::write(&mut log.file, &buf, self.sync) {
            if let Err(te) = log.file.set_len(pos).and_then(|_| log.file.seek(SeekFrom::Start(pos)).map(|_| ())) {
                log::error!("{:?} rollback to {} bytes failed, {:?}", self.path, pos, te);
            }
            return Err(e.into());
        }
        log.records += 1;
        Ok(())
    }

    #[inline]
    fn write(file: &mut File, buf: &[u8], sync: bool) -> io::Result<()> {
        file.write_all(buf)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn maybe_compact(&self, log: &mut LogFile) -> Result<()> {
        let keys = self.committed.len().max(1);
        if log.records <= self.compact_threshold * keys {
            return Ok(());
        }
        let tmp = self.path.with_extension("log.tmp");
        let mut buf = Vec::new();
        let now = timestamp_millis();
        let mut records = 0;
        for e in self.committed.iter() {
            let rec =
                CommitRecord { topic: e.key().0.to_string(), group: e.key().1.to_string(), offset: Some(*e.value()), timestamp: now };
            codec::encode(&rec, &mut buf)?;
            records += 1;
        }
        {
            let mut f = File::create(&tmp).with_context(|| format!("create {tmp:?}"))?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path).with_context(|| format!("rename {tmp:?} to {:?}", self.path))?;
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        log::debug!("compacted {:?} from {} to {} record(s)", self.path, log.records, records);
        log.file = file;
        log.records = records;
        Ok(())
    }

    #[cfg(test)]
    fn records(&self) -> usize {
        self.log.lock().records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TopicName {
        TopicName::from(s)
    }

    #[test]
    fn monotonic_commit() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = OffsetTracker::open(dir.path(), true, 8).unwrap();
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), None);
        assert!(tracker.commit(&t("T"), &t("G"), 10).unwrap());
        assert!(!tracker.commit(&t("T"), &t("G"), 9).unwrap());
        assert!(!tracker.commit(&t("T"), &t("G"), 10).unwrap());
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), Some(10));
        assert!(tracker.commit(&t("T"), &t("G"), 11).unwrap());
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), Some(11));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_write_keeps_previous_commit() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = OffsetTracker::open(dir.path(), false, 100).unwrap();
        assert!(tracker.commit(&t("T"), &t("G"), 3).unwrap());
        let records = tracker.records();

        let full = OpenOptions::new().write(true).open("/dev/full").unwrap();
        let real = std::mem::replace(&mut tracker.log.lock().file, full);
        assert!(tracker.commit(&t("T"), &t("G"), 8).is_err());
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), Some(3));
        assert_eq!(tracker.records(), records);

        tracker.log.lock().file = real;
        assert!(tracker.commit(&t("T"), &t("G"), 8).unwrap());
        drop(tracker);
        let tracker = OffsetTracker::open(dir.path(), false, 100).unwrap();
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), Some(8));
    }

    #[test]
    fn replay_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tracker = OffsetTracker::open(dir.path(), false, 100).unwrap();
            tracker.commit(&t("T"), &t("G1"), 5).unwrap();
            tracker.commit(&t("T"), &t("G2"), 7).unwrap();
            tracker.commit(&t("T"), &t("G1"), 6).unwrap();
            tracker.commit(&t("U"), &t("G1"), 1).unwrap();
            tracker.delete(&t("U"), &t("G1")).unwrap();
            tracker.sync().unwrap();
        }
        let tracker = OffsetTracker::open(dir.path(), false, 100).unwrap();
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G1")), Some(6));
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G2")), Some(7));
        assert_eq!(tracker.fetch_committed(&t("U"), &t("G1")), None);
        assert_eq!(tracker.list().len(), 2);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let tracker = OffsetTracker::open(dir.path(), true, 100).unwrap();
            tracker.commit(&t("T"), &t("G"), 1).unwrap();
            tracker.commit(&t("T"), &t("G"), 2).unwrap();
            tracker.path().to_path_buf()
        };
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 2).unwrap();

        let tracker = OffsetTracker::open(dir.path(), true, 100).unwrap();
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), Some(1));
        tracker.commit(&t("T"), &t("G"), 3).unwrap();
        drop(tracker);

        let tracker = OffsetTracker::open(dir.path(), true, 100).unwrap();
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), Some(3));
    }

    #[test]
    fn compaction() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = OffsetTracker::open(dir.path(), false, 4).unwrap();
        for i in 0..100 {
            tracker.commit(&t("T"), &t("G"), i).unwrap();
        }
        assert!(tracker.records() <= 4);
        drop(tracker);

        let tracker = OffsetTracker::open(dir.path(), false, 4).unwrap();
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), Some(99));
    }

    #[test]
    fn delete_topic_removes_all_groups() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = OffsetTracker::open(dir.path(), false, 8).unwrap();
        tracker.commit(&t("T"), &t("A"), 1).unwrap();
        tracker.commit(&t("T"), &t("B"), 2).unwrap();
        tracker.commit(&t("U"), &t("A"), 3).unwrap();
        assert_eq!(tracker.delete_topic(&t("T")).unwrap(), 2);
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.delete(&t("T"), &t("A")).unwrap());
    }

    #[test]
    fn concurrent_commits_keep_max() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = std::sync::Arc::new(OffsetTracker::open(dir.path(), false, 8).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        tracker.commit(&t("T"), &t("G"), i * 4 + w).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.fetch_committed(&t("T"), &t("G")), Some(199));
    }
}
