//! A topic's log: an ordered chain of segments forming one offset space.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::ResultExt;
use crate::retention::RetentionPolicy;
use crate::segment::{self, Mark, Segment};
use crate::types::{Message, Offset, Record, SegmentInfo, TimestampMillis, TopicConfig, TopicName};
use crate::{BrokerError, Result};

pub const TOPIC_CONFIG_FILE: &str = "topic.json";
pub const MAX_TOPIC_NAME_LEN: usize = 249;

/// Checks that `name` can be used as a topic and as its directory name.
pub fn validate_topic_name(name: &str) -> Result<()> {
    let invalid = |reason| Err(BrokerError::InvalidTopic(name.to_owned(), reason));
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return invalid("name is longer than 249 characters");
    }
    if name == "." || name == ".." {
        return invalid("name must not be '.' or '..'");
    }
    if name.starts_with("__") {
        return invalid("names starting with '__' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return invalid("only ASCII letters, digits, '.', '_' and '-' are allowed");
    }
    Ok(())
}

/// Reads the persisted configuration of the topic stored in `dir`, if any.
pub fn load_config(dir: &Path) -> Result<Option<TopicConfig>> {
    match fs::read(dir.join(TOPIC_CONFIG_FILE)) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BrokerError::from(e).context(format!("read config of topic directory {dir:?}"))),
    }
}

pub fn save_config(dir: &Path, config: &TopicConfig) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create topic directory {dir:?}"))?;
    let tmp = dir.join(format!("{TOPIC_CONFIG_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec_pretty(config)?).with_context(|| format!("write {tmp:?}"))?;
    fs::rename(&tmp, dir.join(TOPIC_CONFIG_FILE)).with_context(|| format!("rename {tmp:?}"))?;
    Ok(())
}

/// Result of a log append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub first: Offset,
    /// Offset the next append will get.
    pub next: Offset,
    pub rotated: bool,
}

pub struct TopicLog {
    name: TopicName,
    dir: PathBuf,
    config: TopicConfig,
    segments: RwLock<Vec<Arc<Segment>>>,
    visible: watch::Sender<Offset>,
    //set when a failed batch could not be cut off again
    fenced: AtomicBool,
    #[cfg(test)]
    fail_flush: AtomicBool,
}

impl std::fmt::Debug for TopicLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicLog").field("name", &self.name).field("dir", &self.dir).finish()
    }
}

impl TopicLog {
    /// Opens the log in `dir`, recovering every segment found there. Everything that
    /// survives recovery is visible.
    pub fn open(name: TopicName, dir: PathBuf, config: TopicConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&dir).with_context(|| format!("create topic directory {dir:?}"))?;

        let mut bases = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read topic directory {dir:?}"))? {
            let entry = entry?;
            if let Some(base) = entry.file_name().to_str().and_then(segment::parse_base_offset) {
                bases.push(base);
            }
        }
        bases.sort_unstable();

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for base in bases {
            let seg = Segment::open(&dir, base, config.index_interval_bytes)?;
            if let Some(prev) = segments.last().map(|s: &Arc<Segment>| s.next_offset()) {
                if prev != base {
                    log::warn!(
                        "topic {} has a gap or overlap between segments, previous ends at {}, next starts at {}",
                        name,
                        prev,
                        base
                    );
                }
            }
            segments.push(Arc::new(seg));
        }
        //a recovered segment that ended up empty may only be the last one
        while segments.len() > 1 && segments.last().map(|s| s.next_offset() == s.base_offset()).unwrap_or(false) {
            if let Some(s) = segments.pop() {
                s.delete()?;
            }
        }
        if segments.is_empty() {
            segments.push(Arc::new(Segment::open(&dir, 0, config.index_interval_bytes)?));
        }
        let count = segments.len();
        for s in &segments[..count - 1] {
            s.seal();
        }

        let end = segments.last().map(|s| s.next_offset()).unwrap_or_default();
        let (visible, _) = watch::channel(end);
        log::info!("topic {} opened in {:?}, {} segment(s), next offset {}", name, dir, count, end);
        Ok(Self {
            name,
            dir,
            config,
            segments: RwLock::new(segments),
            visible,
            fenced: AtomicBool::new(false),
            #[cfg(test)]
            fail_flush: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn name(&self) -> &TopicName {
        &self.name
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    #[inline]
    fn active(&self) -> Arc<Segment> {
        //the list is never empty
        let segs = self.segments.read();
        segs[segs.len() - 1].clone()
    }

    /// Appends `records` to the active segment, rolling to a new segment first if the
    /// active one is full. Not visible to readers until [`TopicLog::publish_visible`].
    /// Called by the topic's single writer.
    #[inline]
    pub fn append_batch(&self, records: &[Record], now: TimestampMillis) -> Result<Appended> {
        self.append_marked(records, now).map(|(appended, _, _)| appended)
    }

    /// Appends and flushes `records`, fsyncing with `sync`. A batch that cannot be
    /// flushed is cut off again and its offsets go to the next batch. If that fails too,
    /// the topic refuses appends until it is reopened.
    pub fn append_durable(&self, records: &[Record], now: TimestampMillis, sync: bool) -> Result<Appended> {
        let (appended, seg, mark) = self.append_marked(records, now)?;

        #[cfg(test)]
        let injected = self.fail_flush.swap(false, Ordering::AcqRel);
        #[cfg(not(test))]
        let injected = false;
        let flushed = if injected {
            Err(BrokerError::from(io::Error::other("injected flush failure")))
        } else {
            seg.flush(sync)
        };

        if let Err(e) = flushed {
            log::error!("topic {} flush of [{}, {}) failed, {}", self.name, appended.first, appended.next, e);
            if let Err(re) = seg.rollback(mark) {
                log::error!("topic {} rollback failed, no more appends until reopened, {}", self.name, re);
                self.fenced.store(true, Ordering::Release);
            }
            return Err(e);
        }
        Ok(appended)
    }

    fn append_marked(&self, records: &[Record], now: TimestampMillis) -> Result<(Appended, Arc<Segment>, Mark)> {
        if self.is_fenced() {
            return Err(anyhow!("topic {} refuses appends after a failed rollback", self.name).into());
        }
        let mut active = self.active();
        let mut rotated = false;
        if !records.is_empty() && active.should_roll(self.config.segment_bytes, self.config.segment_ms, now) {
            active = self.rotate(&active)?;
            rotated = true;
        }
        let mark = active.mark();
        let first = active
            .append_batch(records, now)
            .with_context(|| format!("append to topic {} segment {}", self.name, active.base_offset()))?;
        Ok((Appended { first, next: first + records.len() as u64, rotated }, active, mark))
    }

    #[inline]
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn fail_next_flush(&self) {
        self.fail_flush.store(true, Ordering::Release);
    }

    fn rotate(&self, old: &Arc<Segment>) -> Result<Arc<Segment>> {
        let mut segs = self.segments.write();
        old.close()?;
        let base = old.next_offset();
        let seg = Arc::new(Segment::open(&self.dir, base, self.config.index_interval_bytes)?);
        segs.push(seg.clone());
        log::info!("topic {} rolled segment {} to new segment {}", self.name, old.base_offset(), base);
        Ok(seg)
    }

    #[inline]
    pub fn flush(&self, sync: bool) -> Result<()> {
        self.active().flush(sync)
    }

    /// Makes every offset below `end` readable and wakes waiting readers. Never moves back.
    #[inline]
    pub fn publish_visible(&self, end: Offset) {
        self.visible.send_if_modified(|v| {
            if end > *v {
                *v = end;
                true
            } else {
                false
            }
        });
    }

    /// Next offset visible to consumers.
    #[inline]
    pub fn high_water_mark(&self) -> Offset {
        *self.visible.borrow()
    }

    /// Next offset that will be assigned, including appended but not yet visible ones.
    #[inline]
    pub fn log_end_offset(&self) -> Offset {
        self.active().next_offset()
    }

    #[inline]
    pub fn log_start_offset(&self) -> Offset {
        self.segments.read()[0].base_offset()
    }

    #[inline]
    pub fn watch(&self) -> watch::Receiver<Offset> {
        self.visible.subscribe()
    }

    fn segment_for(&self, offset: Offset) -> Option<Arc<Segment>> {
        let segs = self.segments.read();
        let i = segs.partition_point(|s| s.base_offset() <= offset);
        if i == 0 {
            None
        } else {
            Some(segs[i - 1].clone())
        }
    }

    pub fn read(&self, offset: Offset) -> Result<Message> {
        let mut msgs = self.read_batch(offset, 1)?;
        let start = self.log_start_offset();
        let end = self.high_water_mark();
        msgs.pop().ok_or(BrokerError::OffsetOutOfRange { offset, start, end })
    }

    /// Reads up to `max` visible messages starting at `offset`. Reading at the high-water
    /// mark returns nothing, reading below the log start is out of range.
    pub fn read_batch(&self, offset: Offset, max: usize) -> Result<Vec<Message>> {
        let hwm = self.high_water_mark();
        let start = self.log_start_offset();
        if offset < start || offset > hwm {
            return Err(BrokerError::OffsetOutOfRange { offset, start, end: hwm });
        }
        let mut msgs = Vec::new();
        let mut next = offset;
        while next < hwm && msgs.len() < max {
            let seg = self
                .segment_for(next)
                .ok_or(BrokerError::OffsetOutOfRange { offset: next, start: self.log_start_offset(), end: hwm })?;
            let batch = seg
                .read_batch(next, max - msgs.len(), hwm)
                .with_context(|| format!("read topic {} segment {}", self.name, seg.base_offset()))?;
            match batch.last() {
                Some(last) => next = last.offset + 1,
                None => break,
            }
            msgs.extend(batch);
        }
        for m in msgs.iter_mut() {
            m.topic = self.name.clone();
        }
        Ok(msgs)
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments.read().iter().map(|s| s.info()).collect()
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.segments.read().iter().map(|s| s.size()).sum()
    }

    /// Deletes the oldest read-only segments `policy` retires, never the active one.
    /// Returns the number of deleted segments.
    pub fn apply_retention(&self, policy: &dyn RetentionPolicy, now: TimestampMillis) -> Result<usize> {
        let removed = {
            let mut segs = self.segments.write();
            let infos: Vec<SegmentInfo> = segs[..segs.len() - 1].iter().map(|s| s.info()).collect();
            if infos.is_empty() {
                return Ok(0);
            }
            let total = segs.iter().map(|s| s.size()).sum();
            let n = policy.retire(&self.config, &infos, total, now).min(infos.len());
            segs.drain(..n).collect::<Vec<_>>()
        };
        for s in &removed {
            s.delete()?;
        }
        if !removed.is_empty() {
            log::info!(
                "topic {} retention removed {} segment(s), log start offset is now {}",
                self.name,
                removed.len(),
                self.log_start_offset()
            );
        }
        Ok(removed.len())
    }

    /// Flushes and fsyncs the active segment and makes it read-only.
    pub fn close(&self) -> Result<()> {
        self.active().close()
    }

    /// Removes the topic directory with all segments.
    pub fn destroy(&self) -> Result<()> {
        {
            let segs = self.segments.read();
            for s in segs.iter() {
                s.seal();
            }
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BrokerError::from(e).context(format!("remove topic directory {:?}", self.dir))),
        }
    }
}
