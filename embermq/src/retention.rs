use crate::types::{SegmentInfo, TimestampMillis, TopicConfig};

/// Decides which read-only segments of a topic can be deleted.
pub trait RetentionPolicy: Sync + Send {
    #[inline]
    fn name(&self) -> &'static str {
        "default"
    }

    /// `sealed` holds the read-only segments, oldest first, `total_size` includes the
    /// active segment. Returns how many of the oldest sealed segments to delete.
    fn retire(&self, config: &TopicConfig, sealed: &[SegmentInfo], total_size: u64, now: TimestampMillis) -> usize;
}

/// Time and size based retention from the topic configuration. A segment is deleted
/// once its last append is older than `retention_ms`, or while the topic holds more
/// than `retention_bytes`. Zero disables either limit.
pub struct DefaultRetentionPolicy;

impl RetentionPolicy for DefaultRetentionPolicy {
    fn retire(&self, config: &TopicConfig, sealed: &[SegmentInfo], total_size: u64, now: TimestampMillis) -> usize {
        let mut n = 0;
        if config.retention_ms > 0 {
            n = sealed.iter().take_while(|s| now.saturating_sub(s.last_append) >= config.retention_ms as i64).count();
        }
        if config.retention_bytes > 0 {
            let mut remaining = total_size.saturating_sub(sealed[..n].iter().map(|s| s.size).sum::<u64>());
            while n < sealed.len() && remaining > config.retention_bytes {
                remaining = remaining.saturating_sub(sealed[n].size);
                n += 1;
            }
        }
        n
    }
}

/// Keeps everything.
pub struct KeepAll;

impl RetentionPolicy for KeepAll {
    fn name(&self) -> &'static str {
        "keep_all"
    }

    fn retire(&self, _config: &TopicConfig, _sealed: &[SegmentInfo], _total_size: u64, _now: TimestampMillis) -> usize {
        0
    }
}
