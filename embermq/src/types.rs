use std::convert::TryFrom;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conf::Settings;
use crate::error::BrokerError;
use crate::utils::{format_timestamp_millis, timestamp_millis};

pub use crate::utils::TimestampMillis;

pub type Offset = u64;
pub type TopicName = ByteString;
pub type GroupName = ByteString;
pub type ConsumerId = ByteString;
pub type Generation = u64;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// A message as handed to the broker by a producer, before it has an offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: TimestampMillis,
}

impl Record {
    #[inline]
    pub fn new(key: Option<Bytes>, payload: Bytes) -> Self {
        Self { key, payload, timestamp: timestamp_millis() }
    }

    #[inline]
    pub fn with_timestamp(mut self, timestamp: TimestampMillis) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Bytes of key and payload, used for rate and buffer accounting.
    #[inline]
    pub fn size(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or_default() + self.payload.len()
    }
}

/// A message stored in a topic log. Immutable once written.
///
/// The topic is implied by the log a message lives in and is not part of the
/// stored record; it is filled in when the message is read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub offset: Offset,
    pub timestamp: TimestampMillis,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    #[serde(skip)]
    pub topic: TopicName,
}

impl Message {
    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "topic": self.topic,
            "offset": self.offset,
            "timestamp": format_timestamp_millis(self.timestamp),
            "key_len": self.key.as_ref().map(|k| k.len()),
            "payload_len": self.payload.len(),
        })
    }
}

/// A message handed to one member of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: TopicName,
    pub offset: Offset,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: TimestampMillis,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

impl Delivery {
    #[inline]
    pub fn new(msg: Message, attempt: u32) -> Self {
        Self {
            topic: msg.topic,
            offset: msg.offset,
            key: msg.key,
            payload: msg.payload,
            timestamp: msg.timestamp,
            attempt,
        }
    }

    #[inline]
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// Durability a publisher waits for before its publish returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AckLevel {
    /// Return once the message is accepted into the ingress buffer.
    None = 0,
    /// Return once the message is appended, flushed and fsynced.
    Local = 1,
    /// Additionally wait for the replicator to acknowledge.
    Replicated = 2,
}

impl AckLevel {
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn needs_sync(&self) -> bool {
        *self >= AckLevel::Local
    }
}

impl TryFrom<u8> for AckLevel {
    type Error = BrokerError;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(AckLevel::None),
            1 => Ok(AckLevel::Local),
            2 => Ok(AckLevel::Replicated),
            _ => Err(BrokerError::InvalidAckLevel(v)),
        }
    }
}

impl fmt::Display for AckLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Bounds a blocking operation in time and lets the caller abort it.
#[derive(Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deadline")
            .field("remaining", &self.remaining())
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl Deadline {
    /// Wait without a time limit.
    #[inline]
    pub fn none() -> Self {
        Self::default()
    }

    #[inline]
    pub fn after(timeout: Duration) -> Self {
        Self { at: Some(Instant::now() + timeout), cancel: None }
    }

    #[inline]
    pub fn at(at: Instant) -> Self {
        Self { at: Some(at), cancel: None }
    }

    #[inline]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[inline]
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    #[inline]
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        matches!(self.at, Some(at) if at <= Instant::now())
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or_default()
    }

    /// Resolves when the deadline passes, never if there is none.
    pub async fn expired(&self) {
        match self.at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => futures::future::pending::<()>().await,
        }
    }

    /// Resolves when the caller cancels, never without a token.
    pub async fn cancelled(&self) {
        match self.cancel.as_ref() {
            Some(token) => token.cancelled().await,
            None => futures::future::pending::<()>().await,
        }
    }

    /// Drives `fut` to completion unless the deadline passes first, in which case
    /// `on_expired` supplies the error.
    pub async fn run<F, T, E>(&self, fut: F, on_expired: E) -> crate::Result<T>
    where
        F: std::future::Future<Output = crate::Result<T>>,
        E: FnOnce() -> BrokerError,
    {
        if self.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }
        tokio::select! {
            biased;
            res = fut => res,
            _ = self.cancelled() => Err(BrokerError::Cancelled),
            _ = self.expired() => Err(on_expired()),
        }
    }
}

/// Per-topic storage configuration, persisted as `topic.json` in the topic directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub segment_bytes: u64,
    pub segment_ms: u64,
    pub index_interval_bytes: u64,
    #[serde(default)]
    pub retention_bytes: u64,
    #[serde(default)]
    pub retention_ms: u64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl TopicConfig {
    #[inline]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            segment_bytes: settings.storage.segment_bytes.as_u64(),
            segment_ms: settings.storage.segment_ms.as_millis() as u64,
            index_interval_bytes: settings.storage.index_interval_bytes.as_u64(),
            retention_bytes: settings.storage.retention_bytes.as_u64(),
            retention_ms: settings.storage.retention_ms.as_millis() as u64,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.segment_bytes == 0 {
            return Err(BrokerError::InvalidConfig("segment_bytes must be greater than 0".into()));
        }
        if self.index_interval_bytes == 0 {
            return Err(BrokerError::InvalidConfig("index_interval_bytes must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Snapshot of one segment, input to retention decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub base_offset: Offset,
    pub next_offset: Offset,
    pub size: u64,
    pub created_at: TimestampMillis,
    /// Wall-clock time of the latest append, `created_at` while empty.
    pub last_append: TimestampMillis,
    pub read_only: bool,
}

impl SegmentInfo {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.next_offset == self.base_offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Joining,
    Active,
    Leaving,
    Failed,
}

impl MemberState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, MemberState::Leaving | MemberState::Failed)
    }

    /// Legal moves are `Joining -> Active` and from either of those into a terminal state.
    #[inline]
    pub fn can_move_to(&self, to: MemberState) -> bool {
        matches!(
            (self, to),
            (MemberState::Joining, MemberState::Active)
                | (MemberState::Joining | MemberState::Active, MemberState::Leaving | MemberState::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub consumer_id: ConsumerId,
    pub state: MemberState,
    pub inflight: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub topic: TopicName,
    pub group: GroupName,
    pub generation: Generation,
    pub members: Vec<MemberInfo>,
    pub cursor: Option<Offset>,
    pub redeliveries: usize,
    pub committed: Option<Offset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub name: TopicName,
    pub config: TopicConfig,
    pub log_start_offset: Offset,
    pub high_water_mark: Offset,
    pub segments: usize,
    pub size: u64,
    pub buffered: usize,
}
