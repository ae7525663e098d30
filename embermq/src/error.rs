use std::sync::Arc;
use std::time::Duration;

use crate::types::{ConsumerId, Offset, TopicName};

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retrying later may succeed.
    Transient,
    /// Retrying will not help, the data or configuration must change.
    Permanent,
    /// The request itself is wrong.
    Caller,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("ingress buffer of topic {0} is full")]
    Backpressure(TopicName),

    #[error("operation timed out")]
    Timeout,

    #[error("replication not acknowledged within {0:?}")]
    ReplicationTimeout(Duration),

    #[error("{0} replica acknowledgement(s) required, no replicator is installed")]
    ReplicasUnavailable(usize),

    #[error("operation cancelled")]
    Cancelled,

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error("io error, {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted record in segment {segment} at position {position}")]
    Corrupted { segment: Offset, position: u64 },

    #[error("offset {offset} out of range [{start}, {end})")]
    OffsetOutOfRange { offset: Offset, start: Offset, end: Offset },

    #[error("topic {0} already exists with a different configuration")]
    TopicConfigConflict(TopicName),

    #[error("codec error, {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error, {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid topic name {0:?}, {1}")]
    InvalidTopic(String, &'static str),

    #[error("invalid ack level {0}, expected 0, 1 or 2")]
    InvalidAckLevel(u8),

    #[error("invalid offset {offset}, high water mark is {high_water_mark}")]
    InvalidOffset { offset: Offset, high_water_mark: Offset },

    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    #[error("consumer {0} is already active in the group")]
    ConsumerExists(ConsumerId),

    #[error("topic {0} not found")]
    TopicNotFound(TopicName),

    #[error("invalid config, {0}")]
    InvalidConfig(String),

    #[error("{context}, {source}")]
    Storage {
        context: String,
        #[source]
        source: Arc<BrokerError>,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl BrokerError {
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Backpressure(_)
            | BrokerError::Timeout
            | BrokerError::ReplicationTimeout(_)
            | BrokerError::ReplicasUnavailable(_)
            | BrokerError::Cancelled
            | BrokerError::ShuttingDown
            | BrokerError::Io(_) => ErrorKind::Transient,
            BrokerError::Corrupted { .. }
            | BrokerError::OffsetOutOfRange { .. }
            | BrokerError::TopicConfigConflict(_)
            | BrokerError::Codec(_)
            | BrokerError::Json(_)
            | BrokerError::Anyhow(_) => ErrorKind::Permanent,
            BrokerError::InvalidTopic(..)
            | BrokerError::InvalidAckLevel(_)
            | BrokerError::InvalidOffset { .. }
            | BrokerError::UnknownConsumer(_)
            | BrokerError::ConsumerExists(_)
            | BrokerError::TopicNotFound(_)
            | BrokerError::InvalidConfig(_) => ErrorKind::Caller,
            BrokerError::Storage { source, .. } => source.kind(),
        }
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Wraps the error with what the broker was doing when it happened.
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        BrokerError::Storage { context: context.into(), source: Arc::new(self) }
    }
}

pub trait ResultExt<T> {
    fn with_context<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<BrokerError>,
{
    #[inline]
    fn with_context<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_context_keeps_kind() {
        let e: std::io::Result<()> = Err(std::io::Error::other("disk gone"));
        let e = e.with_context(|| "append to segment 0 of topic t").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.to_string().starts_with("append to segment 0 of topic t"));

        let e = BrokerError::Corrupted { segment: 0, position: 12 }.context("read");
        assert_eq!(e.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn caller_errors() {
        assert_eq!(BrokerError::InvalidAckLevel(9).kind(), ErrorKind::Caller);
        assert_eq!(BrokerError::TopicNotFound("t".into()).kind(), ErrorKind::Caller);
        assert!(BrokerError::Backpressure("t".into()).is_transient());
    }
}
