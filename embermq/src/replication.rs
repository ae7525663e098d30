use async_trait::async_trait;

use crate::types::{Offset, TopicName};
use crate::{BrokerError, Result};

/// Copies appended records to replicas. Publishes with [`crate::types::AckLevel::Replicated`]
/// wait until `replicate` returns, bounded by `replication.ack_timeout`.
#[async_trait]
pub trait Replicator: Sync + Send {
    /// Returns once `replicas` replicas hold the offsets `[start, end)` of `topic`.
    async fn replicate(&self, topic: &TopicName, start: Offset, end: Offset, replicas: usize) -> Result<()>;
}

/// Single node broker. Acknowledges only when no replica is asked for.
pub struct DefaultReplicator;

#[async_trait]
impl Replicator for DefaultReplicator {
    #[inline]
    async fn replicate(&self, topic: &TopicName, start: Offset, end: Offset, replicas: usize) -> Result<()> {
        if replicas == 0 {
            return Ok(());
        }
        log::warn!("{} [{}, {}) needs {} replica(s), no replicator is installed", topic, start, end, replicas);
        Err(BrokerError::ReplicasUnavailable(replicas))
    }
}
