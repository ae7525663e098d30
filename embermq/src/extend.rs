use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::assign::Assignor;
use crate::replication::{DefaultReplicator, Replicator};
use crate::retention::{DefaultRetentionPolicy, RetentionPolicy};

/// Pluggable strategies of a broker. Replace one through the `*_mut` accessors before
/// the broker starts taking traffic.
pub struct Manager {
    assignor: RwLock<Box<dyn Assignor>>,
    retention: RwLock<Box<dyn RetentionPolicy>>,
    replicator: RwLock<Arc<dyn Replicator>>,
}

impl Manager {
    #[inline]
    pub(crate) fn new(assignor: Box<dyn Assignor>) -> Self {
        Self {
            assignor: RwLock::new(assignor),
            retention: RwLock::new(Box::new(DefaultRetentionPolicy)),
            replicator: RwLock::new(Arc::new(DefaultReplicator)),
        }
    }

    #[inline]
    pub async fn assignor(&self) -> RwLockReadGuard<'_, Box<dyn Assignor>> {
        self.assignor.read().await
    }

    #[inline]
    pub async fn assignor_mut(&self) -> RwLockWriteGuard<'_, Box<dyn Assignor>> {
        self.assignor.write().await
    }

    #[inline]
    pub async fn retention(&self) -> RwLockReadGuard<'_, Box<dyn RetentionPolicy>> {
        self.retention.read().await
    }

    #[inline]
    pub async fn retention_mut(&self) -> RwLockWriteGuard<'_, Box<dyn RetentionPolicy>> {
        self.retention.write().await
    }

    #[inline]
    pub async fn replicator(&self) -> Arc<dyn Replicator> {
        self.replicator.read().await.clone()
    }

    #[inline]
    pub async fn replicator_mut(&self) -> RwLockWriteGuard<'_, Arc<dyn Replicator>> {
        self.replicator.write().await
    }
}
