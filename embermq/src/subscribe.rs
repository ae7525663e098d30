use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::watch;

use crate::broker::{Broker, Topic};
use crate::group::GroupHandle;
use crate::types::{ConsumerId, Deadline, Delivery, Generation, GroupName, Offset, TopicName};
use crate::{BrokerError, Result};

/// A consumer's membership in a group, returned by [`Broker::subscribe`].
///
/// Fetching also keeps the membership alive. A subscription that is dropped without
/// [`Subscription::leave`] stays in the group until its session times out, its
/// unacknowledged messages are then redelivered to the other members.
pub struct Subscription {
    broker: Broker,
    topic: Arc<Topic>,
    group: GroupName,
    consumer_id: ConsumerId,
    handle: Arc<GroupHandle>,
    hwm: watch::Receiver<Offset>,
    changes: watch::Receiver<u64>,
    left: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscription {}/{}/{}", self.topic.name(), self.group, self.consumer_id)
    }
}

impl Subscription {
    pub(crate) fn new(
        broker: Broker,
        topic: Arc<Topic>,
        group: GroupName,
        consumer_id: ConsumerId,
        handle: Arc<GroupHandle>,
    ) -> Self {
        let hwm = topic.log().watch();
        let changes = handle.watch();
        Self { broker, topic, group, consumer_id, handle, hwm, changes, left: false }
    }

    #[inline]
    pub fn topic(&self) -> &TopicName {
        self.topic.name()
    }

    #[inline]
    pub fn group(&self) -> &GroupName {
        &self.group
    }

    #[inline]
    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    #[inline]
    pub fn generation(&self) -> Generation {
        self.handle.generation()
    }

    /// Returns up to `max` messages, waiting until at least one is available. Fails with
    /// [`BrokerError::Timeout`] if the deadline passes while nothing is available.
    pub async fn fetch(&mut self, max: usize, deadline: &Deadline) -> Result<Vec<Delivery>> {
        let ctx = self.broker.context().clone();
        let groups = self.broker.groups();
        let max = max.max(1);
        //wake up in time to keep the session alive
        let keepalive = ctx.settings.consumer.session_timeout / 3;
        loop {
            if self.left {
                return Err(BrokerError::UnknownConsumer(self.consumer_id.clone()));
            }
            if deadline.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
            if ctx.is_shutdown() {
                return Err(BrokerError::ShuttingDown);
            }

            self.hwm.borrow_and_update();
            self.changes.borrow_and_update();
            let deliveries = groups.fetch(self.topic.log(), &self.group, &self.consumer_id, max).await?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            if deadline.is_expired() {
                return Err(BrokerError::Timeout);
            }

            tokio::select! {
                biased;
                _ = deadline.cancelled() => return Err(BrokerError::Cancelled),
                _ = ctx.shutdown.cancelled() => return Err(BrokerError::ShuttingDown),
                Ok(()) = self.hwm.changed() => {},
                Ok(()) = self.changes.changed() => {},
                _ = deadline.expired() => return Err(BrokerError::Timeout),
                _ = tokio::time::sleep(keepalive), if !keepalive.is_zero() => {},
            }
        }
    }

    #[inline]
    pub fn heartbeat(&self) -> Result<()> {
        self.broker.groups().heartbeat(self.topic.name(), &self.group, &self.consumer_id)
    }

    /// Marks everything up to and including `offset` as processed by the group.
    #[inline]
    pub async fn commit(&self, offset: Offset) -> Result<bool> {
        self.broker.commit(self.topic.name(), &self.group, offset).await
    }

    /// Leaves the group, unacknowledged messages go to the remaining members.
    pub fn leave(&mut self) -> Result<()> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        self.broker.groups().leave(self.topic.name(), &self.group, &self.consumer_id)
    }

    /// Endless stream of deliveries, fetched `consumer.fetch_max` at a time. Ends after
    /// yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Delivery>> {
        let max = self.broker.context().settings.consumer.fetch_max;
        futures::stream::unfold((self, VecDeque::new(), false), move |(mut sub, mut buf, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(d) = buf.pop_front() {
                    return Some((Ok(d), (sub, buf, false)));
                }
                match sub.fetch(max, &Deadline::none()).await {
                    Ok(ds) => buf.extend(ds),
                    Err(e) => return Some((Err(e), (sub, buf, true))),
                }
            }
        })
    }
}
