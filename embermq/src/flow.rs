//! Bounded ingress path of a topic, between "accepted" and "durably appended".
//!
//! Publishers reserve buffer capacity from a semaphore, push their records onto a
//! lock-free queue and, depending on the ack level, wait for the reply of the topic's
//! single writer task. The writer drains the queue in batches, appends them to the
//! [`TopicLog`], flushes, waits for replication when asked to and only then makes the
//! batch visible. Capacity is released once a record is appended, so a stalled disk
//! turns into [`BrokerError::Backpressure`] for new publishers instead of memory growth.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam::queue::SegQueue;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::BrokerContext;
use crate::topic::{Appended, TopicLog};
use crate::types::{AckLevel, Deadline, Offset, Record, TopicName};
use crate::utils::timestamp_millis;
use crate::{BrokerError, Result};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Ingress rate limit, `burst` records per `replenish_n_per`.
pub struct Limiter {
    l: DirectLimiter,
}

impl Limiter {
    #[inline]
    pub fn new(burst: NonZeroU32, replenish_n_per: Duration) -> Result<Self> {
        if replenish_n_per.as_nanos() == 0 {
            return Err(BrokerError::InvalidConfig("flow.rate_period must be greater than 0".into()));
        }
        let period = replenish_n_per.as_nanos() as u64 / burst.get() as u64;
        let period = if period > 0 { Duration::from_nanos(period) } else { Duration::from_nanos(1) };
        log::debug!("burst: {:?}, {:?}, {:?}", burst, replenish_n_per, period);
        let q = Quota::with_period(period).ok_or_else(|| anyhow!("period is 0"))?.allow_burst(burst);
        let l = RateLimiter::direct(q);
        Ok(Self { l })
    }

    /// Waits until `n` records may pass. Fails at once if `n` exceeds the burst.
    #[inline]
    async fn until_n_ready(&self, topic: &TopicName, n: usize) -> Result<()> {
        let n = u32::try_from(n).ok().and_then(NonZeroU32::new).ok_or_else(|| BrokerError::Backpressure(topic.clone()))?;
        self.l.until_n_ready(n).await.map_err(|_| BrokerError::Backpressure(topic.clone()))
    }
}

struct Pending {
    records: Vec<Record>,
    count: usize,
    ack: AckLevel,
    reply: Option<oneshot::Sender<Result<Offset>>>,
    _permit: OwnedSemaphorePermit,
}

impl Pending {
    #[inline]
    fn len(&self) -> u64 {
        self.count as u64
    }

    #[inline]
    fn reply(&mut self, res: Result<Offset>) {
        if let Some(tx) = self.reply.take() {
            //the publisher may have given up waiting
            let _ = tx.send(res);
        }
    }
}

struct Shared {
    topic: TopicName,
    queue: SegQueue<Pending>,
    permits: Arc<Semaphore>,
    capacity: usize,
    notify: Notify,
    closed: CancellationToken,
}

pub struct FlowController {
    ctx: BrokerContext,
    shared: Arc<Shared>,
    limiter: Option<Limiter>,
    writer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("topic", &self.shared.topic)
            .field("capacity", &self.shared.capacity)
            .field("buffered", &self.buffered())
            .finish()
    }
}

impl FlowController {
    /// Spawns the writer task of `log`.
    pub fn start(ctx: BrokerContext, log: Arc<TopicLog>) -> Result<Self> {
        let flow = &ctx.settings.flow;
        let capacity = flow.buffer_capacity.min(Semaphore::MAX_PERMITS).min(u32::MAX as usize);
        let limiter = match NonZeroU32::new(flow.rate_limit) {
            Some(burst) => Some(Limiter::new(burst, flow.rate_period)?),
            None => None,
        };
        let shared = Arc::new(Shared {
            topic: log.name().clone(),
            queue: SegQueue::new(),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            notify: Notify::new(),
            closed: CancellationToken::new(),
        });
        let writer = Writer { ctx: ctx.clone(), shared: shared.clone(), log };
        let handle = tokio::spawn(writer.run());
        Ok(Self { ctx, shared, limiter, writer: parking_lot::Mutex::new(Some(handle)) })
    }

    #[inline]
    pub fn topic(&self) -> &TopicName {
        &self.shared.topic
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Records accepted but not yet appended.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.shared.capacity.saturating_sub(self.shared.permits.available_permits())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Accepts `records` as one unit and returns the offset of the first one.
    ///
    /// With [`AckLevel::None`] this returns `Ok(None)` as soon as the records are
    /// buffered. Otherwise it waits for the append (and the replication, for
    /// [`AckLevel::Replicated`]). Waiting for buffer space past the deadline fails with
    /// [`BrokerError::Backpressure`], waiting for the append with [`BrokerError::Timeout`].
    /// An empty batch is accepted and returns `Ok(None)`.
    pub async fn publish(&self, records: Vec<Record>, ack: AckLevel, deadline: &Deadline) -> Result<Option<Offset>> {
        if records.is_empty() {
            return Ok(None);
        }
        if self.is_closed() {
            return Err(BrokerError::ShuttingDown);
        }
        let n = records.len();
        let topic = &self.shared.topic;
        if n > self.shared.capacity {
            self.ctx.stats.backpressures.inc();
            return Err(BrokerError::Backpressure(topic.clone()));
        }

        if let Some(limiter) = self.limiter.as_ref() {
            deadline
                .run(limiter.until_n_ready(topic, n), || BrokerError::Backpressure(topic.clone()))
                .await
                .inspect_err(|_| self.ctx.stats.backpressures.inc())?;
        }

        let permits = self.shared.permits.clone();
        let permit = deadline
            .run(
                async move { permits.acquire_many_owned(n as u32).await.map_err(|_| BrokerError::ShuttingDown) },
                || BrokerError::Backpressure(topic.clone()),
            )
            .await
            .inspect_err(|e| {
                if matches!(e, BrokerError::Backpressure(_)) {
                    self.ctx.stats.backpressures.inc();
                    log::debug!("{} publish of {} record(s) rejected, buffer is full", topic, n);
                }
            })?;

        let (reply, rx) = if ack == AckLevel::None {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        self.shared.queue.push(Pending { records, count: n, ack, reply, _permit: permit });
        self.ctx.stats.ingress_buffered.incs(n as isize);
        self.shared.notify.notify_one();

        match rx {
            None => Ok(None),
            Some(rx) => {
                let res = deadline
                    .run(async move { rx.await.map_err(|_| BrokerError::ShuttingDown)? }, || BrokerError::Timeout)
                    .await?;
                Ok(Some(res))
            }
        }
    }

    /// Stops accepting records and waits until the writer appended everything buffered.
    pub async fn close(&self) {
        self.shared.permits.close();
        self.shared.closed.cancel();
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("{} flow writer exited abnormally, {:?}", self.shared.topic, e);
            }
        }
    }
}

impl Drop for FlowController {
    fn drop(&mut self) {
        self.shared.permits.close();
        self.shared.closed.cancel();
    }
}

struct Writer {
    ctx: BrokerContext,
    shared: Arc<Shared>,
    log: Arc<TopicLog>,
}

impl Writer {
    async fn run(self) {
        let flow = &self.ctx.settings.flow;
        let (batch_max, linger) = (flow.batch_max, flow.linger);
        log::debug!("{} flow writer started, batch_max: {}, linger: {:?}", self.shared.topic, batch_max, linger);
        loop {
            if self.shared.queue.is_empty() {
                if self.shared.closed.is_cancelled() {
                    //a publisher may still hold permits it has not pushed yet
                    if self.shared.permits.available_permits() >= self.shared.capacity {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                tokio::select! {
                    _ = self.shared.notify.notified() => {},
                    _ = self.shared.closed.cancelled() => {},
                }
                continue;
            }

            if !linger.is_zero() && self.shared.queue.len() < batch_max && !self.shared.closed.is_cancelled() {
                tokio::time::sleep(linger).await;
            }

            let mut batch = Vec::new();
            let mut count = 0;
            while count < batch_max {
                match self.shared.queue.pop() {
                    Some(p) => {
                        count += p.records.len();
                        batch.push(p);
                    }
                    None => break,
                }
            }
            self.write(batch, count).await;
        }
        log::debug!("{} flow writer exited", self.shared.topic);
    }

    async fn write(&self, mut batch: Vec<Pending>, count: usize) {
        let topic = &self.shared.topic;
        let sync = batch.iter().any(|p| p.ack.needs_sync());
        let replicate = batch.iter().any(|p| p.ack == AckLevel::Replicated);
        let records = batch.iter_mut().flat_map(|p| std::mem::take(&mut p.records)).collect::<Vec<_>>();

        let log = self.log.clone();
        let res = tokio::task::spawn_blocking(move || log.append_durable(&records, timestamp_millis(), sync))
        .await
        .map_err(|e| BrokerError::from(anyhow!(e)))
        .and_then(|r| r);
        self.ctx.stats.ingress_buffered.decs(count as isize);

        let appended = match res {
            Ok(appended) => appended,
            Err(e) => {
                log::error!("{} failed to append {} record(s), {}", topic, count, e);
                self.ctx.stats.publish_errors.incs(count as isize);
                let source = Arc::new(e);
                for p in batch.iter_mut() {
                    p.reply(Err(BrokerError::Storage {
                        context: format!("append to topic {}", topic),
                        source: source.clone(),
                    }));
                }
                return;
            }
        };
        self.ctx.stats.appended_batches.inc();
        self.ctx.stats.publishes.incs(count as isize);
        if appended.rotated {
            self.ctx.stats.rotations.inc();
        }

        let replicated = if replicate { self.replicate(&appended).await } else { Ok(()) };
        self.log.publish_visible(appended.next);

        let mut offset = appended.first;
        for p in batch.iter_mut() {
            let first = offset;
            offset += p.len();
            let res = match (&replicated, p.ack) {
                (Err(e), AckLevel::Replicated) => Err(e.to_error(topic)),
                _ => Ok(first),
            };
            p.reply(res);
        }
    }

    async fn replicate(&self, appended: &Appended) -> std::result::Result<(), ReplicationFailure> {
        let cfg = &self.ctx.settings.replication;
        let replicator = self.ctx.extends.replicator().await;
        let topic = &self.shared.topic;
        match tokio::time::timeout(
            cfg.ack_timeout,
            replicator.replicate(topic, appended.first, appended.next, cfg.replicas),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                log::warn!("{} replication of [{}, {}) failed, {}", topic, appended.first, appended.next, e);
                Err(ReplicationFailure::Failed(Arc::new(e)))
            }
            Err(_) => {
                log::warn!(
                    "{} replication of [{}, {}) not acknowledged within {:?}",
                    topic,
                    appended.first,
                    appended.next,
                    cfg.ack_timeout
                );
                Err(ReplicationFailure::Timeout(cfg.ack_timeout))
            }
        }
    }
}

enum ReplicationFailure {
    Timeout(Duration),
    Failed(Arc<BrokerError>),
}

impl ReplicationFailure {
    fn to_error(&self, topic: &TopicName) -> BrokerError {
        match self {
            ReplicationFailure::Timeout(d) => BrokerError::ReplicationTimeout(*d),
            ReplicationFailure::Failed(e) => {
                BrokerError::Storage { context: format!("replicate topic {}", topic), source: e.clone() }
            }
        }
    }
}
