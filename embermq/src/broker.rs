use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;

use crate::conf::Settings;
use crate::context::BrokerContext;
use crate::flow::FlowController;
use crate::group::GroupCoordinator;
use crate::offset::OffsetTracker;
use crate::stats::Stats;
use crate::subscribe::Subscription;
use crate::topic::{self, TopicLog};
use crate::types::{
    AckLevel, ConsumerId, Deadline, GroupInfo, GroupName, HashMap, Offset, Record, TopicConfig, TopicInfo,
    TopicName,
};
use crate::utils::timestamp_millis;
use crate::{BrokerError, Result};

/// A topic's log together with its ingress path.
pub struct Topic {
    name: TopicName,
    log: Arc<TopicLog>,
    flow: FlowController,
}

impl Topic {
    #[inline]
    pub fn name(&self) -> &TopicName {
        &self.name
    }

    #[inline]
    pub fn log(&self) -> &Arc<TopicLog> {
        &self.log
    }

    #[inline]
    pub fn config(&self) -> &TopicConfig {
        self.log.config()
    }

    pub fn info(&self) -> TopicInfo {
        TopicInfo {
            name: self.name.clone(),
            config: self.log.config().clone(),
            log_start_offset: self.log.log_start_offset(),
            high_water_mark: self.log.high_water_mark(),
            segments: self.log.segments().len(),
            size: self.log.size(),
            buffered: self.flow.buffered(),
        }
    }
}

type TopicSlot = Arc<OnceCell<Arc<Topic>>>;

/// The embeddable broker. Cheap to clone, every clone talks to the same instance.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

pub struct BrokerInner {
    ctx: BrokerContext,
    data_dir: PathBuf,
    topics: RwLock<HashMap<TopicName, TopicSlot>>,
    offsets: Arc<OffsetTracker>,
    groups: GroupCoordinator,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Deref for Broker {
    type Target = BrokerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Broker {:?}", self.data_dir)
    }
}

impl Broker {
    /// Opens the broker stored under `storage.data_dir`. Must be called within a tokio
    /// runtime, the background tasks start right away.
    pub fn open(settings: Settings) -> Result<Self> {
        Self::with_context(BrokerContext::new(settings)?)
    }

    pub fn with_context(ctx: BrokerContext) -> Result<Self> {
        let data_dir = ctx.settings.storage.data_dir.clone();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| BrokerError::from(e).context(format!("create data directory {data_dir:?}")))?;
        let cfg = &ctx.settings.offsets;
        let offsets = Arc::new(OffsetTracker::open(&data_dir, cfg.sync_on_commit, cfg.compact_threshold)?);
        let groups = GroupCoordinator::new(ctx.clone(), offsets.clone());
        let broker = Broker {
            inner: Arc::new(BrokerInner {
                ctx,
                data_dir,
                topics: RwLock::new(HashMap::default()),
                offsets,
                groups,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        };
        broker.start_tasks();
        log::info!("broker opened in {:?}", broker.data_dir);
        Ok(broker)
    }

    #[inline]
    pub fn context(&self) -> &BrokerContext {
        &self.ctx
    }

    #[inline]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.ctx.stats
    }

    #[inline]
    pub(crate) fn groups(&self) -> &GroupCoordinator {
        &self.groups
    }

    #[inline]
    fn topic_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    #[inline]
    fn check_running(&self) -> Result<()> {
        if self.ctx.is_shutdown() {
            Err(BrokerError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Returns the topic, opening it from disk or creating it as needed. Concurrent
    /// callers share one initialization.
    async fn get_or_create(&self, name: &TopicName, config: Option<&TopicConfig>) -> Result<Arc<Topic>> {
        topic::validate_topic_name(name)?;
        let slot = self.topics.read().await.get(name).cloned();
        let slot = match slot {
            Some(slot) => slot,
            None => self.topics.write().await.entry(name.clone()).or_default().clone(),
        };
        let topic = slot.get_or_try_init(|| async { self.load_topic(name, config) }).await?;
        Ok(topic.clone())
    }

    fn load_topic(&self, name: &TopicName, config: Option<&TopicConfig>) -> Result<Arc<Topic>> {
        let dir = self.topic_dir(name);
        let config = match topic::load_config(&dir)? {
            Some(stored) => stored,
            None => {
                let config = config.cloned().unwrap_or_else(|| TopicConfig::from_settings(&self.ctx.settings));
                config.validate()?;
                std::fs::create_dir_all(&dir)
                    .map_err(|e| BrokerError::from(e).context(format!("create topic directory {dir:?}")))?;
                topic::save_config(&dir, &config)?;
                log::info!("topic {} created, {:?}", name, config);
                config
            }
        };
        let log = Arc::new(TopicLog::open(name.clone(), dir, config)?);
        let flow = FlowController::start(self.ctx.clone(), log.clone())?;
        self.ctx.stats.topics.inc();
        Ok(Arc::new(Topic { name: name.clone(), log, flow }))
    }

    /// Loaded topic, or a topic that exists on disk. Never creates one.
    async fn topic(&self, name: &TopicName) -> Result<Option<Arc<Topic>>> {
        if let Some(topic) = self.topics.read().await.get(name).and_then(|slot| slot.get().cloned()) {
            return Ok(Some(topic));
        }
        if topic::validate_topic_name(name).is_err() || !self.topic_dir(name).join(topic::TOPIC_CONFIG_FILE).exists()
        {
            return Ok(None);
        }
        self.get_or_create(name, None).await.map(Some)
    }

    #[inline]
    async fn existing_topic(&self, name: &TopicName) -> Result<Arc<Topic>> {
        self.topic(name).await?.ok_or_else(|| BrokerError::TopicNotFound(name.clone()))
    }

    /// Creates `name` with `config`. Succeeds without change if the topic already has
    /// exactly this configuration.
    pub async fn create_topic(&self, name: &TopicName, config: TopicConfig) -> Result<()> {
        self.check_running()?;
        config.validate()?;
        let topic = self.get_or_create(name, Some(&config)).await?;
        if topic.config() != &config {
            return Err(BrokerError::TopicConfigConflict(name.clone()));
        }
        Ok(())
    }

    /// Publishes one message, creating the topic on first use. See
    /// [`Broker::publish_batch`] for the meaning of `ack`.
    pub async fn publish(
        &self,
        topic: &TopicName,
        key: Option<Bytes>,
        payload: Bytes,
        ack: AckLevel,
        deadline: &Deadline,
    ) -> Result<Option<Offset>> {
        self.publish_batch(topic, vec![Record::new(key, payload)], ack, deadline).await
    }

    /// Publishes `records` as one unit and returns the offset of the first one.
    ///
    /// * [`AckLevel::None`] returns `None` once the records are buffered.
    /// * [`AckLevel::Local`] returns after the records are appended and fsynced.
    /// * [`AckLevel::Replicated`] also waits for the replicator, up to
    ///   `replication.ack_timeout`.
    pub async fn publish_batch(
        &self,
        topic: &TopicName,
        records: Vec<Record>,
        ack: AckLevel,
        deadline: &Deadline,
    ) -> Result<Option<Offset>> {
        self.check_running()?;
        let topic = self.get_or_create(topic, None).await?;
        topic.flow.publish(records, ack, deadline).await
    }

    /// Joins `group` on `topic`, creating either on first use. An empty `consumer_id`
    /// is replaced by a generated one.
    pub async fn subscribe(
        &self,
        topic: &TopicName,
        group: &GroupName,
        consumer_id: &str,
        deadline: &Deadline,
    ) -> Result<Subscription> {
        self.check_running()?;
        if group.is_empty() {
            return Err(BrokerError::InvalidConfig("group name is empty".into()));
        }
        let consumer_id = if consumer_id.is_empty() {
            ConsumerId::from(uuid::Uuid::new_v4().to_string())
        } else {
            ConsumerId::from(consumer_id)
        };
        let topic = deadline.run(self.get_or_create(topic, None), || BrokerError::Timeout).await?;
        let handle = self.groups.join(topic.log(), group, &consumer_id)?;
        Ok(Subscription::new(self.clone(), topic, group.clone(), consumer_id, handle))
    }

    /// Records `offset` as the last message `group` processed on `topic` and
    /// acknowledges everything up to it. Returns `false` if an equal or higher offset was
    /// already committed.
    pub async fn commit(&self, topic: &TopicName, group: &GroupName, offset: Offset) -> Result<bool> {
        let t = self.existing_topic(topic).await?;
        let high_water_mark = t.log.high_water_mark();
        if offset >= high_water_mark {
            return Err(BrokerError::InvalidOffset { offset, high_water_mark });
        }
        let advanced = self.offsets.commit(topic, group, offset)?;
        if advanced {
            self.ctx.stats.commits.inc();
        }
        self.groups.ack(topic, group, offset);
        Ok(advanced)
    }

    #[inline]
    pub fn committed(&self, topic: &TopicName, group: &GroupName) -> Option<Offset> {
        self.offsets.fetch_committed(topic, group)
    }

    pub async fn high_water_mark(&self, topic: &TopicName) -> Result<Offset> {
        Ok(self.existing_topic(topic).await?.log.high_water_mark())
    }

    /// Loaded topics, sorted by name.
    pub async fn topics(&self) -> Vec<TopicInfo> {
        let mut infos: Vec<TopicInfo> =
            self.topics.read().await.values().filter_map(|slot| slot.get()).map(|t| t.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    #[inline]
    pub fn groups_info(&self) -> Vec<GroupInfo> {
        self.groups.groups()
    }

    /// Deletes the topic with its data, groups and committed offsets.
    pub async fn delete_topic(&self, name: &TopicName) -> Result<bool> {
        topic::validate_topic_name(name)?;
        let mut topics = self.topics.write().await;
        let loaded = topics.remove(name).and_then(|slot| slot.get().cloned());
        let dir = self.topic_dir(name);
        let existed = match loaded {
            Some(topic) => {
                topic.flow.close().await;
                topic.log.destroy()?;
                self.ctx.stats.topics.dec();
                true
            }
            None if dir.exists() => {
                std::fs::remove_dir_all(&dir)
                    .map_err(|e| BrokerError::from(e).context(format!("remove topic directory {dir:?}")))?;
                true
            }
            None => false,
        };
        drop(topics);
        self.groups.remove_topic(name);
        self.offsets.delete_topic(name)?;
        if existed {
            log::info!("topic {} deleted", name);
        }
        Ok(existed)
    }

    /// Removes the group's members and its committed offset.
    pub fn delete_group(&self, topic: &TopicName, group: &GroupName) -> Result<bool> {
        let removed = self.groups.remove_group(topic, group);
        let forgotten = self.offsets.delete(topic, group)?;
        Ok(removed || forgotten)
    }

    /// Runs the retention policy over every loaded topic, returns the number of deleted
    /// segments.
    pub async fn apply_retention(&self) -> Result<usize> {
        let topics: Vec<Arc<Topic>> =
            self.topics.read().await.values().filter_map(|slot| slot.get().cloned()).collect();
        let policy = self.ctx.extends.retention().await;
        let now = timestamp_millis();
        let mut removed = 0;
        for t in topics {
            let n = t.log.apply_retention(&**policy, now)?;
            self.ctx.stats.retired_segments.incs(n as isize);
            removed += n;
        }
        Ok(removed)
    }

    fn start_tasks(&self) {
        let storage = &self.ctx.settings.storage;
        let consumer = &self.ctx.settings.consumer;
        let mut tasks = self.tasks.lock();
        if let Some(h) = spawn_periodic(self, "retention", storage.retention_check_interval, |broker| async move {
            if let Err(e) = broker.apply_retention().await {
                log::warn!("retention failed, {}", e);
            }
        }) {
            tasks.push(h);
        }
        if let Some(h) = spawn_periodic(self, "reaper", consumer.reap_interval, |broker| async move {
            let (expired, reclaimed) = broker.groups.reap();
            if expired > 0 || reclaimed > 0 {
                log::debug!("reaper removed {} member(s), reclaimed {} message(s)", expired, reclaimed);
            }
        }) {
            tasks.push(h);
        }
    }

    /// Stops the background tasks, appends everything still buffered and closes all
    /// segments. Later calls on any clone fail with [`BrokerError::ShuttingDown`].
    pub async fn shutdown(&self) -> Result<()> {
        if self.ctx.is_shutdown() {
            return Ok(());
        }
        self.ctx.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for h in tasks {
            if let Err(e) = h.await {
                log::warn!("background task exited abnormally, {:?}", e);
            }
        }
        let topics: Vec<Arc<Topic>> =
            self.topics.read().await.values().filter_map(|slot| slot.get().cloned()).collect();
        let mut res = Ok(());
        for t in topics {
            t.flow.close().await;
            if let Err(e) = t.log.close() {
                log::error!("topic {} close failed, {}", t.name, e);
                res = Err(e);
            }
        }
        self.offsets.sync()?;
        log::info!("broker in {:?} shut down", self.data_dir);
        res
    }
}

/// Runs `f` every `interval` until the broker shuts down or is dropped.
fn spawn_periodic<F, Fut>(broker: &Broker, name: &'static str, interval: Duration, f: F) -> Option<JoinHandle<()>>
where
    F: Fn(Broker) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if interval.is_zero() {
        log::info!("{} task disabled", name);
        return None;
    }
    let weak: Weak<BrokerInner> = Arc::downgrade(&broker.inner);
    let shutdown = broker.ctx.shutdown.clone();
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {},
            }
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            f(Broker { inner }).await;
        }
        log::debug!("{} task exited", name);
    }))
}
