//! Consumer groups: membership, heartbeats and the shared dispatch of a topic's messages
//! to the members of each group.
//!
//! Every group has its own dispatch cursor into the topic log, so each group sees every
//! message. Within a group a message is held by one member at a time: the
//! [`Assignor`] picks the member, the member's [`Inflight`] window keeps it until a
//! cumulative commit covers it, and messages of members that leave, fail or do not
//! commit in time go back to the group's redelivery pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use itertools::Itertools;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::assign::{Assignor, Candidate};
use crate::conf::{OffsetReset, OutOfRange};
use crate::context::BrokerContext;
use crate::inflight::{Inflight, InflightMessage, InflightStatus};
use crate::offset::OffsetTracker;
use crate::topic::TopicLog;
use crate::types::{
    ConsumerId, DashMap, Delivery, Generation, GroupInfo, GroupName, MemberInfo, MemberState, Message, Offset,
    TopicName,
};
use crate::{BrokerError, Result};

struct Member {
    state: MemberState,
    inflight: Inflight,
    last_heartbeat: Instant,
}

impl Member {
    #[inline]
    fn new(max_inflight: usize) -> Self {
        Self { state: MemberState::Joining, inflight: Inflight::new(max_inflight), last_heartbeat: Instant::now() }
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.state == MemberState::Active
    }

    #[inline]
    fn set_state(&mut self, to: MemberState) {
        if self.state.can_move_to(to) {
            self.state = to;
        } else {
            log::warn!("illegal member state transition {:?} -> {:?}", self.state, to);
        }
    }
}

/// Work handed back by departed members or expired deliveries. Keeps how many times
/// each message was delivered already.
type RedeliveryPool = BTreeMap<Offset, (Message, u32)>;

pub(crate) struct ConsumerGroup {
    topic: TopicName,
    name: GroupName,
    generation: Generation,
    members: BTreeMap<ConsumerId, Member>,
    //next log offset to dispatch, set by the first join
    cursor: Option<Offset>,
    redelivery: RedeliveryPool,
    seq: u64,
}

impl ConsumerGroup {
    fn new(topic: TopicName, name: GroupName) -> Self {
        Self {
            topic,
            name,
            generation: 0,
            members: BTreeMap::new(),
            cursor: None,
            redelivery: RedeliveryPool::new(),
            seq: 0,
        }
    }

    fn active_member(&mut self, consumer_id: &ConsumerId) -> Result<&mut Member> {
        self.members
            .get_mut(consumer_id)
            .filter(|m| m.is_active())
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer_id.clone()))
    }

    /// Activates joining members and starts a new generation.
    fn rebalance(&mut self) {
        for m in self.members.values_mut() {
            if m.state == MemberState::Joining {
                m.set_state(MemberState::Active);
            }
        }
        self.generation += 1;
        log::debug!(
            "{}/{} rebalanced, generation: {}, members: {}",
            self.topic,
            self.name,
            self.generation,
            self.members.len()
        );
    }

    /// Removes a member and returns its unacknowledged messages to the pool. Returns
    /// how many messages went back.
    fn remove_member(&mut self, consumer_id: &ConsumerId, state: MemberState) -> Option<usize> {
        let mut member = self.members.remove(consumer_id)?;
        member.set_state(state);
        let msgs = member.inflight.drain();
        let n = msgs.len();
        for m in msgs {
            self.return_to_pool(m);
        }
        Some(n)
    }

    #[inline]
    fn return_to_pool(&mut self, m: InflightMessage) {
        //a pending message was assigned but never handed out
        let delivered = match m.status {
            InflightStatus::Delivered => m.attempt,
            InflightStatus::Pending => m.attempt.saturating_sub(1),
        };
        self.redelivery.insert(m.message.offset, (m.message, delivered));
    }

    fn check_range(&mut self, log: &TopicLog, policy: OutOfRange) -> Result<()> {
        let cursor = match self.cursor {
            Some(c) => c,
            None => return Ok(()),
        };
        let start = log.log_start_offset();
        if cursor >= start {
            return Ok(());
        }
        match policy {
            OutOfRange::ResetEarliest => {
                log::warn!(
                    "{}/{} cursor {} fell below the log start {}, skipping to the log start",
                    self.topic,
                    self.name,
                    cursor,
                    start
                );
                self.cursor = Some(start);
                Ok(())
            }
            OutOfRange::Fail => {
                Err(BrokerError::OffsetOutOfRange { offset: cursor, start, end: log.high_water_mark() })
            }
        }
    }

    /// Active members and the window credit each has left.
    fn candidates(&self) -> (Vec<ConsumerId>, Vec<usize>) {
        self.members.iter().filter(|(_, m)| m.is_active()).map(|(id, m)| (id.clone(), m.inflight.credit())).unzip()
    }

    /// Assigns pooled messages to members with credit. Returns the number assigned.
    fn dispatch_pool(&mut self, assignor: &dyn Assignor) -> usize {
        let (ids, mut credit) = self.candidates();
        let mut assigned = 0;
        let pooled = self.redelivery.keys().copied().collect_vec();
        for offset in pooled {
            if credit.iter().all(|c| *c == 0) {
                break;
            }
            let idx = match self.redelivery.get(&offset) {
                Some((msg, _)) => pick(assignor, self.seq, &ids, &credit, msg),
                None => None,
            };
            if let Some(idx) = idx {
                if let Some((msg, delivered)) = self.redelivery.remove(&offset) {
                    self.assign_to(&ids[idx], msg, delivered + 1);
                    credit[idx] -= 1;
                    assigned += 1;
                }
            }
        }
        assigned
    }

    /// Where to read next from the log and how many messages the members can take,
    /// `None` when there is nothing to read or nobody to give it to.
    fn next_read(&self, hwm: Offset, read_max: usize) -> Option<(Offset, usize)> {
        let cursor = self.cursor?;
        let budget = self.candidates().1.iter().sum::<usize>().min(read_max);
        (budget > 0 && cursor < hwm).then_some((cursor, budget))
    }

    /// Assigns messages read from the log at the cursor. The group may have changed
    /// since the read, messages the cursor already passed are skipped. Returns the
    /// number assigned and whether every message read was assigned.
    fn dispatch_read(&mut self, msgs: Vec<Message>, assignor: &dyn Assignor) -> (usize, bool) {
        let mut cursor = match self.cursor {
            Some(c) => c,
            None => return (0, false),
        };
        let (ids, mut credit) = self.candidates();
        let mut assigned = 0;
        let mut all = !msgs.is_empty();
        for msg in msgs {
            if msg.offset < cursor {
                continue;
            }
            //stop at the first message nobody can take, order matters for the assignor
            let idx = match pick(assignor, self.seq, &ids, &credit, &msg) {
                Some(idx) if msg.offset == cursor => idx,
                _ => {
                    all = false;
                    break;
                }
            };
            cursor = msg.offset + 1;
            self.cursor = Some(cursor);
            self.assign_to(&ids[idx], msg, 1);
            credit[idx] -= 1;
            assigned += 1;
        }
        (assigned, all)
    }

    #[inline]
    fn assign_to(&mut self, consumer_id: &ConsumerId, msg: Message, attempt: u32) {
        self.seq += 1;
        if let Some(m) = self.members.get_mut(consumer_id) {
            m.inflight.push_back(InflightMessage::new(msg, attempt));
        }
    }

    /// Drops every message at or below `offset`, everywhere in the group.
    fn ack(&mut self, offset: Offset) -> usize {
        let mut n = 0;
        for m in self.members.values_mut() {
            n += m.inflight.ack_upto(offset);
        }
        let kept = self.redelivery.split_off(&offset.saturating_add(1));
        n += std::mem::replace(&mut self.redelivery, kept).len();
        if let Some(cursor) = self.cursor.as_mut() {
            *cursor = (*cursor).max(offset.saturating_add(1));
        }
        n
    }

    fn info(&self, committed: Option<Offset>) -> GroupInfo {
        GroupInfo {
            topic: self.topic.clone(),
            group: self.name.clone(),
            generation: self.generation,
            members: self
                .members
                .iter()
                .map(|(id, m)| MemberInfo {
                    consumer_id: id.clone(),
                    state: m.state,
                    inflight: m.inflight.len(),
                    pending: m.inflight.pending_len(),
                })
                .collect(),
            cursor: self.cursor,
            redeliveries: self.redelivery.len(),
            committed,
        }
    }
}

#[inline]
fn pick(assignor: &dyn Assignor, seq: u64, ids: &[ConsumerId], credit: &[usize], msg: &Message) -> Option<usize> {
    let candidates = ids
        .iter()
        .zip(credit)
        .map(|(consumer_id, c)| Candidate { consumer_id, has_credit: *c > 0 })
        .collect_vec();
    assignor.assign(seq, &candidates, msg).filter(|idx| credit.get(*idx).copied().unwrap_or_default() > 0)
}

/// One group plus a version counter that members wait on for new work.
pub struct GroupHandle {
    inner: parking_lot::Mutex<ConsumerGroup>,
    notify: watch::Sender<u64>,
}

impl GroupHandle {
    fn new(topic: TopicName, name: GroupName) -> Self {
        let (notify, _) = watch::channel(0);
        Self { inner: parking_lot::Mutex::new(ConsumerGroup::new(topic, name)), notify }
    }

    #[inline]
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    #[inline]
    pub fn generation(&self) -> Generation {
        self.inner.lock().generation
    }

    #[inline]
    fn wake(&self) {
        self.notify.send_modify(|v| *v = v.wrapping_add(1));
    }
}

pub struct GroupCoordinator {
    ctx: BrokerContext,
    offsets: Arc<OffsetTracker>,
    groups: DashMap<(TopicName, GroupName), Arc<GroupHandle>>,
}

impl std::fmt::Debug for GroupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupCoordinator {{ groups: {} }}", self.groups.len())
    }
}

impl GroupCoordinator {
    pub fn new(ctx: BrokerContext, offsets: Arc<OffsetTracker>) -> Self {
        Self { ctx, offsets, groups: DashMap::default() }
    }

    #[inline]
    pub fn get(&self, topic: &TopicName, group: &GroupName) -> Option<Arc<GroupHandle>> {
        self.groups.get(&(topic.clone(), group.clone())).map(|g| g.value().clone())
    }

    #[inline]
    fn handle(&self, topic: &TopicName, group: &GroupName, consumer_id: &ConsumerId) -> Result<Arc<GroupHandle>> {
        self.get(topic, group).ok_or_else(|| BrokerError::UnknownConsumer(consumer_id.clone()))
    }

    /// Where a group without a dispatch cursor starts reading.
    fn start_offset(&self, log: &TopicLog, group: &GroupName) -> Offset {
        match self.offsets.fetch_committed(log.name(), group) {
            Some(committed) => committed + 1,
            None => match self.ctx.settings.consumer.auto_offset_reset {
                OffsetReset::Earliest => log.log_start_offset(),
                OffsetReset::Latest => log.high_water_mark(),
            },
        }
    }

    /// Adds `consumer_id` to `group`, creating the group on first use, and rebalances.
    pub fn join(&self, log: &TopicLog, group: &GroupName, consumer_id: &ConsumerId) -> Result<Arc<GroupHandle>> {
        let topic = log.name();
        let handle = self
            .groups
            .entry((topic.clone(), group.clone()))
            .or_insert_with(|| {
                self.ctx.stats.groups.inc();
                log::info!("{}/{} consumer group created", topic, group);
                Arc::new(GroupHandle::new(topic.clone(), group.clone()))
            })
            .value()
            .clone();

        {
            let mut g = handle.inner.lock();
            if g.members.get(consumer_id).map(|m| !m.state.is_terminal()).unwrap_or_default() {
                return Err(BrokerError::ConsumerExists(consumer_id.clone()));
            }
            if g.cursor.is_none() {
                let start = self.start_offset(log, group);
                log::debug!("{}/{} dispatch starts at {}", topic, group, start);
                g.cursor = Some(start);
            }
            g.members.insert(consumer_id.clone(), Member::new(self.ctx.settings.consumer.max_inflight));
            g.rebalance();
            log::info!("{}/{} {} joined, generation: {}", topic, group, consumer_id, g.generation);
        }
        self.ctx.stats.consumers.inc();
        self.ctx.stats.rebalances.inc();
        handle.wake();
        Ok(handle)
    }

    /// Assigns available messages across the group and hands out up to `max` of those
    /// assigned to `consumer_id`. Also counts as a heartbeat.
    ///
    /// The group lock is not held while reading from disk.
    pub async fn fetch(
        &self,
        log: &Arc<TopicLog>,
        group: &GroupName,
        consumer_id: &ConsumerId,
        max: usize,
    ) -> Result<Vec<Delivery>> {
        let cfg = &self.ctx.settings.consumer;
        let read_max = cfg.fetch_max.max(max);
        let handle = self.handle(log.name(), group, consumer_id)?;
        let assignor = self.ctx.extends.assignor().await;

        let (mut assigned, mut next) = {
            let mut g = handle.inner.lock();
            g.active_member(consumer_id)?.last_heartbeat = Instant::now();
            g.check_range(log, cfg.out_of_range)?;
            let assigned = g.dispatch_pool(&**assignor);
            (assigned, g.next_read(log.high_water_mark(), read_max))
        };

        while let Some((cursor, budget)) = next {
            let reader = log.clone();
            let msgs = tokio::task::spawn_blocking(move || reader.read_batch(cursor, budget))
                .await
                .map_err(|e| BrokerError::from(anyhow!(e)))??;
            next = {
                let mut g = handle.inner.lock();
                let (n, all) = g.dispatch_read(msgs, &**assignor);
                assigned += n;
                if all {
                    g.next_read(log.high_water_mark(), read_max)
                } else {
                    None
                }
            };
        }
        self.ctx.stats.inflights.incs(assigned as isize);

        let deliveries = {
            let mut g = handle.inner.lock();
            g.active_member(consumer_id)?.inflight.take_pending(max)
        };

        let redelivered = deliveries.iter().filter(|d| d.is_redelivery()).count();
        self.ctx.stats.deliveries.incs(deliveries.len() as isize);
        self.ctx.stats.redeliveries.incs(redelivered as isize);
        //other members may have been given work
        if assigned > 0 {
            handle.wake();
        }
        Ok(deliveries)
    }

    pub fn heartbeat(&self, topic: &TopicName, group: &GroupName, consumer_id: &ConsumerId) -> Result<()> {
        let handle = self.handle(topic, group, consumer_id)?;
        let mut g = handle.inner.lock();
        g.active_member(consumer_id)?.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Removes `consumer_id` from the group. Its unacknowledged messages go back to the
    /// pool and the group rebalances.
    pub fn leave(&self, topic: &TopicName, group: &GroupName, consumer_id: &ConsumerId) -> Result<()> {
        let handle = self.handle(topic, group, consumer_id)?;
        {
            let mut g = handle.inner.lock();
            g.active_member(consumer_id)?;
            let returned = g.remove_member(consumer_id, MemberState::Leaving).unwrap_or_default();
            g.rebalance();
            self.ctx.stats.inflights.decs(returned as isize);
            log::info!("{}/{} {} left, {} message(s) returned", topic, group, consumer_id, returned);
        }
        self.ctx.stats.consumers.dec();
        self.ctx.stats.rebalances.inc();
        handle.wake();
        Ok(())
    }

    /// Cumulative acknowledgement of everything at or below `offset` in the group.
    pub fn ack(&self, topic: &TopicName, group: &GroupName, offset: Offset) {
        if let Some(handle) = self.get(topic, group) {
            let n = handle.inner.lock().ack(offset);
            self.ctx.stats.inflights.decs(n as isize);
            handle.wake();
        }
    }

    /// Removes members whose session expired and reclaims deliveries that were not
    /// committed within the ack timeout. Returns `(expired members, reclaimed messages)`.
    pub fn reap(&self) -> (usize, usize) {
        let cfg = &self.ctx.settings.consumer;
        let now = Instant::now();
        let handles = self.groups.iter().map(|e| e.value().clone()).collect_vec();
        let (mut expired, mut reclaimed) = (0, 0);
        for handle in handles {
            let (e, r) = {
                let mut g = handle.inner.lock();
                let dead = g
                    .members
                    .iter()
                    .filter(|(_, m)| now.saturating_duration_since(m.last_heartbeat) >= cfg.session_timeout)
                    .map(|(id, _)| id.clone())
                    .collect_vec();
                let mut returned = 0;
                for id in dead.iter() {
                    returned += g.remove_member(id, MemberState::Failed).unwrap_or_default();
                    log::warn!("{}/{} {} missed its heartbeat, removed", g.topic, g.name, id);
                }
                let mut timeouts = Vec::new();
                for m in g.members.values_mut() {
                    timeouts.extend(m.inflight.pop_timeouts(cfg.ack_timeout, now));
                }
                let r = timeouts.len();
                for m in timeouts {
                    g.return_to_pool(m);
                }
                if !dead.is_empty() {
                    g.rebalance();
                }
                self.ctx.stats.inflights.decs((returned + r) as isize);
                (dead.len(), returned + r)
            };
            if e > 0 {
                self.ctx.stats.expired_members.incs(e as isize);
                self.ctx.stats.consumers.decs(e as isize);
                self.ctx.stats.rebalances.inc();
            }
            if e > 0 || r > 0 {
                handle.wake();
            }
            expired += e;
            reclaimed += r;
        }
        (expired, reclaimed)
    }

    /// Drops the group's members and in-memory state. The committed offset is kept.
    pub fn remove_group(&self, topic: &TopicName, group: &GroupName) -> bool {
        match self.groups.remove(&(topic.clone(), group.clone())) {
            Some((_, handle)) => {
                let (members, inflights) = {
                    let mut g = handle.inner.lock();
                    let inflights = g.members.values().map(|m| m.inflight.len()).sum::<usize>();
                    let members = std::mem::take(&mut g.members);
                    (members.len(), inflights)
                };
                self.ctx.stats.groups.dec();
                self.ctx.stats.consumers.decs(members as isize);
                self.ctx.stats.inflights.decs(inflights as isize);
                handle.wake();
                log::info!("{}/{} consumer group removed", topic, group);
                true
            }
            None => false,
        }
    }

    /// Removes every group of `topic`, returns how many there were.
    pub fn remove_topic(&self, topic: &TopicName) -> usize {
        let groups = self.groups.iter().filter(|e| &e.key().0 == topic).map(|e| e.key().1.clone()).collect_vec();
        groups.iter().filter(|group| self.remove_group(topic, group)).count()
    }

    pub fn groups(&self) -> Vec<GroupInfo> {
        let mut infos = self
            .groups
            .iter()
            .map(|e| {
                let (topic, group) = e.key();
                e.value().inner.lock().info(self.offsets.fetch_committed(topic, group))
            })
            .collect_vec();
        infos.sort_by(|a, b| (&a.topic, &a.group).cmp(&(&b.topic, &b.group)));
        infos
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::context::test_context;
    use crate::types::{HashMap, Record, TopicConfig};

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: BrokerContext,
        log: Arc<TopicLog>,
        offsets: Arc<OffsetTracker>,
        groups: GroupCoordinator,
    }

    fn fixture<F: FnOnce(&mut crate::conf::Inner)>(f: F) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), f);
        let log = Arc::new(TopicLog::open("orders".into(), dir.path().join("orders"), TopicConfig::default()).unwrap());
        let offsets = Arc::new(OffsetTracker::open(dir.path(), false, 8).unwrap());
        let groups = GroupCoordinator::new(ctx.clone(), offsets.clone());
        Fixture { _dir: dir, ctx, log, offsets, groups }
    }

    impl Fixture {
        fn publish(&self, n: usize) {
            let records = (0..n).map(|i| Record::new(Some(Bytes::from(format!("k{}", i % 7))), Bytes::from("v"))).collect_vec();
            let a = self.log.append_batch(&records, 0).unwrap();
            self.log.publish_visible(a.next);
        }

        fn topic(&self) -> TopicName {
            self.log.name().clone()
        }
    }

    fn offsets(ds: &[Delivery]) -> Vec<Offset> {
        ds.iter().map(|d| d.offset).collect()
    }

    #[tokio::test]
    async fn single_member_sees_append_order() {
        let fx = fixture(|_| {});
        fx.publish(20);
        let g = GroupName::from("g1");
        let c = ConsumerId::from("c1");
        let handle = fx.groups.join(&fx.log, &g, &c).unwrap();
        assert_eq!(handle.generation(), 1);

        let first = fx.groups.fetch(&fx.log, &g, &c, 15).await.unwrap();
        assert_eq!(offsets(&first), (0..15).collect_vec());
        let rest = fx.groups.fetch(&fx.log, &g, &c, 15).await.unwrap();
        assert_eq!(offsets(&rest), (15..20).collect_vec());
        assert!(fx.groups.fetch(&fx.log, &g, &c, 15).await.unwrap().is_empty());
        assert_eq!(fx.ctx.stats.deliveries.count(), 20);
    }

    #[tokio::test]
    async fn groups_are_independent() {
        let fx = fixture(|_| {});
        fx.publish(10);
        let c = ConsumerId::from("c");
        for g in ["a", "b"] {
            let g = GroupName::from(g);
            fx.groups.join(&fx.log, &g, &c).unwrap();
            assert_eq!(offsets(&fx.groups.fetch(&fx.log, &g, &c, 100).await.unwrap()), (0..10).collect_vec());
        }
        assert_eq!(fx.groups.len(), 2);
    }

    #[tokio::test]
    async fn members_share_the_work() {
        let fx = fixture(|s| s.consumer.max_inflight = 4);
        fx.publish(12);
        let g = GroupName::from("g");
        let ids = ["c1", "c2", "c3"].map(ConsumerId::from);
        for c in ids.iter() {
            fx.groups.join(&fx.log, &g, c).unwrap();
        }

        let mut seen = HashSet::new();
        for c in ids.iter() {
            let ds = fx.groups.fetch(&fx.log, &g, c, 100).await.unwrap();
            assert_eq!(ds.len(), 4);
            //each member sees increasing offsets
            assert!(ds.windows(2).all(|w| w[0].offset < w[1].offset));
            for d in ds {
                assert!(seen.insert(d.offset), "offset {} delivered twice", d.offset);
            }
        }
        assert_eq!(seen.len(), 12);
        //windows are full
        assert!(fx.groups.fetch(&fx.log, &g, &ids[0], 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_and_unknown_members() {
        let fx = fixture(|_| {});
        let g = GroupName::from("g");
        let c = ConsumerId::from("c");
        fx.groups.join(&fx.log, &g, &c).unwrap();
        assert!(matches!(fx.groups.join(&fx.log, &g, &c), Err(BrokerError::ConsumerExists(_))));
        let other = ConsumerId::from("x");
        assert!(matches!(fx.groups.fetch(&fx.log, &g, &other, 1).await, Err(BrokerError::UnknownConsumer(_))));
        assert!(matches!(fx.groups.heartbeat(&fx.topic(), &g, &other), Err(BrokerError::UnknownConsumer(_))));
        fx.groups.leave(&fx.topic(), &g, &c).unwrap();
        //the id is free again
        fx.groups.join(&fx.log, &g, &c).unwrap();
    }

    #[tokio::test]
    async fn leaving_member_work_is_redelivered() {
        let fx = fixture(|s| s.consumer.max_inflight = 10);
        fx.publish(10);
        let g = GroupName::from("g");
        let (c1, c2) = (ConsumerId::from("c1"), ConsumerId::from("c2"));
        fx.groups.join(&fx.log, &g, &c1).unwrap();
        fx.groups.join(&fx.log, &g, &c2).unwrap();

        let d1 = fx.groups.fetch(&fx.log, &g, &c1, 100).await.unwrap();
        assert_eq!(offsets(&d1), vec![0, 2, 4, 6, 8]);
        fx.groups.leave(&fx.topic(), &g, &c1).unwrap();

        let d2 = fx.groups.fetch(&fx.log, &g, &c2, 100).await.unwrap();
        assert_eq!(offsets(&d2), (0..10).collect_vec());
        for d in d2.iter() {
            assert_eq!(d.attempt, if d.offset % 2 == 0 { 2 } else { 1 });
        }
        assert_eq!(fx.groups.groups()[0].generation, 3);
        assert_eq!(fx.ctx.stats.redeliveries.count(), 5);
    }

    #[tokio::test]
    async fn key_hash_keeps_per_key_order() {
        let fx = fixture(|s| s.consumer.assignor = "key_hash".into());
        let g = GroupName::from("g");
        let ids = ["c1", "c2", "c3"].map(ConsumerId::from);
        for c in ids.iter() {
            fx.groups.join(&fx.log, &g, c).unwrap();
        }

        let mut owner: HashMap<Bytes, ConsumerId> = HashMap::default();
        let mut last: HashMap<Bytes, Offset> = HashMap::default();
        let mut total = 0;
        for _ in 0..2 {
            fx.publish(35);
            for c in ids.iter() {
                for d in fx.groups.fetch(&fx.log, &g, c, 100).await.unwrap() {
                    let key = d.key.clone().unwrap();
                    let o = owner.entry(key.clone()).or_insert_with(|| c.clone());
                    assert_eq!(o, c, "key {:?} went to two members", key);
                    if let Some(prev) = last.insert(key, d.offset) {
                        assert!(prev < d.offset, "key order broken at {}", d.offset);
                    }
                    total += 1;
                }
            }
        }
        assert_eq!(total, 70);
        assert_eq!(owner.len(), 7);
    }

    #[tokio::test]
    async fn stale_read_skips_passed_offsets() {
        let fx = fixture(|_| {});
        fx.publish(6);
        let g = GroupName::from("g");
        let c = ConsumerId::from("c");
        fx.groups.join(&fx.log, &g, &c).unwrap();
        let msgs = fx.log.read_batch(0, 6).unwrap();
        //the group committed past part of the read while it was in flight
        fx.groups.ack(&fx.topic(), &g, 2);

        let handle = fx.groups.get(&fx.topic(), &g).unwrap();
        let assignor = fx.ctx.extends.assignor().await;
        let (n, all) = handle.inner.lock().dispatch_read(msgs, &**assignor);
        assert_eq!((n, all), (3, true));
        assert_eq!(handle.inner.lock().cursor, Some(6));
        assert_eq!(handle.inner.lock().next_read(fx.log.high_water_mark(), 100), None);

        let ds = fx.groups.fetch(&fx.log, &g, &c, 100).await.unwrap();
        assert_eq!(offsets(&ds), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn cumulative_ack_moves_cursor() {
        let fx = fixture(|_| {});
        fx.publish(10);
        let g = GroupName::from("g");
        let c = ConsumerId::from("c");
        fx.groups.join(&fx.log, &g, &c).unwrap();
        fx.groups.fetch(&fx.log, &g, &c, 3).await.unwrap();
        fx.groups.ack(&fx.topic(), &g, 6);
        let ds = fx.groups.fetch(&fx.log, &g, &c, 100).await.unwrap();
        assert_eq!(offsets(&ds), (7..10).collect_vec());
        let info = &fx.groups.groups()[0];
        assert_eq!(info.cursor, Some(10));
        assert_eq!(info.members[0].inflight, 3);
    }

    #[tokio::test]
    async fn join_resumes_after_committed() {
        let fx = fixture(|_| {});
        fx.publish(10);
        let g = GroupName::from("g");
        fx.offsets.commit(&fx.topic(), &g, 4).unwrap();
        let c = ConsumerId::from("c");
        fx.groups.join(&fx.log, &g, &c).unwrap();
        let ds = fx.groups.fetch(&fx.log, &g, &c, 100).await.unwrap();
        assert_eq!(offsets(&ds), (5..10).collect_vec());
    }

    #[tokio::test]
    async fn latest_reset_skips_history() {
        let fx = fixture(|s| s.consumer.auto_offset_reset = OffsetReset::Latest);
        fx.publish(10);
        let g = GroupName::from("g");
        let c = ConsumerId::from("c");
        fx.groups.join(&fx.log, &g, &c).unwrap();
        assert!(fx.groups.fetch(&fx.log, &g, &c, 100).await.unwrap().is_empty());
        fx.publish(2);
        assert_eq!(offsets(&fx.groups.fetch(&fx.log, &g, &c, 100).await.unwrap()), vec![10, 11]);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_expires_members_and_deliveries() {
        let fx = fixture(|s| {
            s.consumer.session_timeout = Duration::from_secs(10);
            s.consumer.ack_timeout = Duration::from_secs(3);
        });
        fx.publish(4);
        let g = GroupName::from("g");
        let (c1, c2) = (ConsumerId::from("c1"), ConsumerId::from("c2"));
        fx.groups.join(&fx.log, &g, &c1).unwrap();
        let ds = fx.groups.fetch(&fx.log, &g, &c1, 2).await.unwrap();
        assert_eq!(offsets(&ds), vec![0, 1]);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(fx.groups.reap(), (0, 2));
        let ds = fx.groups.fetch(&fx.log, &g, &c1, 2).await.unwrap();
        assert_eq!(offsets(&ds), vec![0, 1]);
        assert!(ds.iter().all(|d| d.attempt == 2));

        fx.groups.join(&fx.log, &g, &c2).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        fx.groups.heartbeat(&fx.topic(), &g, &c2).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let (expired, _) = fx.groups.reap();
        assert_eq!(expired, 1);
        assert_eq!(fx.ctx.stats.expired_members.count(), 1);
        assert!(matches!(fx.groups.fetch(&fx.log, &g, &c1, 1).await, Err(BrokerError::UnknownConsumer(_))));
        let mut all = offsets(&fx.groups.fetch(&fx.log, &g, &c2, 100).await.unwrap());
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    struct RetireSealed;

    impl crate::retention::RetentionPolicy for RetireSealed {
        fn retire(&self, _: &TopicConfig, sealed: &[crate::types::SegmentInfo], _: u64, _: i64) -> usize {
            sealed.len()
        }
    }

    #[tokio::test]
    async fn cursor_below_log_start() {
        let fx = fixture(|_| {});
        let config = TopicConfig { segment_bytes: 1, ..TopicConfig::default() };
        let log = Arc::new(TopicLog::open("small".into(), fx._dir.path().join("small"), config).unwrap());
        for _ in 0..3 {
            let a = log.append_batch(&[Record::new(None, Bytes::from("v"))], 0).unwrap();
            log.publish_visible(a.next);
        }
        let g = GroupName::from("g");
        let c = ConsumerId::from("c");
        fx.groups.join(&log, &g, &c).unwrap();
        assert_eq!(log.apply_retention(&RetireSealed, 0).unwrap(), 2);
        assert_eq!(log.log_start_offset(), 2);

        let handle = fx.groups.get(log.name(), &g).unwrap();
        let res = handle.inner.lock().check_range(&log, OutOfRange::Fail);
        assert!(matches!(res, Err(BrokerError::OffsetOutOfRange { offset: 0, start: 2, end: 3 })));

        //the default policy skips to the log start
        let ds = fx.groups.fetch(&log, &g, &c, 10).await.unwrap();
        assert_eq!(offsets(&ds), vec![2]);
    }

    #[tokio::test]
    async fn remove_group_drops_members() {
        let fx = fixture(|_| {});
        let g = GroupName::from("g");
        let c = ConsumerId::from("c");
        fx.groups.join(&fx.log, &g, &c).unwrap();
        assert_eq!(fx.groups.remove_topic(&fx.topic()), 1);
        assert!(fx.groups.is_empty());
        assert!(matches!(fx.groups.fetch(&fx.log, &g, &c, 1).await, Err(BrokerError::UnknownConsumer(_))));
        assert_eq!(fx.ctx.stats.consumers.count(), 0);
    }
}
