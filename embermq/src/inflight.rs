//! Messages assigned to one group member and not yet acknowledged.

use std::time::Duration;

use itertools::Itertools;
use rust_box::dequemap::DequeBTreeMap as DequeMap;
use tokio::time::Instant;

use crate::types::{Delivery, Message, Offset};

type Queues = DequeMap<Offset, InflightMessage>;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum InflightStatus {
    /// Assigned to the member, not yet handed out by a fetch.
    Pending,
    /// Handed out, waiting for a commit.
    Delivered,
}

#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub message: Message,
    pub status: InflightStatus,
    /// Deliveries so far, including the one in progress.
    pub attempt: u32,
    pub update_time: Instant,
}

impl InflightMessage {
    #[inline]
    pub fn new(message: Message, attempt: u32) -> Self {
        Self { message, status: InflightStatus::Pending, attempt, update_time: Instant::now() }
    }

    #[inline]
    fn update_status(&mut self, status: InflightStatus) {
        self.update_time = Instant::now();
        self.status = status;
    }

    #[inline]
    pub fn timeout(&self, interval: Duration, now: Instant) -> bool {
        self.status == InflightStatus::Delivered
            && !interval.is_zero()
            && now.saturating_duration_since(self.update_time) >= interval
    }
}

pub struct Inflight {
    cap: usize,
    queues: Queues,
}

impl Inflight {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), queues: Queues::default() }
    }

    #[inline]
    pub fn push_back(&mut self, m: InflightMessage) -> Option<InflightMessage> {
        self.queues.insert(m.message.offset, m)
    }

    #[inline]
    pub fn get(&self, offset: &Offset) -> Option<&InflightMessage> {
        self.queues.get(offset)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queues.len() < self.cap
    }

    /// Messages the window can still take.
    #[inline]
    pub fn credit(&self) -> usize {
        self.cap.saturating_sub(self.queues.len())
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.queues.iter().filter(|(_, m)| m.status == InflightStatus::Pending).count()
    }

    /// Hands out up to `max` pending messages in offset order.
    pub fn take_pending(&mut self, max: usize) -> Vec<Delivery> {
        let offsets = self
            .queues
            .iter()
            .filter(|(_, m)| m.status == InflightStatus::Pending)
            .map(|(o, _)| *o)
            .sorted_unstable()
            .take(max)
            .collect_vec();
        let mut out = Vec::with_capacity(offsets.len());
        for offset in offsets {
            if let Some(m) = self.queues.get_mut(&offset) {
                m.update_status(InflightStatus::Delivered);
                out.push(Delivery::new(m.message.clone(), m.attempt));
            }
        }
        out
    }

    /// Drops every message at or below `offset`, returns how many were dropped.
    pub fn ack_upto(&mut self, offset: Offset) -> usize {
        let acked = self.queues.iter().filter(|(o, _)| **o <= offset).map(|(o, _)| *o).collect_vec();
        for o in acked.iter() {
            self.queues.remove(o);
        }
        acked.len()
    }

    /// Removes delivered messages older than `interval`.
    pub fn pop_timeouts(&mut self, interval: Duration, now: Instant) -> Vec<InflightMessage> {
        let expired =
            self.queues.iter().filter(|(_, m)| m.timeout(interval, now)).map(|(o, _)| *o).collect_vec();
        expired.iter().filter_map(|o| self.queues.remove(o)).collect()
    }

    /// Empties the window, oldest assignment first.
    pub fn drain(&mut self) -> Vec<InflightMessage> {
        let mut msgs = Vec::with_capacity(self.queues.len());
        while let Some((_, m)) = self.queues.pop_front() {
            msgs.push(m);
        }
        msgs
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn msg(offset: Offset) -> Message {
        Message { offset, timestamp: 0, key: None, payload: Bytes::from_static(b"x"), topic: "t".into() }
    }

    #[test]
    fn credit_and_order() {
        let mut inf = Inflight::new(3);
        inf.push_back(InflightMessage::new(msg(5), 1));
        inf.push_back(InflightMessage::new(msg(2), 2));
        assert!(inf.has_credit());
        inf.push_back(InflightMessage::new(msg(9), 1));
        assert!(!inf.has_credit());

        let d = inf.take_pending(2);
        assert_eq!(d.iter().map(|d| d.offset).collect::<Vec<_>>(), vec![2, 5]);
        assert!(d[0].is_redelivery());
        assert_eq!(inf.pending_len(), 1);
        assert_eq!(inf.take_pending(10).len(), 1);
        assert!(inf.take_pending(10).is_empty());
    }

    #[test]
    fn cumulative_ack() {
        let mut inf = Inflight::new(10);
        for o in [3, 1, 7, 4] {
            inf.push_back(InflightMessage::new(msg(o), 1));
        }
        assert_eq!(inf.ack_upto(4), 3);
        assert_eq!(inf.len(), 1);
        assert!(inf.get(&7).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_messages_time_out() {
        let mut inf = Inflight::new(10);
        inf.push_back(InflightMessage::new(msg(1), 1));
        inf.push_back(InflightMessage::new(msg(2), 1));
        inf.take_pending(1);

        tokio::time::advance(Duration::from_secs(5)).await;
        let expired = inf.pop_timeouts(Duration::from_secs(5), Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message.offset, 1);
        //pending messages never time out
        assert_eq!(inf.len(), 1);
        assert!(inf.pop_timeouts(Duration::ZERO, Instant::now()).is_empty());
        assert_eq!(inf.drain().len(), 1);
        assert!(inf.is_empty());
    }
}
