//! Strategies that pick which member of a consumer group receives a message.

use std::hash::{BuildHasher, Hash, Hasher};

use crate::types::{ConsumerId, Message};

/// An active group member as seen by an [`Assignor`].
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub consumer_id: &'a ConsumerId,
    /// Whether the member can take another unacknowledged message.
    pub has_credit: bool,
}

pub trait Assignor: Sync + Send {
    fn name(&self) -> &'static str;

    /// Picks the member for `msg`. `candidates` are the group's active members sorted by
    /// consumer id and never empty; `seq` counts the messages the group assigned so far.
    /// `None` holds the message back until a member has credit again.
    fn assign(&self, seq: u64, candidates: &[Candidate<'_>], msg: &Message) -> Option<usize>;
}

/// Takes members in turn, skipping those without credit.
#[derive(Default)]
pub struct RoundRobinAssignor;

impl Assignor for RoundRobinAssignor {
    #[inline]
    fn name(&self) -> &'static str {
        "round_robin"
    }

    #[inline]
    fn assign(&self, seq: u64, candidates: &[Candidate<'_>], _msg: &Message) -> Option<usize> {
        round_robin(seq, candidates)
    }
}

#[inline]
fn round_robin(seq: u64, candidates: &[Candidate<'_>]) -> Option<usize> {
    let n = candidates.len();
    if n == 0 {
        return None;
    }
    let start = (seq % n as u64) as usize;
    (0..n).map(|i| (start + i) % n).find(|i| candidates[*i].has_credit)
}

/// Sends every message with the same key to the same member while membership is stable.
/// The chosen member must have credit, otherwise the message waits so that per-key order
/// holds. Messages without a key are spread round-robin.
pub struct KeyHashAssignor {
    hasher: ahash::RandomState,
}

impl Default for KeyHashAssignor {
    fn default() -> Self {
        Self { hasher: ahash::RandomState::with_seeds(0x5851_f42d, 0x4c95_7f2d, 0x1405_7b7e, 0xf767_814f) }
    }
}

impl Assignor for KeyHashAssignor {
    #[inline]
    fn name(&self) -> &'static str {
        "key_hash"
    }

    fn assign(&self, seq: u64, candidates: &[Candidate<'_>], msg: &Message) -> Option<usize> {
        let key = match msg.key.as_ref() {
            Some(key) => key,
            None => return round_robin(seq, candidates),
        };
        if candidates.is_empty() {
            return None;
        }
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        let idx = (h.finish() % candidates.len() as u64) as usize;
        if candidates[idx].has_credit {
            Some(idx)
        } else {
            None
        }
    }
}

/// Picks a random member with credit.
#[derive(Default)]
pub struct RandomAssignor;

impl Assignor for RandomAssignor {
    #[inline]
    fn name(&self) -> &'static str {
        "random"
    }

    fn assign(&self, _seq: u64, candidates: &[Candidate<'_>], _msg: &Message) -> Option<usize> {
        let mut tmp = candidates.iter().enumerate().filter(|(_, c)| c.has_credit).map(|(i, _)| i).collect::<Vec<_>>();
        if tmp.is_empty() {
            return None;
        }
        let r_idx = if tmp.len() == 1 { 0 } else { rand::random::<u64>() as usize % tmp.len() };
        Some(tmp.swap_remove(r_idx))
    }
}

/// Builds an assignor by name: `round_robin`, `key_hash` or `random`.
pub fn by_name(name: &str) -> Option<Box<dyn Assignor>> {
    match name {
        "round_robin" => Some(Box::new(RoundRobinAssignor)),
        "key_hash" => Some(Box::new(KeyHashAssignor::default())),
        "random" => Some(Box::new(RandomAssignor)),
        _ => None,
    }
}
