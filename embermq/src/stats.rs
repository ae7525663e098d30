//! Internal broker counters. Each [`Counter`] keeps the current value and the highest
//! value it reached; totals such as `publishes` only ever grow.

use serde::Serialize;
use serde_json::json;

use crate::utils::Counter;

#[derive(Serialize, Debug, Default)]
pub struct Stats {
    pub topics: Counter,
    pub groups: Counter,
    pub consumers: Counter,
    pub inflights: Counter,
    pub ingress_buffered: Counter,

    pub publishes: Counter,
    pub publish_errors: Counter,
    pub backpressures: Counter,
    pub appended_batches: Counter,
    pub deliveries: Counter,
    pub redeliveries: Counter,
    pub commits: Counter,
    pub rebalances: Counter,
    pub expired_members: Counter,
    pub rotations: Counter,
    pub retired_segments: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "topics.count": self.topics.count(),
            "topics.max": self.topics.max(),
            "groups.count": self.groups.count(),
            "groups.max": self.groups.max(),
            "consumers.count": self.consumers.count(),
            "consumers.max": self.consumers.max(),
            "inflights.count": self.inflights.count(),
            "inflights.max": self.inflights.max(),
            "ingress_buffered.count": self.ingress_buffered.count(),
            "ingress_buffered.max": self.ingress_buffered.max(),

            "publishes": self.publishes.count(),
            "publish_errors": self.publish_errors.count(),
            "backpressures": self.backpressures.count(),
            "appended_batches": self.appended_batches.count(),
            "deliveries": self.deliveries.count(),
            "redeliveries": self.redeliveries.count(),
            "commits": self.commits.count(),
            "rebalances": self.rebalances.count(),
            "expired_members": self.expired_members.count(),
            "rotations": self.rotations.count(),
            "retired_segments": self.retired_segments.count(),
        })
    }
}
