use async_trait::async_trait;

use crate::types::{MessageRef, MsgId, SubKey, TimestampMillis, TopicName};
use crate::Result;

/// What the broker hands to a delivery task in one go.
#[derive(Debug, Clone)]
pub struct DeliveryBatch {
    pub topic_name: TopicName,
    ///GD messages are waiting in the durable store, the task fetches them itself
    pub has_gd: bool,
    pub gd_pub_time_max: TimestampMillis,
    pub messages: Vec<MessageRef>,
}

impl DeliveryBatch {
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_gd && self.messages.is_empty()
    }
}

/// The delivery tasks running inside this process, one per active sub_key.
#[async_trait]
pub trait DeliveryTask: Sync + Send {
    /// Hands a batch to the task owning `sub_key`, `Ok` acknowledges it.
    async fn deliver(&self, sub_key: &SubKey, batch: DeliveryBatch) -> Result<()>;

    /// Whether a task for `sub_key` runs in this process.
    fn has_task(&self, sub_key: &SubKey) -> bool;

    /// Stops the task of an unsubscribed sub_key.
    async fn stop(&self, _sub_key: &SubKey) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sub_key: SubKey,
    pub delivered: Vec<MsgId>,
    pub skipped: Vec<MsgId>,
    pub discarded: Vec<MsgId>,
    pub warnings: Vec<String>,
}

impl DeliveryReport {
    #[inline]
    pub fn new(sub_key: SubKey) -> Self {
        Self { sub_key, ..Default::default() }
    }
}
