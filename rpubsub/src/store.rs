use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ChannelName, ClusterId, EndpointType, MessageRef, MsgId, ServerName, SubKey, TimestampMillis, TopicId};
use crate::Result;

/// Which server the durable store says should own a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableServerRecord {
    pub server_name: ServerName,
    pub cluster_id: ClusterId,
    pub endpoint_type: EndpointType,
    pub channel_name: Option<ChannelName>,
    pub pub_client_id: Option<String>,
}

/// The relational store holding GD messages and subscription ownership.
/// Shared by every server process of a cluster.
#[async_trait]
pub trait DurableStore: Sync + Send {
    async fn get_delivery_server_for_sub_key(
        &self,
        sub_key: &SubKey,
        is_wsx: bool,
    ) -> Result<Option<DurableServerRecord>>;

    async fn mark_messages_deleted(&self, sub_key: &SubKey, msg_ids: &[MsgId], now: TimestampMillis) -> Result<()>;

    /// Persists GD messages and enqueues them for the given subscriptions.
    async fn store_gd_messages(&self, topic_id: TopicId, sub_keys: &[SubKey], msgs: &[MessageRef]) -> Result<()>;
}
