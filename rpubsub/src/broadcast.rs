use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::directory::SubKeyServer;
use crate::subscription::Subscription;
use crate::types::SubKey;
use crate::Result;

/// Messages published on the cluster-wide broker bus. Every process applies
/// them to its own in-memory directory, nothing else is shared.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum BrokerMessage {
    SubKeyServerSet(SubKeyServer),
    SubKeyServerDelete(SubKey),
    SubscriptionCreate(Subscription),
    SubscriptionDelete(SubKey),
    WsxClientDisconnected(Vec<SubKey>),
}

impl BrokerMessage {
    #[inline]
    pub fn action(&self) -> &'static str {
        match self {
            BrokerMessage::SubKeyServerSet(_) => "PUBSUB.SUB_KEY_SERVER_SET",
            BrokerMessage::SubKeyServerDelete(_) => "PUBSUB.SUB_KEY_SERVER_DELETE",
            BrokerMessage::SubscriptionCreate(_) => "PUBSUB.SUBSCRIPTION_CREATE",
            BrokerMessage::SubscriptionDelete(_) => "PUBSUB.SUBSCRIPTION_DELETE",
            BrokerMessage::WsxClientDisconnected(_) => "PUBSUB.WSX_CLIENT_DISCONNECTED",
        }
    }

    #[inline]
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(anyhow::Error::new)
    }

    #[inline]
    pub fn decode(data: &[u8]) -> Result<BrokerMessage> {
        bincode::deserialize::<BrokerMessage>(data).map_err(anyhow::Error::new)
    }
}

#[async_trait]
pub trait BrokerClient: Sync + Send {
    /// Publishes to every server process of the cluster, this one included.
    async fn publish(&self, msg: BrokerMessage) -> Result<()>;
}
