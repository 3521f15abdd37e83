use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PubSubError;
use crate::types::{self, Pid, ServerName, SubKey, TimestampMillis, TopicId, TopicName};
use crate::Result;

/// Requests exchanged between server processes of one cluster.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum Message {
    /// Which pid of the receiving server delivers for this sub_key
    GetServerPidForSubKey(SubKey),
    /// Wake the delivery tasks of these sub_keys, non-GD messages travel along
    NotifyPubSubTasks(NotifyPubSubTasks),
    Ping,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NotifyPubSubTasks {
    pub topic_id: TopicId,
    pub topic_name: TopicName,
    pub has_gd: bool,
    pub gd_pub_time_max: TimestampMillis,
    pub batches: Vec<(SubKey, Vec<types::Message>)>,
}

impl Message {
    #[inline]
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(anyhow::Error::new)
    }
    #[inline]
    pub fn decode(data: &[u8]) -> Result<Message> {
        bincode::deserialize::<Message>(data).map_err(anyhow::Error::new)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum MessageReply {
    Success,
    Error(String),
    /// Notified sub_keys the receiver has no subscription for, their batches stay with the sender
    Rejected(Vec<SubKey>),
    ServerPid(Option<Pid>),
    Pong,
}

impl MessageReply {
    #[inline]
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(anyhow::Error::new)
    }
    #[inline]
    pub fn decode(data: &[u8]) -> Result<MessageReply> {
        bincode::deserialize::<MessageReply>(data).map_err(anyhow::Error::new)
    }
}

/// Transport to a named peer server, supplied by the host process.
/// `pid` narrows the call to one process of that server when known.
#[async_trait]
pub trait ServerRpc: Sync + Send {
    async fn invoke(&self, server_name: &ServerName, pid: Option<Pid>, msg: Message) -> Result<MessageReply>;
}

/// Outcome of [`RpcClient::send_message`] when it does not succeed.
#[derive(Debug)]
pub enum SendError {
    Timeout(Duration),
    Failed(anyhow::Error),
}

impl SendError {
    #[inline]
    pub fn into_unreachable(self, server: &ServerName) -> PubSubError {
        let reason = match self {
            SendError::Timeout(t) => format!("timeout after {:?}", t),
            SendError::Failed(e) => e.to_string(),
        };
        PubSubError::DeliveryServerUnreachable { server: server.to_string(), reason }
    }
}

#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<dyn ServerRpc>,
}

impl RpcClient {
    #[inline]
    pub fn new(inner: Arc<dyn ServerRpc>) -> Self {
        Self { inner }
    }

    /// Sends `msg` with a deadline. An `Error` reply counts as a failure.
    pub async fn send_message(
        &self,
        server_name: &ServerName,
        pid: Option<Pid>,
        msg: Message,
        timeout: Duration,
    ) -> std::result::Result<MessageReply, SendError> {
        log::debug!("rpc to {}:{:?}, message: {:?}", server_name, pid, msg);
        match tokio::time::timeout(timeout, self.inner.invoke(server_name, pid, msg)).await {
            Err(_) => Err(SendError::Timeout(timeout)),
            Ok(Err(e)) => Err(SendError::Failed(e)),
            Ok(Ok(MessageReply::Error(e))) => Err(SendError::Failed(anyhow!(e))),
            Ok(Ok(reply)) => Ok(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, MockRpc};

    #[test]
    fn codec() {
        let msg = Message::NotifyPubSubTasks(NotifyPubSubTasks {
            topic_id: 1,
            topic_name: "orders".into(),
            has_gd: false,
            gd_pub_time_max: 0,
            batches: vec![("sk1".into(), vec![(*message("m1", 1, 10)).clone()])],
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::NotifyPubSubTasks(n) => {
                assert_eq!(n.batches[0].0, "sk1");
                assert_eq!(n.batches[0].1[0].pub_msg_id, "m1");
                assert_eq!(n.batches[0].1[0].pub_time, 10);
            }
            _ => panic!("unexpected message {:?}", decoded),
        }
        let reply = MessageReply::ServerPid(Some(100));
        assert_eq!(MessageReply::decode(&reply.encode().unwrap()).unwrap(), reply);
    }

    #[tokio::test]
    async fn send_message_outcomes() {
        let rpc = Arc::new(MockRpc::default());
        rpc.set_pid("serverA", "sk1", Some(100));
        rpc.set_slow("serverB");
        rpc.set_error("serverC");
        let client = RpcClient::new(rpc);
        let timeout = Duration::from_millis(50);

        let reply = client
            .send_message(&"serverA".into(), None, Message::GetServerPidForSubKey("sk1".into()), timeout)
            .await
            .unwrap();
        assert_eq!(reply, MessageReply::ServerPid(Some(100)));

        let err = client.send_message(&"serverB".into(), None, Message::Ping, timeout).await.unwrap_err();
        assert!(matches!(err, SendError::Timeout(_)));

        let err = client.send_message(&"serverC".into(), None, Message::Ping, timeout).await.unwrap_err();
        assert!(matches!(
            err.into_unreachable(&"serverC".into()),
            PubSubError::DeliveryServerUnreachable { .. }
        ));
    }
}
