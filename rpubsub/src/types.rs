use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use rpubsub_utils::{Pid, TimestampMillis};

use crate::Result;

pub type SubKey = ByteString;
pub type MsgId = ByteString;
pub type TopicName = ByteString;
pub type ServerName = ByteString;
pub type ChannelName = ByteString;
pub type TopicId = u64;
pub type EndpointId = u64;
pub type ClusterId = u32;
pub type Priority = u8;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

pub type MessageRef = Arc<Message>;
pub type SubKeys = Vec<SubKey>;

pub const PRIORITY_DEFAULT: Priority = 5;
pub const EXPIRATION_NEVER: TimestampMillis = TimestampMillis::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Rest,
    Service,
    Soap,
    Amqp,
    #[serde(rename = "wsx")]
    WebSocket,
    Internal,
}

impl EndpointType {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Rest => "rest",
            EndpointType::Service => "srv",
            EndpointType::Soap => "soap",
            EndpointType::Amqp => "amqp",
            EndpointType::WebSocket => "wsx",
            EndpointType::Internal => "internal",
        }
    }

    #[inline]
    pub fn is_wsx(&self) -> bool {
        matches!(self, EndpointType::WebSocket)
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "rest" => EndpointType::Rest,
            "srv" | "service" => EndpointType::Service,
            "soap" => EndpointType::Soap,
            "amqp" => EndpointType::Amqp,
            "wsx" | "websocket" => EndpointType::WebSocket,
            "internal" => EndpointType::Internal,
            _ => return Err(anyhow!("unknown endpoint type, {}", s)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Notify,
    Pull,
}

/// A single published message, shared by reference between backlog queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub pub_msg_id: MsgId,
    pub topic_id: TopicId,
    pub topic_name: TopicName,
    pub pub_time: TimestampMillis,
    pub expiration_time: TimestampMillis,
    pub priority: Priority,
    pub has_gd: bool,
    pub published_by_id: EndpointId,
    pub data: Bytes,
}

impl Message {
    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expiration_time <= now
    }
}

/// Generates a new, never reused subscription key, `sk.<type>.<hex>`.
#[inline]
pub fn new_sub_key(endpoint_type: EndpointType) -> SubKey {
    let id = Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_string();
    SubKey::from(format!("sk.{}.{}", endpoint_type.as_str(), &id[..24]))
}

#[inline]
pub fn new_msg_id() -> MsgId {
    let id = Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_string();
    MsgId::from(format!("msg.{}", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_keys_are_unique() {
        let a = new_sub_key(EndpointType::WebSocket);
        let b = new_sub_key(EndpointType::WebSocket);
        assert_ne!(a, b);
        assert!(a.starts_with("sk.wsx."));
        assert!(new_msg_id().starts_with("msg."));
    }

    #[test]
    fn endpoint_type_names() {
        assert_eq!("wsx".parse::<EndpointType>().unwrap(), EndpointType::WebSocket);
        assert_eq!("service".parse::<EndpointType>().unwrap(), EndpointType::Service);
        assert!("carrier-pigeon".parse::<EndpointType>().is_err());
        assert!(EndpointType::WebSocket.is_wsx());
        assert_eq!(EndpointType::Rest.to_string(), "rest");
    }
}
