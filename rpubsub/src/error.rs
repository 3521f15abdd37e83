use std::fmt;

use thiserror::Error;

/// What kind of object a [`PubSubError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Topic,
    Endpoint,
    Subscription,
    Message,
    HookService,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Topic => "topic",
            Kind::Endpoint => "endpoint",
            Kind::Subscription => "subscription",
            Kind::Message => "message",
            Kind::HookService => "hook service",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PubSubError {
    #[error("{kind} not found, {key}")]
    NotFound { kind: Kind, key: String },
    #[error("invalid hook result `{0}`")]
    InvalidHookResult(String),
    #[error("delivery server unreachable, server: {server}, {reason}")]
    DeliveryServerUnreachable { server: String, reason: String },
    #[error("durability mismatch on topic {topic}, {reason}")]
    DurabilityMismatch { topic: String, reason: String },
}

impl PubSubError {
    #[inline]
    pub fn not_found<K: fmt::Display>(kind: Kind, key: K) -> Self {
        PubSubError::NotFound { kind, key: key.to_string() }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, PubSubError::NotFound { .. })
    }

    /// Extract the domain error from an `anyhow` chain, if there is one.
    #[inline]
    pub fn from_error(e: &anyhow::Error) -> Option<&PubSubError> {
        e.downcast_ref::<PubSubError>()
    }
}
