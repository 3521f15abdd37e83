use serde::{Deserialize, Serialize};

use crate::acl::{Action, Patterns};
use crate::error::{Kind, PubSubError};
use crate::types::{EndpointId, EndpointType, HashMap};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Publisher,
    Subscriber,
    PublisherSubscriber,
}

impl Role {
    #[inline]
    pub fn allows(&self, action: Action) -> bool {
        matches!(
            (self, action),
            (Role::PublisherSubscriber, _)
                | (Role::Publisher, Action::Publish)
                | (Role::Subscriber, Action::Subscribe)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: EndpointId,
    pub name: String,
    pub endpoint_type: EndpointType,
    pub role: Role,
    #[serde(default = "EndpointConfig::is_active_default")]
    pub is_active: bool,
    /// `pub=`/`sub=` lines, one pattern per line
    #[serde(default)]
    pub topic_patterns: String,
}

impl EndpointConfig {
    fn is_active_default() -> bool {
        true
    }
}

/// A publisher and/or subscriber. Never mutated in place, an edit builds a new one.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub endpoint_type: EndpointType,
    pub role: Role,
    pub is_active: bool,
    patterns: Patterns,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        let patterns = Patterns::parse(&config.topic_patterns);
        Self {
            id: config.id,
            name: config.name,
            endpoint_type: config.endpoint_type,
            role: config.role,
            is_active: config.is_active,
            patterns,
        }
    }

    #[inline]
    pub fn patterns(&self) -> &Patterns {
        &self.patterns
    }

    /// The pattern that allows `action` on `topic_name`, if any.
    pub fn is_allowed(&self, action: Action, topic_name: &str) -> Option<String> {
        if !self.role.allows(action) {
            return None;
        }
        self.patterns.is_allowed(action, topic_name).map(|p| p.as_str().to_owned())
    }
}

#[derive(Default)]
pub(crate) struct EndpointRegistry {
    endpoints: HashMap<EndpointId, Endpoint>,
    name_to_id: HashMap<String, EndpointId>,
}

impl EndpointRegistry {
    /// Adds or wholesale replaces an endpoint.
    pub fn set(&mut self, endpoint: Endpoint) {
        if let Some(old) = self.endpoints.get(&endpoint.id) {
            if old.name != endpoint.name {
                self.name_to_id.remove(&old.name);
            }
        }
        self.name_to_id.insert(endpoint.name.clone(), endpoint.id);
        self.endpoints.insert(endpoint.id, endpoint);
    }

    pub fn remove(&mut self, id: EndpointId) -> Option<Endpoint> {
        let endpoint = self.endpoints.remove(&id)?;
        self.name_to_id.remove(&endpoint.name);
        Some(endpoint)
    }

    #[inline]
    pub fn contains(&self, id: EndpointId) -> bool {
        self.endpoints.contains_key(&id)
    }

    #[inline]
    pub fn get(&self, id: EndpointId) -> Result<&Endpoint> {
        Ok(self.endpoints.get(&id).ok_or_else(|| PubSubError::not_found(Kind::Endpoint, id))?)
    }

    #[inline]
    pub fn get_by_name(&self, name: &str) -> Result<&Endpoint> {
        self.name_to_id
            .get(name)
            .and_then(|id| self.endpoints.get(id))
            .ok_or_else(|| PubSubError::not_found(Kind::Endpoint, name).into())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }
}
