use serde::{Deserialize, Serialize};

use rpubsub_utils::timestamp_millis;

use crate::error::{Kind, PubSubError};
use crate::types::{DeliveryMode, EndpointId, EndpointType, HashMap, SubKey, TimestampMillis, TopicName};
use crate::Result;

/// One endpoint's registered interest in one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub sub_key: SubKey,
    pub topic_name: TopicName,
    pub endpoint_id: EndpointId,
    pub endpoint_type: EndpointType,
    pub delivery_mode: DeliveryMode,
    pub creation_time: TimestampMillis,
    ///Pattern that granted the subscription, kept for auditing
    pub sub_pattern_matched: Option<String>,
    pub ext_client_id: Option<String>,
}

impl Subscription {
    pub fn new(
        sub_key: SubKey,
        topic_name: TopicName,
        endpoint_id: EndpointId,
        endpoint_type: EndpointType,
    ) -> Self {
        Self {
            sub_key,
            topic_name,
            endpoint_id,
            endpoint_type,
            delivery_mode: DeliveryMode::Notify,
            creation_time: timestamp_millis(),
            sub_pattern_matched: None,
            ext_client_id: None,
        }
    }

    #[inline]
    pub fn is_wsx(&self) -> bool {
        self.endpoint_type.is_wsx()
    }
}

/// Topic name to subscription keys, and sub_key to the subscription itself.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_sub_key: HashMap<SubKey, Subscription>,
    by_topic: HashMap<TopicName, Vec<SubKey>>,
}

impl SubscriptionRegistry {
    /// Returns false, leaving state untouched, when the sub_key is already known.
    pub fn add(&mut self, sub: Subscription) -> bool {
        if self.by_sub_key.contains_key(&sub.sub_key) {
            return false;
        }
        self.by_topic.entry(sub.topic_name.clone()).or_default().push(sub.sub_key.clone());
        self.by_sub_key.insert(sub.sub_key.clone(), sub);
        true
    }

    /// Replaces a subscription's attributes, a topic change moves it between lists.
    pub fn edit(&mut self, sub: Subscription) -> Result<()> {
        let old_topic = match self.by_sub_key.get(&sub.sub_key) {
            Some(old) => old.topic_name.clone(),
            None => return Err(PubSubError::not_found(Kind::Subscription, &sub.sub_key).into()),
        };
        if old_topic != sub.topic_name {
            self.unlink(&old_topic, &sub.sub_key);
            self.by_topic.entry(sub.topic_name.clone()).or_default().push(sub.sub_key.clone());
        }
        self.by_sub_key.insert(sub.sub_key.clone(), sub);
        Ok(())
    }

    pub fn remove(&mut self, sub_key: &str) -> Option<Subscription> {
        let sub = self.by_sub_key.remove(sub_key)?;
        self.unlink(&sub.topic_name, sub_key);
        Some(sub)
    }

    fn unlink(&mut self, topic_name: &str, sub_key: &str) {
        if let Some(keys) = self.by_topic.get_mut(topic_name) {
            keys.retain(|k| &**k != sub_key);
            if keys.is_empty() {
                self.by_topic.remove(topic_name);
            }
        }
    }

    #[inline]
    pub fn has_sub_key(&self, sub_key: &str) -> bool {
        self.by_sub_key.contains_key(sub_key)
    }

    #[inline]
    pub fn get(&self, sub_key: &str) -> Result<&Subscription> {
        Ok(self.by_sub_key.get(sub_key).ok_or_else(|| PubSubError::not_found(Kind::Subscription, sub_key))?)
    }

    #[inline]
    pub fn sub_keys_by_topic(&self, topic_name: &str) -> &[SubKey] {
        self.by_topic.get(topic_name).map(|keys| keys.as_slice()).unwrap_or_default()
    }

    pub fn by_topic(&self, topic_name: &str) -> impl Iterator<Item = &Subscription> {
        self.sub_keys_by_topic(topic_name).iter().filter_map(|k| self.by_sub_key.get(k))
    }

    pub fn by_endpoint(&self, endpoint_id: EndpointId) -> impl Iterator<Item = &Subscription> {
        self.by_sub_key.values().filter(move |s| s.endpoint_id == endpoint_id)
    }

    /// Moves a topic's list under its new name and rewrites each subscription.
    pub fn rename_topic(&mut self, old_name: &str, new_name: &TopicName) {
        if let Some(keys) = self.by_topic.remove(old_name) {
            for key in keys.iter() {
                if let Some(sub) = self.by_sub_key.get_mut(key) {
                    sub.topic_name = new_name.clone();
                }
            }
            self.by_topic.insert(new_name.clone(), keys);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_sub_key.len()
    }
}
