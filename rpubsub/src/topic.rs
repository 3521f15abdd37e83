use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;

use rpubsub_utils::deserialize_duration;

use crate::error::{Kind, PubSubError};
use crate::hook::TopicHooks;
use crate::types::{HashMap, TimestampMillis, TopicId, TopicName};
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub id: TopicId,
    pub name: TopicName,
    #[serde(default)]
    pub has_gd: bool,
    #[serde(default = "TopicConfig::max_depth_gd_default")]
    pub max_depth_gd: usize,
    #[serde(default = "TopicConfig::max_depth_non_gd_default")]
    pub max_depth_non_gd: usize,
    #[serde(default = "TopicConfig::task_sync_interval_default", deserialize_with = "deserialize_duration")]
    pub task_sync_interval: Duration,
    #[serde(default = "TopicConfig::task_delivery_interval_default", deserialize_with = "deserialize_duration")]
    pub task_delivery_interval: Duration,
    #[serde(default)]
    pub hook_service_id: Option<String>,
    #[serde(default = "TopicConfig::is_active_default")]
    pub is_active: bool,
}

impl TopicConfig {
    pub fn new<N: Into<TopicName>>(id: TopicId, name: N) -> Self {
        Self {
            id,
            name: name.into(),
            has_gd: false,
            max_depth_gd: Self::max_depth_gd_default(),
            max_depth_non_gd: Self::max_depth_non_gd_default(),
            task_sync_interval: Self::task_sync_interval_default(),
            task_delivery_interval: Self::task_delivery_interval_default(),
            hook_service_id: None,
            is_active: Self::is_active_default(),
        }
    }

    fn max_depth_gd_default() -> usize {
        10_000
    }
    fn max_depth_non_gd_default() -> usize {
        1_000
    }
    fn task_sync_interval_default() -> Duration {
        Duration::from_millis(500)
    }
    fn task_delivery_interval_default() -> Duration {
        Duration::from_millis(2000)
    }
    fn is_active_default() -> bool {
        true
    }
}

/// A topic together with its dirty flags and publication counters.
#[derive(Debug, Clone)]
pub struct Topic {
    pub id: TopicId,
    pub name: TopicName,
    pub has_gd: bool,
    pub max_depth_gd: usize,
    pub max_depth_non_gd: usize,
    pub task_sync_interval: Duration,
    pub task_delivery_interval: Duration,
    pub hook_service_id: Option<String>,
    pub is_active: bool,
    pub hooks: TopicHooks,

    pub sync_has_gd_msg: bool,
    pub sync_has_non_gd_msg: bool,
    ///High-water mark of GD publication times seen since the last sync
    pub gd_pub_time_max: TimestampMillis,

    pub msg_pub_counter: u64,
    pub msg_pub_counter_gd: u64,
    pub msg_pub_counter_non_gd: u64,
    pub last_synced: TimestampMillis,
    pub last_pub_time: TimestampMillis,
}

impl Topic {
    pub fn new(config: TopicConfig, hooks: TopicHooks) -> Self {
        Self {
            id: config.id,
            name: config.name,
            has_gd: config.has_gd,
            max_depth_gd: config.max_depth_gd,
            max_depth_non_gd: config.max_depth_non_gd,
            task_sync_interval: config.task_sync_interval,
            task_delivery_interval: config.task_delivery_interval,
            hook_service_id: config.hook_service_id,
            is_active: config.is_active,
            hooks,
            sync_has_gd_msg: false,
            sync_has_non_gd_msg: false,
            gd_pub_time_max: 0,
            msg_pub_counter: 0,
            msg_pub_counter_gd: 0,
            msg_pub_counter_non_gd: 0,
            last_synced: 0,
            last_pub_time: 0,
        }
    }

    /// Builds the edited topic, counters and pending flags carry over.
    pub fn edited(&self, config: TopicConfig, hooks: TopicHooks) -> Self {
        Self {
            sync_has_gd_msg: self.sync_has_gd_msg,
            sync_has_non_gd_msg: self.sync_has_non_gd_msg,
            gd_pub_time_max: self.gd_pub_time_max,
            msg_pub_counter: self.msg_pub_counter,
            msg_pub_counter_gd: self.msg_pub_counter_gd,
            msg_pub_counter_non_gd: self.msg_pub_counter_non_gd,
            last_synced: self.last_synced,
            last_pub_time: self.last_pub_time,
            ..Topic::new(config, hooks)
        }
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.sync_has_gd_msg || self.sync_has_non_gd_msg
    }

    #[inline]
    pub fn needs_task_sync(&self, now: TimestampMillis) -> bool {
        now - self.last_synced >= self.task_sync_interval.as_millis() as i64
    }

    #[inline]
    pub fn set_sync_has_msg(&mut self, is_gd: bool, gd_pub_time_max: TimestampMillis) {
        if is_gd {
            self.sync_has_gd_msg = true;
            self.gd_pub_time_max = self.gd_pub_time_max.max(gd_pub_time_max);
        } else {
            self.sync_has_non_gd_msg = true;
        }
    }

    #[inline]
    pub fn incr_pub_counter(&mut self, has_gd: bool, pub_time: TimestampMillis) {
        self.msg_pub_counter += 1;
        if has_gd {
            self.msg_pub_counter_gd += 1;
        } else {
            self.msg_pub_counter_non_gd += 1;
        }
        self.last_pub_time = self.last_pub_time.max(pub_time);
    }
}

#[derive(Default)]
pub(crate) struct TopicRegistry {
    topics: HashMap<TopicId, Topic>,
    name_to_id: HashMap<TopicName, TopicId>,
}

impl TopicRegistry {
    /// Inserts or replaces a topic, names stay unique across ids.
    pub fn set(&mut self, topic: Topic) -> Result<()> {
        if let Some(other) = self.name_to_id.get(&topic.name) {
            if *other != topic.id {
                return Err(anyhow!("topic name {} already in use by topic {}", topic.name, other));
            }
        }
        if let Some(old) = self.topics.get(&topic.id) {
            if old.name != topic.name {
                self.name_to_id.remove(&old.name);
            }
        }
        self.name_to_id.insert(topic.name.clone(), topic.id);
        self.topics.insert(topic.id, topic);
        Ok(())
    }

    pub fn remove(&mut self, id: TopicId) -> Option<Topic> {
        let topic = self.topics.remove(&id)?;
        self.name_to_id.remove(&topic.name);
        Some(topic)
    }

    #[inline]
    pub fn get(&self, id: TopicId) -> Result<&Topic> {
        Ok(self.topics.get(&id).ok_or_else(|| PubSubError::not_found(Kind::Topic, id))?)
    }

    #[inline]
    pub fn get_mut(&mut self, id: TopicId) -> Result<&mut Topic> {
        Ok(self.topics.get_mut(&id).ok_or_else(|| PubSubError::not_found(Kind::Topic, id))?)
    }

    #[inline]
    pub fn id_by_name(&self, name: &str) -> Result<TopicId> {
        Ok(*self.name_to_id.get(name).ok_or_else(|| PubSubError::not_found(Kind::Topic, name))?)
    }

    #[inline]
    pub fn get_by_name(&self, name: &str) -> Result<&Topic> {
        self.get(self.id_by_name(name)?)
    }

    #[inline]
    pub fn get_by_name_mut(&mut self, name: &str) -> Result<&mut Topic> {
        let id = self.id_by_name(name)?;
        self.get_mut(id)
    }

    #[inline]
    pub fn contains_name(&self, name: &str) -> bool {
        self.name_to_id.contains_key(name)
    }

    #[inline]
    pub fn values(&self) -> impl Iterator<Item = &Topic> {
        self.topics.values()
    }

    #[inline]
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Topic> {
        self.topics.values_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.topics.len()
    }
}
