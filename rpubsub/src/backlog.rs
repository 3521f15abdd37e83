//! In-RAM backlog of non-GD messages.
//!
//! Each message is stored once and referenced from the FIFO queue of every
//! sub_key it is still pending for. A message disappears when no sub_key
//! references it any longer. Queues are bounded per sub_key by the topic's
//! `max_depth_non_gd`, the oldest entries are evicted first.

use std::collections::VecDeque;
use std::sync::Arc;

use itertools::Itertools;

pub use rpubsub_conf::OverflowPolicy;

use crate::types::{HashMap, HashSet, MessageRef, MsgId, SubKey, SubKeys, TimestampMillis, TopicId, TopicName};

/// Log target used for evicted messages, routable to its own file.
pub const OVERFLOW_TARGET: &str = "pubsub_overflow";

struct Entry {
    msg: MessageRef,
    pending: HashSet<SubKey>,
}

pub(crate) struct InRamBacklog {
    policy: OverflowPolicy,
    msgs: HashMap<MsgId, Entry>,
    queues: HashMap<SubKey, VecDeque<MsgId>>,
    topic_msgs: HashMap<TopicId, HashSet<MsgId>>,
}

impl InRamBacklog {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            policy,
            msgs: HashMap::default(),
            queues: HashMap::default(),
            topic_msgs: HashMap::default(),
        }
    }

    /// Appends every message to the queue of every sub_key, evicting from the
    /// head of a queue once it grows past `max_depth_non_gd`. Returns the number
    /// of evicted entries.
    pub fn add_messages(
        &mut self,
        topic_id: TopicId,
        max_depth_non_gd: usize,
        sub_keys: &[SubKey],
        messages: &[MessageRef],
    ) -> usize {
        if sub_keys.is_empty() {
            return 0;
        }
        for msg in messages {
            let entry = self
                .msgs
                .entry(msg.pub_msg_id.clone())
                .or_insert_with(|| Entry { msg: msg.clone(), pending: HashSet::default() });
            self.topic_msgs.entry(topic_id).or_default().insert(msg.pub_msg_id.clone());
            for sub_key in sub_keys {
                if entry.pending.insert(sub_key.clone()) {
                    self.queues.entry(sub_key.clone()).or_default().push_back(msg.pub_msg_id.clone());
                }
            }
        }

        let mut evicted = 0;
        for sub_key in sub_keys {
            evicted += self.trim(topic_id, sub_key, max_depth_non_gd);
        }
        evicted
    }

    fn trim(&mut self, topic_id: TopicId, sub_key: &SubKey, max_depth: usize) -> usize {
        let overflow = match self.queues.get_mut(sub_key) {
            Some(queue) if queue.len() > max_depth => {
                let n = queue.len() - max_depth;
                queue.drain(..n).collect::<Vec<_>>()
            }
            _ => return 0,
        };
        for msg_id in overflow.iter() {
            if self.policy == OverflowPolicy::Log {
                if let Some(entry) = self.msgs.get(msg_id) {
                    log::warn!(
                        target: OVERFLOW_TARGET,
                        "Reached max in-RAM delivery depth of {} for topic_id: {}, sub_key: {}, evicted msg_id: {}, pub_time: {}, data: {:?}",
                        max_depth,
                        topic_id,
                        sub_key,
                        msg_id,
                        entry.msg.pub_time,
                        entry.msg.data
                    );
                }
            }
            self.release(msg_id, sub_key);
        }
        if self.policy == OverflowPolicy::Drop {
            log::debug!(
                "Dropped {} message(s) over max in-RAM delivery depth of {} for sub_key: {}",
                overflow.len(),
                max_depth,
                sub_key
            );
        }
        overflow.len()
    }

    /// Forgets that `msg_id` is pending for `sub_key`, dropping the message once nobody needs it.
    fn release(&mut self, msg_id: &MsgId, sub_key: &SubKey) {
        let unused = match self.msgs.get_mut(msg_id) {
            Some(entry) => {
                entry.pending.remove(sub_key);
                entry.pending.is_empty()
            }
            None => false,
        };
        if unused {
            self.forget(msg_id);
        }
    }

    fn forget(&mut self, msg_id: &MsgId) -> Option<Entry> {
        let entry = self.msgs.remove(msg_id)?;
        if let Some(ids) = self.topic_msgs.get_mut(&entry.msg.topic_id) {
            ids.remove(msg_id);
            if ids.is_empty() {
                self.topic_msgs.remove(&entry.msg.topic_id);
            }
        }
        Some(entry)
    }

    #[inline]
    pub fn has_messages_by_sub_key(&self, sub_key: &str) -> bool {
        self.queues.get(sub_key).map(|q| !q.is_empty()).unwrap_or_default()
    }

    #[inline]
    pub fn queue_len(&self, sub_key: &str) -> usize {
        self.queues.get(sub_key).map(|q| q.len()).unwrap_or_default()
    }

    /// Number of distinct messages held for a topic.
    #[inline]
    pub fn get_topic_depth(&self, topic_id: TopicId) -> usize {
        self.topic_msgs.get(&topic_id).map(|ids| ids.len()).unwrap_or_default()
    }

    /// Queued messages of one sub_key, oldest first, without removing them.
    pub fn get_messages_by_sub_key(&self, sub_key: &str) -> Vec<MessageRef> {
        self.queues
            .get(sub_key)
            .map(|q| q.iter().filter_map(|id| self.msgs.get(id)).map(|e| e.msg.clone()).collect())
            .unwrap_or_default()
    }

    /// Every message held for a topic ordered by publication time.
    pub fn get_messages_by_topic(&self, topic_id: TopicId) -> Vec<MessageRef> {
        self.topic_msgs
            .get(&topic_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.msgs.get(id))
                    .map(|e| e.msg.clone())
                    .sorted_by(|a, b| a.pub_time.cmp(&b.pub_time).then_with(|| a.pub_msg_id.cmp(&b.pub_msg_id)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pops everything queued for the given sub_keys, oldest first per sub_key.
    /// Expired messages are dropped instead of being returned.
    pub fn get_delete_messages_by_sub_keys(
        &mut self,
        sub_keys: &[SubKey],
        now: TimestampMillis,
    ) -> Vec<(SubKey, Vec<MessageRef>)> {
        let mut out = Vec::with_capacity(sub_keys.len());
        for sub_key in sub_keys {
            let Some(queue) = self.queues.remove(sub_key) else {
                continue;
            };
            let mut msgs = Vec::with_capacity(queue.len());
            for msg_id in queue {
                if let Some(entry) = self.msgs.get(&msg_id) {
                    if !entry.msg.is_expired(now) {
                        msgs.push(entry.msg.clone());
                    }
                }
                self.release(&msg_id, sub_key);
            }
            if !msgs.is_empty() {
                out.push((sub_key.clone(), msgs));
            }
        }
        out
    }

    /// Puts popped messages back at the head of a queue, keeping their order.
    pub fn requeue_front(
        &mut self,
        topic_id: TopicId,
        max_depth_non_gd: usize,
        sub_key: &SubKey,
        msgs: &[MessageRef],
    ) -> usize {
        for msg in msgs.iter().rev() {
            let entry = self
                .msgs
                .entry(msg.pub_msg_id.clone())
                .or_insert_with(|| Entry { msg: msg.clone(), pending: HashSet::default() });
            if entry.pending.insert(sub_key.clone()) {
                self.topic_msgs.entry(topic_id).or_default().insert(msg.pub_msg_id.clone());
                self.queues.entry(sub_key.clone()).or_default().push_front(msg.pub_msg_id.clone());
            }
        }
        self.trim(topic_id, sub_key, max_depth_non_gd)
    }

    /// Drops all queued state of the given sub_keys.
    pub fn unsubscribe(&mut self, topic_id: TopicId, sub_keys: &[SubKey]) {
        for sub_key in sub_keys {
            if let Some(queue) = self.queues.remove(sub_key) {
                log::debug!("Dropping {} in-RAM message(s) of sub_key: {}, topic_id: {}", queue.len(), sub_key, topic_id);
                for msg_id in queue {
                    self.release(&msg_id, sub_key);
                }
            }
        }
    }

    /// Acknowledges messages of one sub_key, returns the ids that were queued for it.
    pub fn ack(&mut self, sub_key: &SubKey, msg_ids: &[MsgId]) -> Vec<MsgId> {
        let mut acked = Vec::new();
        for msg_id in msg_ids {
            let queued = self.msgs.get(msg_id).map(|e| e.pending.contains(sub_key)).unwrap_or_default();
            if queued {
                self.remove_from_queue(sub_key, msg_id);
                self.release(msg_id, sub_key);
                acked.push(msg_id.clone());
            }
        }
        acked
    }

    /// Removes messages regardless of which sub_keys still wait for them.
    pub fn delete_messages(&mut self, msg_ids: &[MsgId]) -> Vec<MsgId> {
        let mut deleted = Vec::new();
        for msg_id in msg_ids {
            if let Some(entry) = self.forget(msg_id) {
                for sub_key in entry.pending.iter() {
                    self.remove_from_queue(sub_key, msg_id);
                }
                deleted.push(msg_id.clone());
            }
        }
        deleted
    }

    fn remove_from_queue(&mut self, sub_key: &SubKey, msg_id: &MsgId) {
        if let Some(queue) = self.queues.get_mut(sub_key) {
            queue.retain(|id| id != msg_id);
            if queue.is_empty() {
                self.queues.remove(sub_key);
            }
        }
    }

    /// Removes all messages of a topic.
    pub fn clear_topic(&mut self, topic_id: TopicId) -> usize {
        let ids = self.topic_msgs.get(&topic_id).map(|ids| ids.iter().cloned().collect::<Vec<_>>());
        ids.map(|ids| self.delete_messages(&ids).len()).unwrap_or_default()
    }

    /// Rewrites the topic name carried by every queued message of a topic.
    pub fn rename_topic(&mut self, topic_id: TopicId, new_name: &TopicName) -> usize {
        let Some(ids) = self.topic_msgs.get(&topic_id) else {
            return 0;
        };
        let mut renamed = 0;
        for msg_id in ids {
            if let Some(entry) = self.msgs.get_mut(msg_id) {
                let mut msg = entry.msg.as_ref().clone();
                msg.topic_name = new_name.clone();
                entry.msg = Arc::new(msg);
                renamed += 1;
            }
        }
        renamed
    }

    /// Removes every message whose expiration time has passed.
    pub fn delete_expired(&mut self, now: TimestampMillis) -> Vec<MsgId> {
        let expired = self.msgs.values().filter(|e| e.msg.is_expired(now)).map(|e| e.msg.pub_msg_id.clone()).collect::<Vec<_>>();
        self.delete_messages(&expired)
    }

    /// Sub_keys that currently have something queued, restricted to `sub_keys`.
    pub fn non_empty(&self, sub_keys: &[SubKey]) -> SubKeys {
        sub_keys.iter().filter(|sk| self.has_messages_by_sub_key(sk)).cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.msgs.len()
    }
}
