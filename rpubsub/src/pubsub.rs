//! The broker facade.
//!
//! [`PubSub`] owns every registry, the in-RAM backlog and the delivery-server
//! directory behind one lock. Each public method takes the lock for as long as
//! it touches state and never across an `.await`; durable store queries, peer
//! RPC, hooks and delivery tasks all run with the lock released. Two callers
//! may therefore race on discovery, the last writer wins.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use itertools::Itertools;
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;

use rpubsub_utils::timestamp_millis;

use crate::acl::Action;
use crate::backlog::InRamBacklog;
use crate::broadcast::BrokerMessage;
use crate::context::ServerContext;
use crate::delivery::{DeliveryBatch, DeliveryReport};
use crate::directory::{self, Directory, Discovery, SubKeyServer, TaskServers, Unresolved};
use crate::endpoint::{Endpoint, EndpointConfig, EndpointRegistry};
use crate::error::{Kind, PubSubError};
use crate::hook::{HookAction, Parameter, TopicHooks};
use crate::rpc::{Message as RpcMessage, MessageReply};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::topic::{Topic, TopicConfig, TopicRegistry};
use crate::types::{
    new_msg_id, new_sub_key, DeliveryMode, EndpointId, EndpointType, HashMap, HashSet, Message, MessageRef, MsgId,
    Priority, SubKey, SubKeys, TimestampMillis, TopicId, TopicName, EXPIRATION_NEVER, PRIORITY_DEFAULT,
};
use crate::Result;

/// Placeholder for empty cells of [`PubSub::format_sk_servers`].
pub const SK_SERVERS_DEFAULT: &str = "---";

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub topic_name: TopicName,
    pub endpoint_id: EndpointId,
    ///Reuse a known sub_key, a new one is generated otherwise
    #[serde(default)]
    pub sub_key: Option<SubKey>,
    #[serde(default = "SubscribeRequest::delivery_mode_default")]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub ext_client_id: Option<String>,
}

impl SubscribeRequest {
    pub fn new<T: Into<TopicName>>(topic_name: T, endpoint_id: EndpointId) -> Self {
        Self {
            topic_name: topic_name.into(),
            endpoint_id,
            sub_key: None,
            delivery_mode: Self::delivery_mode_default(),
            ext_client_id: None,
        }
    }

    fn delivery_mode_default() -> DeliveryMode {
        DeliveryMode::Notify
    }
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic_name: TopicName,
    pub published_by_id: EndpointId,
    pub data: Bytes,
    pub msg_id: Option<MsgId>,
    ///`None` follows the topic, `Some(true)` on a topic without GD is an error
    pub has_gd: Option<bool>,
    pub priority: Priority,
    pub expiration: Option<Duration>,
}

impl PublishRequest {
    pub fn new<T: Into<TopicName>>(topic_name: T, published_by_id: EndpointId, data: Bytes) -> Self {
        Self {
            topic_name: topic_name.into(),
            published_by_id,
            data,
            msg_id: None,
            has_gd: None,
            priority: PRIORITY_DEFAULT,
            expiration: None,
        }
    }
}

/// One topic the sync trigger has to notify subscribers of.
#[derive(Debug, Clone)]
pub(crate) struct SyncWork {
    pub topic_id: TopicId,
    pub topic_name: TopicName,
    pub has_gd: bool,
    pub gd_pub_time_max: TimestampMillis,
    pub sub_keys: SubKeys,
}

struct State {
    endpoints: EndpointRegistry,
    topics: TopicRegistry,
    subscriptions: SubscriptionRegistry,
    backlog: InRamBacklog,
    servers: Directory,
}

impl State {
    fn delete_subscription(&mut self, sub_key: &str) -> Option<Subscription> {
        let sub = self.subscriptions.remove(sub_key)?;
        let topic_id = self.topics.id_by_name(&sub.topic_name).unwrap_or_default();
        self.backlog.unsubscribe(topic_id, std::slice::from_ref(&sub.sub_key));
        self.servers.remove(sub_key);
        Some(sub)
    }

    fn set_sub_key_server(&mut self, server: SubKeyServer, ignore_missing_sub: bool) -> Result<()> {
        match self.subscriptions.get(&server.sub_key) {
            Ok(sub) => {
                //Messages may have waited for this server, let the next tick pick them up
                if self.backlog.has_messages_by_sub_key(&server.sub_key) {
                    if let Ok(topic) = self.topics.get_by_name_mut(&sub.topic_name) {
                        topic.set_sync_has_msg(false, 0);
                    }
                }
            }
            Err(e) if !ignore_missing_sub => return Err(e),
            Err(_) => {}
        }

        log::info!(
            "Set sk_server for sub_key: {} (wsx:{}) - {}:{:?}",
            server.sub_key,
            server.is_wsx(),
            server.server_name,
            server.server_pid
        );
        self.servers.set(server);
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("current sk_servers:\n{}", self.servers.format_table(SK_SERVERS_DEFAULT));
        }
        Ok(())
    }

    fn store_in_ram(&mut self, topic_id: TopicId, sub_keys: &[SubKey], msgs: &[MessageRef]) -> Result<usize> {
        let topic = self.topics.get_mut(topic_id)?;
        if let Some(gd) = msgs.iter().find(|m| m.has_gd) {
            return Err(PubSubError::DurabilityMismatch {
                topic: topic.name.to_string(),
                reason: format!("GD message {} cannot be kept in RAM", gd.pub_msg_id),
            }
            .into());
        }
        let evicted = self.backlog.add_messages(topic_id, topic.max_depth_non_gd, sub_keys, msgs);
        if !sub_keys.is_empty() && !msgs.is_empty() {
            topic.set_sync_has_msg(false, 0);
        }
        Ok(evicted)
    }

    /// Puts messages back at the head of a sub_key's queue, optionally re-arming its topic.
    fn requeue(&mut self, sub_key: &SubKey, msgs: &[MessageRef], rearm: Option<(bool, TimestampMillis)>) {
        let Ok(sub) = self.subscriptions.get(sub_key) else {
            log::debug!("Not requeueing {} message(s), sub_key: {} is gone", msgs.len(), sub_key);
            return;
        };
        let Ok(topic) = self.topics.get_by_name_mut(&sub.topic_name) else {
            return;
        };
        if !msgs.is_empty() {
            self.backlog.requeue_front(topic.id, topic.max_depth_non_gd, sub_key, msgs);
        }
        if let Some((has_gd, gd_pub_time_max)) = rearm {
            if !msgs.is_empty() {
                topic.set_sync_has_msg(false, 0);
            }
            if has_gd {
                topic.set_sync_has_msg(true, gd_pub_time_max);
            }
        }
    }
}

#[derive(Clone)]
pub struct PubSub {
    inner: Arc<PubSubInner>,
}

struct PubSubInner {
    scx: ServerContext,
    state: Mutex<State>,
}

impl PubSub {
    pub fn new(scx: ServerContext) -> Self {
        let policy = scx.settings.pubsub.overflow_policy;
        let state = State {
            endpoints: EndpointRegistry::default(),
            topics: TopicRegistry::default(),
            subscriptions: SubscriptionRegistry::default(),
            backlog: InRamBacklog::new(policy),
            servers: Directory::default(),
        };
        Self { inner: Arc::new(PubSubInner { scx, state: Mutex::new(state) }) }
    }

    #[inline]
    pub fn scx(&self) -> &ServerContext {
        &self.inner.scx
    }

    #[inline]
    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock()
    }

    // ---- endpoints ----

    pub fn create_endpoint(&self, config: EndpointConfig) {
        log::debug!("Creating endpoint {}, {}", config.id, config.name);
        self.state().endpoints.set(Endpoint::new(config));
    }

    /// Replaces the endpoint wholesale, its subscriptions are kept.
    pub fn edit_endpoint(&self, config: EndpointConfig) {
        log::debug!("Editing endpoint {}, {}", config.id, config.name);
        self.state().endpoints.set(Endpoint::new(config));
    }

    /// Removes the endpoint and every subscription it owns.
    pub fn delete_endpoint(&self, endpoint_id: EndpointId) -> Vec<Subscription> {
        let mut state = self.state();
        if state.endpoints.remove(endpoint_id).is_none() {
            log::info!("Could not find endpoint {} to delete, ignored", endpoint_id);
        }
        let sub_keys = state.subscriptions.by_endpoint(endpoint_id).map(|s| s.sub_key.clone()).collect::<Vec<_>>();
        sub_keys.iter().filter_map(|sk| state.delete_subscription(sk)).collect()
    }

    #[inline]
    pub fn get_endpoint(&self, endpoint_id: EndpointId) -> Result<Endpoint> {
        self.state().endpoints.get(endpoint_id).cloned()
    }

    #[inline]
    pub fn get_endpoint_by_name(&self, name: &str) -> Result<Endpoint> {
        self.state().endpoints.get_by_name(name).cloned()
    }

    /// The publish pattern of `endpoint_id` matching `topic_name`, if any.
    #[inline]
    pub fn is_allowed_pub_topic(&self, endpoint_id: EndpointId, topic_name: &str) -> Result<Option<String>> {
        Ok(self.state().endpoints.get(endpoint_id)?.is_allowed(Action::Publish, topic_name))
    }

    /// The subscribe pattern of `endpoint_id` matching `topic_name`, if any.
    #[inline]
    pub fn is_allowed_sub_topic(&self, endpoint_id: EndpointId, topic_name: &str) -> Result<Option<String>> {
        Ok(self.state().endpoints.get(endpoint_id)?.is_allowed(Action::Subscribe, topic_name))
    }

    // ---- topics ----

    pub fn create_topic(&self, config: TopicConfig) -> Result<()> {
        let hooks = self.scx().hooks.resolve(config.hook_service_id.as_deref())?;
        log::debug!("Creating topic {}, {}, hooks: {:?}", config.id, config.name, hooks);
        self.state().topics.set(Topic::new(config, hooks))
    }

    /// Applies a new configuration, a rename moves the topic's subscriptions along.
    pub fn edit_topic(&self, config: TopicConfig) -> Result<()> {
        let hooks = self.scx().hooks.resolve(config.hook_service_id.as_deref())?;
        let mut state = self.state();
        let config_id = config.id;
        let old = state.topics.get(config.id)?;
        let old_name = old.name.clone();
        let topic = old.edited(config, hooks);
        let new_name = topic.name.clone();
        state.topics.set(topic)?;
        if old_name != new_name {
            log::info!("Topic renamed from {} to {}", old_name, new_name);
            state.subscriptions.rename_topic(&old_name, &new_name);
            state.backlog.rename_topic(config_id, &new_name);
        }
        Ok(())
    }

    /// Removes the topic, its subscriptions, their directory records and its backlog.
    pub fn delete_topic(&self, topic_id: TopicId) -> Result<Vec<Subscription>> {
        let mut state = self.state();
        let name = state.topics.get(topic_id)?.name.clone();
        let sub_keys = state.subscriptions.sub_keys_by_topic(&name).to_vec();
        let removed = sub_keys.iter().filter_map(|sk| state.delete_subscription(sk)).collect::<Vec<_>>();
        state.backlog.clear_topic(topic_id);
        state.topics.remove(topic_id);
        log::info!("Deleted topic {}, {}, with {} subscription(s)", topic_id, name, removed.len());
        Ok(removed)
    }

    #[inline]
    pub fn get_topic(&self, topic_id: TopicId) -> Result<Topic> {
        self.state().topics.get(topic_id).cloned()
    }

    #[inline]
    pub fn get_topic_by_name(&self, name: &str) -> Result<Topic> {
        self.state().topics.get_by_name(name).cloned()
    }

    // ---- subscriptions ----

    /// Registers a subscription, returns false when its sub_key already exists.
    pub fn add_subscription(&self, sub: Subscription) -> bool {
        let sub_key = sub.sub_key.clone();
        let added = self.state().subscriptions.add(sub);
        if !added {
            log::debug!("Subscription for sub_key: {} already exists, ignored", sub_key);
        }
        added
    }

    /// Subscribes an endpoint to a topic, fires `on_subscribed` and tells the
    /// rest of the cluster. Subscribing with a known sub_key returns the existing subscription.
    pub async fn subscribe(&self, req: SubscribeRequest) -> Result<Subscription> {
        let (sub, hooks, created) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let endpoint = state.endpoints.get(req.endpoint_id)?;
            let topic = state.topics.get_by_name(&req.topic_name)?;
            let pattern = endpoint.is_allowed(Action::Subscribe, &topic.name);
            if pattern.is_none() {
                log::warn!("Endpoint {} has no subscribe pattern matching topic {}", endpoint.name, topic.name);
            }
            let sub_key = req.sub_key.unwrap_or_else(|| new_sub_key(endpoint.endpoint_type));
            let mut sub = Subscription::new(sub_key, topic.name.clone(), endpoint.id, endpoint.endpoint_type);
            sub.delivery_mode = req.delivery_mode;
            sub.sub_pattern_matched = pattern;
            sub.ext_client_id = req.ext_client_id;
            let hooks = topic.hooks.clone();

            match state.subscriptions.get(&sub.sub_key).ok().cloned() {
                Some(existing) => (existing, hooks, false),
                None => {
                    state.subscriptions.add(sub.clone());
                    (sub, hooks, true)
                }
            }
        };

        if created {
            log::info!("Subscribed sub_key: {} to topic {}", sub.sub_key, sub.topic_name);
            hooks.fire(Parameter::OnSubscribed(sub.clone()));
            if let Err(e) = self.scx().broker.publish(BrokerMessage::SubscriptionCreate(sub.clone())).await {
                log::warn!("Could not broadcast subscription of sub_key: {}, {:?}", sub.sub_key, e);
            }
        }
        Ok(sub)
    }

    #[inline]
    pub fn edit_subscription(&self, sub: Subscription) -> Result<()> {
        self.state().subscriptions.edit(sub)
    }

    /// Removes a subscription from every index. A missing sub_key is NotFound
    /// unless `ignore_missing` is set.
    pub fn delete_subscription(&self, sub_key: &str, ignore_missing: bool) -> Result<Option<Subscription>> {
        match self.state().delete_subscription(sub_key) {
            Some(sub) => Ok(Some(sub)),
            None if ignore_missing => {
                log::info!("Could not find sub_key: {} to delete, ignored", sub_key);
                Ok(None)
            }
            None => Err(PubSubError::not_found(Kind::Subscription, sub_key).into()),
        }
    }

    #[inline]
    pub fn get_subscription_by_sub_key(&self, sub_key: &str) -> Result<Subscription> {
        self.state().subscriptions.get(sub_key).cloned()
    }

    #[inline]
    pub fn get_subscriptions_by_topic(&self, topic_name: &str) -> Vec<Subscription> {
        self.state().subscriptions.by_topic(topic_name).cloned().collect()
    }

    pub fn get_subscriptions_by_endpoint(&self, endpoint_id: EndpointId) -> Vec<Subscription> {
        self.state()
            .subscriptions
            .by_endpoint(endpoint_id)
            .cloned()
            .sorted_by(|a, b| a.sub_key.cmp(&b.sub_key))
            .collect()
    }

    #[inline]
    pub fn has_sub_key(&self, sub_key: &str) -> bool {
        self.state().subscriptions.has_sub_key(sub_key)
    }

    /// The sub_key through which `endpoint_id` is subscribed to `topic_name`, if any.
    pub fn is_subscribed_to(&self, endpoint_id: EndpointId, topic_name: &str) -> Option<SubKey> {
        self.state().subscriptions.by_topic(topic_name).find(|s| s.endpoint_id == endpoint_id).map(|s| s.sub_key.clone())
    }

    /// Topics `endpoint_id` is subscribed to, ordered by name.
    pub fn get_topics_by_endpoint(&self, endpoint_id: EndpointId) -> Vec<Topic> {
        let state = self.state();
        state
            .subscriptions
            .by_endpoint(endpoint_id)
            .filter_map(|s| state.topics.get_by_name(&s.topic_name).ok())
            .unique_by(|t| t.id)
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .cloned()
            .collect()
    }

    /// Batch unsubscribe keyed by topic name. Unknown sub_keys are logged and
    /// skipped. Every removed subscription fires `on_unsubscribed`, has its
    /// local delivery task stopped and is announced to the cluster.
    pub async fn unsubscribe(&self, sub_keys_by_topic: HashMap<TopicName, SubKeys>) -> Vec<Subscription> {
        let removed = {
            let mut guard = self.state();
            let state = &mut *guard;
            let mut removed: Vec<(Subscription, TopicHooks)> = Vec::new();
            for (topic_name, sub_keys) in sub_keys_by_topic.iter() {
                let hooks = state.topics.get_by_name(topic_name).map(|t| t.hooks.clone()).unwrap_or_default();
                for sub_key in sub_keys {
                    match state.subscriptions.get(sub_key) {
                        Ok(sub) if &sub.topic_name != topic_name => {
                            log::warn!(
                                "sub_key: {} belongs to topic {}, not {}, not unsubscribed",
                                sub_key,
                                sub.topic_name,
                                topic_name
                            );
                            continue;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            log::info!("Could not find sub_key: {} to unsubscribe from {}, ignored", sub_key, topic_name);
                            continue;
                        }
                    }
                    if let Some(sub) = state.delete_subscription(sub_key) {
                        removed.push((sub, hooks.clone()));
                    }
                }
            }
            removed
        };

        for (sub, hooks) in removed.iter() {
            hooks.fire(Parameter::OnUnsubscribed(sub.clone()));
            self.scx().delivery.stop(&sub.sub_key).await;
            if let Err(e) = self.scx().broker.publish(BrokerMessage::SubscriptionDelete(sub.sub_key.clone())).await {
                log::warn!("Could not broadcast unsubscription of sub_key: {}, {:?}", sub.sub_key, e);
            }
        }
        removed.into_iter().map(|(sub, _)| sub).collect()
    }

    // ---- messages ----

    /// Publishes one message. Returns its id, or `None` when `before_publish`
    /// decided to skip or discard it.
    pub async fn publish(&self, req: PublishRequest) -> Result<Option<MsgId>> {
        let now = timestamp_millis();
        let (hooks, msg) = {
            let state = self.state();
            let topic = state.topics.get_by_name(&req.topic_name)?;
            if req.has_gd == Some(true) && !topic.has_gd {
                return Err(PubSubError::DurabilityMismatch {
                    topic: topic.name.to_string(),
                    reason: "GD requested on a topic without GD".into(),
                }
                .into());
            }
            let expiration_time = req
                .expiration
                .map(|e| now.saturating_add(e.as_millis() as TimestampMillis))
                .unwrap_or(EXPIRATION_NEVER);
            let msg = Arc::new(Message {
                pub_msg_id: req.msg_id.unwrap_or_else(new_msg_id),
                topic_id: topic.id,
                topic_name: topic.name.clone(),
                pub_time: now,
                expiration_time,
                priority: req.priority,
                has_gd: req.has_gd.unwrap_or(topic.has_gd),
                published_by_id: req.published_by_id,
                data: req.data,
            });
            (topic.hooks.clone(), msg)
        };

        match hooks.before_publish(&msg.topic_name, &msg).await? {
            HookAction::Deliver => {}
            action => {
                log::debug!("Message {} not published, before_publish returned {:?}", msg.pub_msg_id, action);
                return Ok(None);
            }
        }

        if msg.has_gd {
            let sub_keys = self.state().subscriptions.sub_keys_by_topic(&msg.topic_name).to_vec();
            self.scx().store.store_gd_messages(msg.topic_id, &sub_keys, std::slice::from_ref(&msg)).await?;
            let mut state = self.state();
            let topic = state.topics.get_mut(msg.topic_id)?;
            topic.incr_pub_counter(true, msg.pub_time);
            topic.set_sync_has_msg(true, msg.pub_time);
        } else {
            let mut state = self.state();
            let sub_keys = state.subscriptions.sub_keys_by_topic(&msg.topic_name).to_vec();
            state.store_in_ram(msg.topic_id, &sub_keys, std::slice::from_ref(&msg))?;
            state.topics.get_mut(msg.topic_id)?.incr_pub_counter(false, msg.pub_time);
        }
        Ok(Some(msg.pub_msg_id.clone()))
    }

    /// Queues non-GD messages for the given sub_keys, returns how many queue
    /// entries were evicted to stay within the topic's depth.
    #[inline]
    pub fn store_in_ram(&self, topic_id: TopicId, sub_keys: &[SubKey], msgs: &[MessageRef]) -> Result<usize> {
        self.state().store_in_ram(topic_id, sub_keys, msgs)
    }

    #[inline]
    pub fn set_sync_has_msg(&self, topic_id: TopicId, is_gd: bool, gd_pub_time_max: TimestampMillis) -> Result<()> {
        self.state().topics.get_mut(topic_id)?.set_sync_has_msg(is_gd, gd_pub_time_max);
        Ok(())
    }

    /// GD delivery failed downstream, make the next tick try again.
    pub fn after_gd_sync_error(&self, topic_id: TopicId, gd_pub_time_max: TimestampMillis) -> Result<()> {
        log::warn!("GD sync error on topic {}, re-arming with pub_time_max: {}", topic_id, gd_pub_time_max);
        self.set_sync_has_msg(topic_id, true, gd_pub_time_max)
    }

    #[inline]
    pub fn get_topic_depth(&self, topic_id: TopicId) -> usize {
        self.state().backlog.get_topic_depth(topic_id)
    }

    #[inline]
    pub fn has_messages_by_sub_key(&self, sub_key: &str) -> bool {
        self.state().backlog.has_messages_by_sub_key(sub_key)
    }

    #[inline]
    pub fn get_messages_by_sub_key(&self, sub_key: &str) -> Vec<MessageRef> {
        self.state().backlog.get_messages_by_sub_key(sub_key)
    }

    #[inline]
    pub fn get_messages_by_topic(&self, topic_id: TopicId) -> Vec<MessageRef> {
        self.state().backlog.get_messages_by_topic(topic_id)
    }

    pub fn delete_message(&self, msg_id: &MsgId) -> Result<()> {
        if self.state().backlog.delete_messages(std::slice::from_ref(msg_id)).is_empty() {
            return Err(PubSubError::not_found(Kind::Message, msg_id).into());
        }
        Ok(())
    }

    pub fn clear_topic(&self, topic_id: TopicId) -> Result<usize> {
        let mut state = self.state();
        state.topics.get(topic_id)?;
        Ok(state.backlog.clear_topic(topic_id))
    }

    /// A delivery task finished with these messages. In-RAM entries are
    /// dropped, the rest are GD messages and get marked deleted in the store.
    pub async fn on_delivered(&self, sub_key: &SubKey, msg_ids: &[MsgId]) -> Result<()> {
        let (gd_ids, topic_has_gd) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let sub = state.subscriptions.get(sub_key)?;
            let topic_has_gd = state.topics.get_by_name(&sub.topic_name).map(|t| t.has_gd).unwrap_or_default();
            let acked = state.backlog.ack(sub_key, msg_ids);
            let gd_ids = msg_ids.iter().filter(|id| !acked.contains(id)).cloned().collect::<Vec<_>>();
            (gd_ids, topic_has_gd)
        };
        if topic_has_gd && !gd_ids.is_empty() {
            self.scx().store.mark_messages_deleted(sub_key, &gd_ids, timestamp_millis()).await?;
        }
        Ok(())
    }

    // ---- delivery-server directory ----

    /// Records which process delivers for a sub_key. The subscription must
    /// exist unless `ignore_missing_sub` is set.
    #[inline]
    pub fn set_sub_key_server(&self, server: SubKeyServer, ignore_missing_sub: bool) -> Result<()> {
        self.state().set_sub_key_server(server, ignore_missing_sub)
    }

    #[inline]
    pub fn get_delivery_server(&self, sub_key: &str) -> Option<SubKeyServer> {
        self.state().servers.get(sub_key).cloned()
    }

    pub fn delete_sub_key_server(&self, sub_key: &str) -> Option<SubKeyServer> {
        let removed = self.state().servers.remove(sub_key);
        match removed.as_ref() {
            Some(s) => log::info!(
                "Deleting info about delivery server for sub_key: {}, was {}:{:?}",
                sub_key,
                s.server_name,
                s.server_pid
            ),
            None => log::info!(
                "Could not find sub_key: {} while deleting sub_key server, current {}:{}",
                sub_key,
                self.scx().server_name,
                self.scx().pid
            ),
        }
        removed
    }

    /// A WebSocket client went away, forget the sub_keys it handled.
    #[inline]
    pub fn remove_ws_sub_key_server(&self, sub_keys: &[SubKey]) -> usize {
        self.state().servers.remove_many(sub_keys)
    }

    /// Rebuilds a missing directory record from the durable store and a
    /// liveness probe. Never fails, a miss carries its reason.
    pub async fn add_missing_server_for_sub_key(&self, sub_key: &SubKey, is_wsx: bool) -> Discovery {
        let cfg = &self.scx().settings.pubsub;
        let found =
            directory::discover(self.scx().store.as_ref(), &self.scx().rpc, sub_key, is_wsx, cfg.probe_timeout).await;
        let server = match found {
            Ok(server) => server,
            Err(reason) => {
                if reason == Unresolved::NoDurableRecord
                    && cfg.log_if_deliv_server_not_found
                    && (!is_wsx || cfg.log_if_wsx_deliv_server_not_found)
                {
                    log::info!("Could not find a delivery server in the store for sub_key: {} (wsx:{})", sub_key, is_wsx);
                }
                return Err(reason);
            }
        };

        let stored = self.state().set_sub_key_server(server.clone(), false);
        match stored {
            Ok(()) => Ok(server),
            Err(_) => Err(Unresolved::SubscriptionGone),
        }
    }

    /// Delivery servers for many sub_keys, missing records are discovered
    /// concurrently with the lock released. One unreachable server only
    /// affects its own sub_keys.
    pub async fn get_task_servers_by_sub_keys(&self, sub_keys: &[SubKey]) -> TaskServers {
        let mut out = TaskServers::default();
        let mut missing = Vec::new();
        {
            let state = self.state();
            for sub_key in sub_keys {
                match state.servers.get(sub_key) {
                    Some(server) if server.server_pid.is_some() => out.add_found(server),
                    Some(server) => {
                        out.not_found.push((sub_key.clone(), Unresolved::PidUnknown(server.server_name.clone())))
                    }
                    None => match state.subscriptions.get(sub_key) {
                        Ok(sub) => missing.push((sub_key.clone(), sub.is_wsx())),
                        Err(_) => out.not_found.push((sub_key.clone(), Unresolved::SubscriptionGone)),
                    },
                }
            }
        }

        let discovered =
            join_all(missing.iter().map(|(sub_key, is_wsx)| self.add_missing_server_for_sub_key(sub_key, *is_wsx)))
                .await;
        for ((sub_key, _), discovery) in missing.into_iter().zip(discovered) {
            match discovery {
                Ok(server) => out.add_found(&server),
                Err(reason) => out.not_found.push((sub_key, reason)),
            }
        }
        out
    }

    /// Diagnostic table of every directory record, newest first.
    #[inline]
    pub fn format_sk_servers(&self, default: Option<&str>) -> String {
        self.state().servers.format_table(default.unwrap_or(SK_SERVERS_DEFAULT))
    }

    /// A delivery task for `server.sub_key` started in this process, record it
    /// and let the rest of the cluster know.
    pub async fn announce_sub_key_server(&self, server: SubKeyServer) -> Result<()> {
        self.set_sub_key_server(server.clone(), false)?;
        self.scx().broker.publish(BrokerMessage::SubKeyServerSet(server)).await
    }

    // ---- cluster ----

    /// Applies a broadcast from any process of the cluster, this one included.
    pub fn on_broker_message(&self, msg: BrokerMessage) -> Result<()> {
        log::debug!("Broker message {}", msg.action());
        match msg {
            BrokerMessage::SubKeyServerSet(server) => self.set_sub_key_server(server, true),
            BrokerMessage::SubKeyServerDelete(sub_key) => {
                self.delete_sub_key_server(&sub_key);
                Ok(())
            }
            BrokerMessage::SubscriptionCreate(sub) => {
                self.add_subscription(sub);
                Ok(())
            }
            BrokerMessage::SubscriptionDelete(sub_key) => self.delete_subscription(&sub_key, true).map(|_| ()),
            BrokerMessage::WsxClientDisconnected(sub_keys) => {
                let removed = self.remove_ws_sub_key_server(&sub_keys);
                log::debug!("Removed {} of {} sub_key server(s) of a disconnected client", removed, sub_keys.len());
                Ok(())
            }
        }
    }

    /// Serves a peer's request.
    pub async fn handle_rpc(&self, msg: RpcMessage) -> MessageReply {
        match msg {
            RpcMessage::GetServerPidForSubKey(sub_key) => {
                let pid = if self.scx().delivery.has_task(&sub_key) { Some(self.scx().pid) } else { None };
                MessageReply::ServerPid(pid)
            }
            RpcMessage::NotifyPubSubTasks(notify) => {
                //Subscriptions not known here yet stay with the sender
                let (batches, unknown): (Vec<_>, Vec<_>) = {
                    let state = self.state();
                    notify.batches.into_iter().partition(|(sub_key, _)| state.subscriptions.has_sub_key(sub_key))
                };
                for (sub_key, msgs) in batches {
                    let batch = DeliveryBatch {
                        topic_name: notify.topic_name.clone(),
                        has_gd: notify.has_gd,
                        gd_pub_time_max: notify.gd_pub_time_max,
                        messages: msgs.into_iter().map(Arc::new).collect(),
                    };
                    //Failed batches are requeued locally, the sender must not retry them
                    if let Err(e) = self.deliver_local(&sub_key, batch).await {
                        log::warn!("Delivery of a peer's batch failed, sub_key: {}, {:?}", sub_key, e);
                    }
                }
                if unknown.is_empty() {
                    MessageReply::Success
                } else {
                    let sub_keys = unknown.into_iter().map(|(sub_key, _)| sub_key).collect::<Vec<_>>();
                    log::warn!("Rejected notification for unknown sub_key(s): {:?}", sub_keys);
                    MessageReply::Rejected(sub_keys)
                }
            }
            RpcMessage::Ping => MessageReply::Pong,
        }
    }

    /// Hands a batch to the delivery task of `sub_key` in this process.
    ///
    /// `before_delivery` sorts the batch first: skipped messages go back to the
    /// head of the queue, discarded ones are dropped. If the task fails the
    /// deliverable messages are requeued as well, in batch order, and the
    /// topic is re-armed.
    pub async fn deliver_local(&self, sub_key: &SubKey, batch: DeliveryBatch) -> Result<DeliveryReport> {
        let (sub, hooks) = {
            let state = self.state();
            let sub = state.subscriptions.get(sub_key)?.clone();
            let hooks = state.topics.get_by_name(&sub.topic_name).map(|t| t.hooks.clone()).unwrap_or_default();
            (sub, hooks)
        };
        let DeliveryBatch { topic_name, has_gd, gd_pub_time_max, messages } = batch;

        let sorted = hooks.before_delivery(&sub, messages.clone()).await;
        let mut report = DeliveryReport::new(sub_key.clone());
        report.skipped = msg_ids(&sorted.skip);
        report.discarded = msg_ids(&sorted.discard);
        report.warnings = sorted.warnings.into_iter().map(|(_, w)| w).collect();
        let skip = sorted.skip;

        let deliver = sorted.deliver;
        if deliver.is_empty() && !has_gd {
            if !skip.is_empty() {
                self.state().requeue(sub_key, &skip, None);
            }
            return Ok(report);
        }
        if matches!(sub.endpoint_type, EndpointType::Rest | EndpointType::Soap) {
            hooks.fire(Parameter::OnOutgoingInvoke(sub.clone(), deliver.clone()));
        }

        let out = DeliveryBatch { topic_name, has_gd, gd_pub_time_max, messages: deliver.clone() };
        match self.scx().delivery.deliver(sub_key, out).await {
            Ok(()) => {
                if !skip.is_empty() {
                    self.state().requeue(sub_key, &skip, None);
                }
                report.delivered = msg_ids(&deliver);
                Ok(report)
            }
            Err(e) => {
                let discarded = report.discarded.iter().collect::<HashSet<_>>();
                let retry = messages.into_iter().filter(|m| !discarded.contains(&m.pub_msg_id)).collect::<Vec<_>>();
                log::warn!("Delivery task failed for sub_key: {}, requeueing {} message(s)", sub_key, retry.len());
                self.state().requeue(sub_key, &retry, Some((has_gd, gd_pub_time_max)));
                Err(e)
            }
        }
    }

    // ---- sync trigger support ----

    /// Clears the dirty flags of every topic due for a sync and lists the
    /// sub_keys to notify. Pull subscriptions are never notified.
    pub(crate) fn take_sync_work(&self, now: TimestampMillis) -> Vec<SyncWork> {
        let mut guard = self.state();
        let state = &mut *guard;
        let mut works = Vec::new();
        for topic in state.topics.values_mut() {
            if !topic.is_active || !topic.is_dirty() || !topic.needs_task_sync(now) {
                continue;
            }
            topic.last_synced = now;
            let has_gd = std::mem::take(&mut topic.sync_has_gd_msg);
            topic.sync_has_non_gd_msg = false;

            let notify = state
                .subscriptions
                .by_topic(&topic.name)
                .filter(|s| s.delivery_mode == DeliveryMode::Notify)
                .map(|s| s.sub_key.clone())
                .collect::<Vec<_>>();
            let sub_keys = if has_gd { notify } else { state.backlog.non_empty(&notify) };
            if sub_keys.is_empty() {
                continue;
            }
            works.push(SyncWork {
                topic_id: topic.id,
                topic_name: topic.name.clone(),
                has_gd,
                gd_pub_time_max: topic.gd_pub_time_max,
                sub_keys,
            });
        }
        works
    }

    /// Keeps a topic armed while some of its sub_keys have a server that
    /// could not be reached. Returns whether the topic was re-armed.
    pub(crate) fn rearm_unresolved(&self, work: &SyncWork, not_found: &[(SubKey, Unresolved)]) -> bool {
        let mut guard = self.state();
        let state = &mut *guard;
        let retryable = not_found.iter().filter(|(_, reason)| reason.is_retryable()).collect::<Vec<_>>();
        if retryable.is_empty() {
            return false;
        }
        let queued = retryable.iter().any(|(sub_key, _)| state.backlog.has_messages_by_sub_key(sub_key));
        if !queued && !work.has_gd {
            return false;
        }
        let Ok(topic) = state.topics.get_mut(work.topic_id) else {
            return false;
        };
        if queued {
            topic.set_sync_has_msg(false, 0);
        }
        if work.has_gd {
            topic.set_sync_has_msg(true, work.gd_pub_time_max);
        }
        true
    }

    /// Whether a missing delivery server of `sub_key` should be logged at warn.
    pub(crate) fn warn_if_server_not_found(&self, sub_key: &str) -> bool {
        let is_wsx = self.state().subscriptions.get(sub_key).map(|s| s.is_wsx()).unwrap_or_default();
        let conf = &self.scx().settings.pubsub;
        if is_wsx {
            conf.log_if_wsx_deliv_server_not_found
        } else {
            conf.log_if_deliv_server_not_found
        }
    }

    #[inline]
    pub(crate) fn pop_backlog(&self, sub_keys: &[SubKey], now: TimestampMillis) -> Vec<(SubKey, Vec<MessageRef>)> {
        self.state().backlog.get_delete_messages_by_sub_keys(sub_keys, now)
    }

    /// A notification failed, push its messages back and re-arm the topic.
    pub(crate) fn restore_after_failure(&self, work: &SyncWork, failed: &[(SubKey, Vec<MessageRef>)]) {
        let mut state = self.state();
        for (sub_key, msgs) in failed {
            state.requeue(sub_key, msgs, Some((work.has_gd, work.gd_pub_time_max)));
        }
    }

    #[inline]
    pub(crate) fn delete_expired(&self, now: TimestampMillis) -> usize {
        self.state().backlog.delete_expired(now).len()
    }
}

#[inline]
fn msg_ids(msgs: &[MessageRef]) -> Vec<MsgId> {
    msgs.iter().map(|m| m.pub_msg_id.clone()).collect()
}
