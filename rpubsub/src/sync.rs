//! Background loops driving delivery.
//!
//! [`SyncTrigger`] wakes up every `pubsub.sync_interval`, collects the topics
//! whose dirty flags are set and notifies the delivery tasks of their
//! subscribers. Tasks in this process are called directly, tasks owned by a
//! peer get a `NotifyPubSubTasks` RPC. One worker runs per delivery server and
//! a failed notification puts its messages back and re-arms the topic, so the
//! next tick retries it. Sub_keys without a known server keep their messages,
//! the topic stays armed when that server exists but could not be reached.
//!
//! [`CleanupTask`] sweeps expired messages out of the in-RAM backlog.

use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use rpubsub_utils::timestamp_millis;

use crate::delivery::DeliveryBatch;
use crate::directory::{ServerKey, Unresolved};
use crate::pubsub::{PubSub, SyncWork};
use crate::rpc::{Message as RpcMessage, MessageReply, NotifyPubSubTasks};
use crate::types::{MessageRef, SubKey, SubKeys, TimestampMillis};

/// Counters of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub topics: usize,
    pub local: usize,
    pub remote: usize,
    pub failed: usize,
    pub not_found: usize,
    /// Topics kept armed because a known server did not answer
    pub rearmed: usize,
}

pub struct SyncTrigger {
    pubsub: PubSub,
    interval: Duration,
    max_iterations: Option<usize>,
}

impl SyncTrigger {
    pub fn new(pubsub: PubSub) -> Self {
        let cfg = &pubsub.scx().settings.pubsub;
        let interval = cfg.sync_interval;
        let max_iterations = cfg.max_sync_iterations;
        Self { pubsub, interval, max_iterations }
    }

    /// Stop after `n` ticks.
    #[inline]
    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    #[inline]
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        log::info!(
            "Starting pub/sub sync trigger, interval: {:?}, max iterations: {:?}",
            self.interval,
            self.max_iterations
        );
        let mut iterations = 0;
        loop {
            if self.max_iterations.map(|max| iterations >= max).unwrap_or_default() {
                log::info!("Pub/sub sync trigger stopped after {} iteration(s)", iterations);
                break;
            }
            iterations += 1;
            let stats = self.run_once().await;
            if stats.topics > 0 {
                log::debug!("sync tick {}, {:?}", iterations, stats);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One tick of the trigger.
    pub async fn run_once(&self) -> SyncStats {
        let now = timestamp_millis();
        let mut stats = SyncStats::default();
        let works = self.pubsub.take_sync_work(now);
        if works.is_empty() {
            return stats;
        }
        stats.topics = works.len();

        let started = Instant::now();
        let _elapsed = scopeguard::guard(stats.topics, |topics| {
            log::debug!("sync of {} topic(s) took {:?}", topics, started.elapsed());
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        for work in works {
            let servers = self.pubsub.get_task_servers_by_sub_keys(&work.sub_keys).await;
            for (sub_key, reason) in servers.not_found.iter() {
                let warn = match reason {
                    Unresolved::SubscriptionGone => false,
                    Unresolved::NoDurableRecord => self.pubsub.warn_if_server_not_found(sub_key),
                    _ => true,
                };
                if warn {
                    log::warn!(
                        "No delivery server for sub_key: {}, topic: {}, skipping, {}",
                        sub_key,
                        work.topic_name,
                        reason
                    );
                } else {
                    log::debug!(
                        "No delivery server for sub_key: {}, topic: {}, messages stay queued, {}",
                        sub_key,
                        work.topic_name,
                        reason
                    );
                }
            }
            stats.not_found += servers.not_found.len();
            if self.pubsub.rearm_unresolved(&work, &servers.not_found) {
                stats.rearmed += 1;
            }

            for (server, sub_keys) in servers.found {
                let batches = self.batches(&work, &sub_keys, now);
                if batches.is_empty() {
                    continue;
                }
                let local = self.pubsub.scx().is_local(&server.server_name, server.server_pid);
                let worker = Worker { pubsub: self.pubsub.clone(), work: work.clone(), server, batches, local };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let outcome = worker.run().await;
                    if let Err(e) = tx.send(outcome) {
                        log::warn!("sync worker outcome lost, {:?}", e.0.server);
                    }
                });
            }
        }
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            if outcome.local {
                stats.local += 1;
            } else {
                stats.remote += 1;
            }
            if let Some(failed) = outcome.failed {
                stats.failed += 1;
                self.pubsub.restore_after_failure(&outcome.work, &failed);
            }
        }
        stats
    }

    /// Pops the backlog of `sub_keys`. Under GD every sub_key gets a batch,
    /// its task fetches durable messages itself.
    fn batches(&self, work: &SyncWork, sub_keys: &SubKeys, now: TimestampMillis) -> Vec<(SubKey, Vec<MessageRef>)> {
        let mut popped = self.pubsub.pop_backlog(sub_keys, now);
        if work.has_gd {
            for sub_key in sub_keys {
                if !popped.iter().any(|(sk, _)| sk == sub_key) {
                    popped.push((sub_key.clone(), Vec::new()));
                }
            }
        }
        popped
    }
}

struct Worker {
    pubsub: PubSub,
    work: SyncWork,
    server: ServerKey,
    batches: Vec<(SubKey, Vec<MessageRef>)>,
    local: bool,
}

struct Outcome {
    work: SyncWork,
    server: ServerKey,
    local: bool,
    ///Batches to put back, `None` on success
    failed: Option<Vec<(SubKey, Vec<MessageRef>)>>,
}

impl Worker {
    async fn run(self) -> Outcome {
        let Worker { pubsub, work, server, batches, local } = self;
        let failed = if local {
            //Local failures are requeued by deliver_local itself
            join_all(batches.into_iter().map(|(sub_key, messages)| {
                let pubsub = &pubsub;
                let batch = DeliveryBatch {
                    topic_name: work.topic_name.clone(),
                    has_gd: work.has_gd,
                    gd_pub_time_max: work.gd_pub_time_max,
                    messages,
                };
                async move {
                    if let Err(e) = pubsub.deliver_local(&sub_key, batch).await {
                        log::warn!("Local delivery failed, sub_key: {}, {:?}", sub_key, e);
                    }
                }
            }))
            .await;
            None
        } else {
            notify_remote(&pubsub, &work, &server, batches).await
        };
        Outcome { work, server, local, failed }
    }
}

async fn notify_remote(
    pubsub: &PubSub,
    work: &SyncWork,
    server: &ServerKey,
    batches: Vec<(SubKey, Vec<MessageRef>)>,
) -> Option<Vec<(SubKey, Vec<MessageRef>)>> {
    let msg = RpcMessage::NotifyPubSubTasks(NotifyPubSubTasks {
        topic_id: work.topic_id,
        topic_name: work.topic_name.clone(),
        has_gd: work.has_gd,
        gd_pub_time_max: work.gd_pub_time_max,
        batches: batches
            .iter()
            .map(|(sub_key, msgs)| (sub_key.clone(), msgs.iter().map(|m| m.as_ref().clone()).collect()))
            .collect(),
    });
    let timeout = pubsub.scx().settings.pubsub.probe_timeout;
    match pubsub.scx().rpc.send_message(&server.server_name, server.server_pid, msg, timeout).await {
        Ok(MessageReply::Rejected(sub_keys)) => {
            log::warn!(
                "{} does not know sub_key(s) {:?} of topic {} yet, will retry",
                server.server_name,
                sub_keys,
                work.topic_name
            );
            let rejected = batches.into_iter().filter(|(sub_key, _)| sub_keys.contains(sub_key)).collect::<Vec<_>>();
            Some(rejected)
        }
        Ok(_) => None,
        Err(e) => {
            let e = e.into_unreachable(&server.server_name);
            log::warn!(
                "Could not notify {} sub_key(s) of topic {}, {}, will retry",
                batches.len(),
                work.topic_name,
                e
            );
            Some(batches)
        }
    }
}

/// Periodically drops expired messages from the in-RAM backlog.
pub struct CleanupTask {
    pubsub: PubSub,
    interval: Duration,
}

impl CleanupTask {
    pub fn new(pubsub: PubSub) -> Self {
        let interval = pubsub.scx().settings.pubsub.cleanup_interval;
        Self { pubsub, interval }
    }

    #[inline]
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.run_once();
            }
        })
    }

    pub fn run_once(&self) -> usize {
        let removed = self.pubsub.delete_expired(timestamp_millis());
        if removed > 0 {
            log::info!("Removed {} expired in-RAM message(s)", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::directory::SubKeyServer;
    use crate::endpoint::{EndpointConfig, Role};
    use crate::pubsub::{PublishRequest, SubscribeRequest};
    use crate::testing::{message, settings, Harness};
    use crate::topic::TopicConfig;
    use crate::types::{DeliveryMode, EndpointType, Message, MsgId, Pid};

    async fn setup(h: &Harness, sub_keys: &[&str]) {
        h.pubsub.create_endpoint(EndpointConfig {
            id: 1,
            name: "crm".into(),
            endpoint_type: EndpointType::Rest,
            role: Role::PublisherSubscriber,
            is_active: true,
            topic_patterns: "pub=orders\nsub=orders".into(),
        });
        let mut cfg = TopicConfig::new(1, "orders");
        cfg.task_sync_interval = Duration::ZERO;
        h.pubsub.create_topic(cfg).unwrap();
        for sk in sub_keys {
            let mut req = SubscribeRequest::new("orders", 1);
            req.sub_key = Some((*sk).into());
            h.pubsub.subscribe(req).await.unwrap();
        }
    }

    async fn publish(h: &Harness, msg_id: &str) {
        let mut req = PublishRequest::new("orders", 1, Bytes::from_static(b"{}"));
        req.msg_id = Some(msg_id.into());
        h.pubsub.publish(req).await.unwrap();
    }

    fn owner(sub_key: &str, server_name: &str, pid: Pid) -> SubKeyServer {
        SubKeyServer::new(sub_key.into(), 1, server_name.into(), Some(pid), EndpointType::Rest)
    }

    #[tokio::test]
    async fn local_tasks_are_called_directly() {
        let h = Harness::new();
        setup(&h, &["sk1"]).await;
        h.pubsub.set_sub_key_server(owner("sk1", "server1", 100), false).unwrap();
        publish(&h, "m1").await;
        publish(&h, "m2").await;

        let stats = SyncTrigger::new(h.pubsub.clone()).run_once().await;
        assert_eq!(stats, SyncStats { topics: 1, local: 1, ..Default::default() });
        let delivered = h.delivery.delivered();
        assert_eq!(delivered.len(), 1);
        let ids = delivered[0].1.messages.iter().map(|m| m.pub_msg_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![MsgId::from("m1"), MsgId::from("m2")]);
        assert!(!h.pubsub.has_messages_by_sub_key("sk1"));

        //nothing new, nothing to do
        assert_eq!(SyncTrigger::new(h.pubsub.clone()).run_once().await, SyncStats::default());
    }

    #[tokio::test]
    async fn remote_tasks_get_one_notify_per_server() {
        let h = Harness::new();
        setup(&h, &["sk1", "sk2", "sk3"]).await;
        h.pubsub.set_sub_key_server(owner("sk1", "serverA", 200), false).unwrap();
        h.pubsub.set_sub_key_server(owner("sk2", "serverA", 200), false).unwrap();
        h.pubsub.set_sub_key_server(owner("sk3", "serverB", 300), false).unwrap();
        publish(&h, "m1").await;

        let stats = SyncTrigger::new(h.pubsub.clone()).run_once().await;
        assert_eq!(stats.remote, 2);
        assert_eq!(stats.failed, 0);
        let notifies = h.rpc.notifies();
        assert_eq!(notifies.len(), 2);
        let to_a = notifies.iter().find(|(s, _, _)| *s == "serverA").unwrap();
        assert_eq!(to_a.1, Some(200));
        assert_eq!(to_a.2.batches.len(), 2);
        assert_eq!(h.pubsub.get_topic_depth(1), 0);
    }

    #[tokio::test]
    async fn failed_notify_is_retried() {
        let h = Harness::new();
        setup(&h, &["sk1"]).await;
        h.pubsub.set_sub_key_server(owner("sk1", "serverA", 200), false).unwrap();
        h.rpc.set_error("serverA");
        publish(&h, "m1").await;
        publish(&h, "m2").await;

        let trigger = SyncTrigger::new(h.pubsub.clone());
        let stats = trigger.run_once().await;
        assert_eq!(stats.failed, 1);
        let queued = h.pubsub.get_messages_by_sub_key("sk1");
        assert_eq!(queued.iter().map(|m| m.pub_msg_id.to_string()).collect::<Vec<_>>(), vec!["m1", "m2"]);
        assert!(h.pubsub.get_topic(1).unwrap().sync_has_non_gd_msg);

        h.rpc.set_pid("serverA", "sk1", Some(200));
        let stats = trigger.run_once().await;
        assert_eq!((stats.remote, stats.failed), (1, 0));
        assert_eq!(h.rpc.notifies()[0].2.batches[0].1.len(), 2);
        assert!(!h.pubsub.has_messages_by_sub_key("sk1"));
    }

    #[tokio::test]
    async fn unreachable_server_is_retried_next_tick() {
        let h = Harness::new();
        setup(&h, &["sk1"]).await;
        h.store.set_owner("sk1", "serverA", EndpointType::Rest);
        h.rpc.set_slow("serverA");
        publish(&h, "m1").await;

        let trigger = SyncTrigger::new(h.pubsub.clone());
        let stats = trigger.run_once().await;
        assert_eq!(stats, SyncStats { topics: 1, not_found: 1, rearmed: 1, ..Default::default() });
        assert!(h.pubsub.get_topic(1).unwrap().sync_has_non_gd_msg);
        assert!(h.pubsub.has_messages_by_sub_key("sk1"));

        h.rpc.set_pid("serverA", "sk1", Some(200));
        let stats = trigger.run_once().await;
        assert_eq!((stats.topics, stats.remote, stats.failed), (1, 1, 0));
        assert_eq!(h.rpc.notifies().len(), 1);
        assert!(!h.pubsub.has_messages_by_sub_key("sk1"));
    }

    #[tokio::test]
    async fn rejected_sub_keys_stay_queued() {
        let h = Harness::new();
        setup(&h, &["sk1", "sk2"]).await;
        h.pubsub.set_sub_key_server(owner("sk1", "serverA", 200), false).unwrap();
        h.pubsub.set_sub_key_server(owner("sk2", "serverA", 200), false).unwrap();
        h.rpc.set_unknown("sk2");
        publish(&h, "m1").await;

        let stats = SyncTrigger::new(h.pubsub.clone()).run_once().await;
        assert_eq!((stats.remote, stats.failed), (1, 1));
        assert!(!h.pubsub.has_messages_by_sub_key("sk1"));
        let queued = h.pubsub.get_messages_by_sub_key("sk2");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].pub_msg_id, "m1");
        assert!(h.pubsub.get_topic(1).unwrap().sync_has_non_gd_msg);
    }

    #[tokio::test]
    async fn unknown_server_keeps_messages() {
        let h = Harness::new();
        setup(&h, &["sk1"]).await;
        publish(&h, "m1").await;

        let trigger = SyncTrigger::new(h.pubsub.clone());
        let stats = trigger.run_once().await;
        assert_eq!(stats.not_found, 1);
        assert!(h.pubsub.has_messages_by_sub_key("sk1"));
        assert!(!h.pubsub.get_topic(1).unwrap().is_dirty());
        assert_eq!(trigger.run_once().await, SyncStats::default());

        //the owner shows up later, the topic is armed again
        h.store.set_owner("sk1", "serverA", EndpointType::Rest);
        h.rpc.set_pid("serverA", "sk1", Some(200));
        h.pubsub.add_missing_server_for_sub_key(&"sk1".into(), false).await.unwrap();
        let stats = trigger.run_once().await;
        assert_eq!(stats.remote, 1);
        assert!(!h.pubsub.has_messages_by_sub_key("sk1"));
    }

    #[tokio::test]
    async fn discovery_happens_during_sync() {
        let h = Harness::new();
        setup(&h, &["sk1"]).await;
        h.store.set_owner("sk1", "serverA", EndpointType::Rest);
        h.rpc.set_pid("serverA", "sk1", Some(200));
        publish(&h, "m1").await;

        let stats = SyncTrigger::new(h.pubsub.clone()).run_once().await;
        assert_eq!(stats.remote, 1);
        assert_eq!(h.rpc.probes(), 1);
        assert_eq!(h.pubsub.get_delivery_server("sk1").unwrap().server_pid, Some(200));
    }

    #[tokio::test]
    async fn pull_subscriptions_are_not_notified() {
        let h = Harness::new();
        setup(&h, &[]).await;
        let mut req = SubscribeRequest::new("orders", 1);
        req.sub_key = Some("sk.pull".into());
        req.delivery_mode = DeliveryMode::Pull;
        h.pubsub.subscribe(req).await.unwrap();
        h.pubsub.set_sub_key_server(owner("sk.pull", "server1", 100), false).unwrap();
        publish(&h, "m1").await;

        SyncTrigger::new(h.pubsub.clone()).run_once().await;
        assert!(h.delivery.delivered().is_empty());
        assert!(h.pubsub.has_messages_by_sub_key("sk.pull"));
    }

    #[tokio::test]
    async fn gd_notifies_every_subscriber() {
        let h = Harness::new();
        setup(&h, &["sk1"]).await;
        h.pubsub.set_sub_key_server(owner("sk1", "server1", 100), false).unwrap();
        h.pubsub.set_sync_has_msg(1, true, 1_000).unwrap();

        let stats = SyncTrigger::new(h.pubsub.clone()).run_once().await;
        assert_eq!(stats.local, 1);
        let delivered = h.delivery.delivered();
        assert!(delivered[0].1.has_gd);
        assert_eq!(delivered[0].1.gd_pub_time_max, 1_000);
        assert!(delivered[0].1.messages.is_empty());
    }

    #[tokio::test]
    async fn stops_after_max_iterations() {
        let h = Harness::new();
        setup(&h, &["sk1"]).await;
        h.pubsub.set_sub_key_server(owner("sk1", "server1", 100), false).unwrap();
        publish(&h, "m1").await;

        let handle = SyncTrigger::new(h.pubsub.clone()).max_iterations(2).start();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(h.delivery.delivered().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_drops_expired() {
        let h = Harness::with_settings(settings("server1", 100));
        setup(&h, &["sk1"]).await;
        let mut expired = Message::clone(&message("old", 1, 1));
        expired.expiration_time = 2;
        h.pubsub.store_in_ram(1, &["sk1".into()], &[Arc::new(expired), message("new", 1, 3)]).unwrap();

        assert_eq!(CleanupTask::new(h.pubsub.clone()).run_once(), 1);
        let left = h.pubsub.get_messages_by_sub_key("sk1");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].pub_msg_id, "new");
    }
}
