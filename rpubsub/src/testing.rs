//! Fixtures and in-memory collaborators shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use rpubsub_conf::{Options, Settings};

use crate::broadcast::{BrokerClient, BrokerMessage};
use crate::context::ServerContext;
use crate::delivery::{DeliveryBatch, DeliveryTask};
use crate::hook::{Handler, HookResult, Parameter, Type};
use crate::pubsub::PubSub;
use crate::rpc::{Message as RpcMessage, MessageReply, NotifyPubSubTasks, ServerRpc};
use crate::store::{DurableServerRecord, DurableStore};
use crate::subscription::Subscription;
use crate::types::{
    EndpointId, EndpointType, HashMap, HashSet, Message, MessageRef, MsgId, Pid, ServerName, SubKey,
    TimestampMillis, TopicId, EXPIRATION_NEVER, PRIORITY_DEFAULT,
};
use crate::Result;

pub(crate) fn message(msg_id: &str, topic_id: TopicId, pub_time: TimestampMillis) -> MessageRef {
    Arc::new(Message {
        pub_msg_id: msg_id.into(),
        topic_id,
        topic_name: "orders".into(),
        pub_time,
        expiration_time: EXPIRATION_NEVER,
        priority: PRIORITY_DEFAULT,
        has_gd: false,
        published_by_id: 1,
        data: Bytes::from_static(b"{}"),
    })
}

pub(crate) fn subscription(sub_key: &str, topic_name: &str, endpoint_id: EndpointId) -> Subscription {
    let mut sub = Subscription::new(sub_key.into(), topic_name.into(), endpoint_id, EndpointType::Rest);
    sub.creation_time = 1_700_000_000_000;
    sub
}

pub(crate) fn settings(server_name: &str, pid: Pid) -> Settings {
    let text = format!(
        "[node]\nserver_name = \"{}\"\npid = {}\n\n[pubsub]\nprobe_timeout = \"100ms\"\nsync_interval = \"10ms\"\n\n[log]\nto = \"off\"",
        server_name, pid
    );
    match Settings::from_toml(&text, Options::default()) {
        Ok(s) => s,
        Err(e) => panic!("test settings, {:?}", e),
    }
}

/// Replies per message id, everything unscripted is delivered.
#[derive(Default)]
pub(crate) struct ScriptedHook {
    only: Option<Type>,
    replies: HashMap<MsgId, HookResult>,
    fails: HashSet<MsgId>,
    calls: AtomicUsize,
}

impl ScriptedHook {
    pub fn only(typ: Type) -> Self {
        Self { only: Some(typ), ..Default::default() }
    }

    pub fn reply(mut self, msg_id: &str, res: HookResult) -> Self {
        self.replies.insert(msg_id.into(), res);
        self
    }

    pub fn fail(mut self, msg_id: &str) -> Self {
        self.fails.insert(msg_id.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for ScriptedHook {
    fn implements(&self, typ: Type) -> bool {
        self.only.map(|only| only == typ).unwrap_or(true)
    }

    async fn hook(&self, param: &Parameter) -> Result<HookResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let msg_id = match param {
            Parameter::BeforePublish(_, msg) | Parameter::BeforeDelivery(_, msg) => &msg.pub_msg_id,
            _ => return Ok(HookResult::default()),
        };
        if self.fails.contains(msg_id) {
            return Err(anyhow::anyhow!("scripted failure for {}", msg_id));
        }
        Ok(self.replies.get(msg_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub(crate) struct MockStore {
    owners: Mutex<HashMap<SubKey, DurableServerRecord>>,
    failing: AtomicBool,
    deleted: Mutex<Vec<(SubKey, Vec<MsgId>)>>,
    stored: Mutex<Vec<MsgId>>,
}

impl MockStore {
    pub fn set_owner(&self, sub_key: &str, server_name: &str, endpoint_type: EndpointType) {
        let record = DurableServerRecord {
            server_name: server_name.into(),
            cluster_id: 1,
            endpoint_type,
            channel_name: None,
            pub_client_id: None,
        };
        self.owners.lock().insert(sub_key.into(), record);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> Vec<(SubKey, Vec<MsgId>)> {
        self.deleted.lock().clone()
    }

    pub fn stored(&self) -> Vec<MsgId> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl DurableStore for MockStore {
    async fn get_delivery_server_for_sub_key(
        &self,
        sub_key: &SubKey,
        _is_wsx: bool,
    ) -> Result<Option<DurableServerRecord>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("store is down"));
        }
        Ok(self.owners.lock().get(sub_key).cloned())
    }

    async fn mark_messages_deleted(&self, sub_key: &SubKey, msg_ids: &[MsgId], _now: TimestampMillis) -> Result<()> {
        self.deleted.lock().push((sub_key.clone(), msg_ids.to_vec()));
        Ok(())
    }

    async fn store_gd_messages(&self, _topic_id: TopicId, _sub_keys: &[SubKey], msgs: &[MessageRef]) -> Result<()> {
        self.stored.lock().extend(msgs.iter().map(|m| m.pub_msg_id.clone()));
        Ok(())
    }
}

/// Peer servers answering probes from a table, slow or failing on demand.
#[derive(Default)]
pub(crate) struct MockRpc {
    pids: Mutex<HashMap<(ServerName, SubKey), Option<Pid>>>,
    slow: Mutex<HashSet<ServerName>>,
    errors: Mutex<HashSet<ServerName>>,
    unknown: Mutex<HashSet<SubKey>>,
    notifies: Mutex<Vec<(ServerName, Option<Pid>, NotifyPubSubTasks)>>,
    probes: AtomicUsize,
}

impl MockRpc {
    pub fn set_pid(&self, server_name: &str, sub_key: &str, pid: Option<Pid>) {
        let server_name = ServerName::from(server_name);
        self.slow.lock().remove(&server_name);
        self.errors.lock().remove(&server_name);
        self.pids.lock().insert((server_name, sub_key.into()), pid);
    }

    pub fn set_slow(&self, server_name: &str) {
        self.slow.lock().insert(server_name.into());
    }

    pub fn set_error(&self, server_name: &str) {
        self.errors.lock().insert(server_name.into());
    }

    /// Peers answer notifications for `sub_key` as if they had no such subscription.
    pub fn set_unknown(&self, sub_key: &str) {
        self.unknown.lock().insert(sub_key.into());
    }

    pub fn notifies(&self) -> Vec<(ServerName, Option<Pid>, NotifyPubSubTasks)> {
        self.notifies.lock().clone()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerRpc for MockRpc {
    async fn invoke(&self, server_name: &ServerName, pid: Option<Pid>, msg: RpcMessage) -> Result<MessageReply> {
        if let RpcMessage::GetServerPidForSubKey(_) = msg {
            self.probes.fetch_add(1, Ordering::SeqCst);
        }
        let slow = self.slow.lock().contains(server_name);
        if slow {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let refused = self.errors.lock().contains(server_name);
        if refused {
            return Ok(MessageReply::Error(format!("{} refused the call", server_name)));
        }
        Ok(match msg {
            RpcMessage::GetServerPidForSubKey(sub_key) => {
                let pid = self.pids.lock().get(&(server_name.clone(), sub_key)).cloned().flatten();
                MessageReply::ServerPid(pid)
            }
            RpcMessage::NotifyPubSubTasks(notify) => {
                let rejected = {
                    let unknown = self.unknown.lock();
                    notify.batches.iter().map(|(sk, _)| sk).filter(|sk| unknown.contains(*sk)).cloned().collect::<Vec<_>>()
                };
                self.notifies.lock().push((server_name.clone(), pid, notify));
                if rejected.is_empty() {
                    MessageReply::Success
                } else {
                    MessageReply::Rejected(rejected)
                }
            }
            RpcMessage::Ping => MessageReply::Pong,
        })
    }
}

#[derive(Default)]
pub(crate) struct MockBroker {
    published: Mutex<Vec<BrokerMessage>>,
}

impl MockBroker {
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn publish(&self, msg: BrokerMessage) -> Result<()> {
        self.published.lock().push(msg);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockDelivery {
    tasks: Mutex<HashSet<SubKey>>,
    failing: AtomicBool,
    delivered: Mutex<Vec<(SubKey, DeliveryBatch)>>,
    stopped: Mutex<Vec<SubKey>>,
}

impl MockDelivery {
    pub fn add_task(&self, sub_key: &str) {
        self.tasks.lock().insert(sub_key.into());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<(SubKey, DeliveryBatch)> {
        self.delivered.lock().clone()
    }

    pub fn stopped(&self) -> Vec<SubKey> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl DeliveryTask for MockDelivery {
    async fn deliver(&self, sub_key: &SubKey, batch: DeliveryBatch) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("delivery task of {} is busy", sub_key));
        }
        self.delivered.lock().push((sub_key.clone(), batch));
        Ok(())
    }

    fn has_task(&self, sub_key: &SubKey) -> bool {
        self.tasks.lock().contains(sub_key)
    }

    async fn stop(&self, sub_key: &SubKey) {
        self.stopped.lock().push(sub_key.clone());
    }
}

/// A broker of server `server1`, pid 100, wired to mocks.
pub(crate) struct Harness {
    pub pubsub: PubSub,
    pub store: Arc<MockStore>,
    pub rpc: Arc<MockRpc>,
    pub broker: Arc<MockBroker>,
    pub delivery: Arc<MockDelivery>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings("server1", 100))
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = Arc::new(MockStore::default());
        let rpc = Arc::new(MockRpc::default());
        let broker = Arc::new(MockBroker::default());
        let delivery = Arc::new(MockDelivery::default());
        let scx = ServerContext::new(settings, store.clone(), rpc.clone(), broker.clone(), delivery.clone());
        Self { pubsub: PubSub::new(scx), store, rpc, broker, delivery }
    }
}
