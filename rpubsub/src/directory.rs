//! Delivery-server directory.
//!
//! Maps each sub_key to the process (server name and pid) currently delivering
//! for it. The map lives only in this process's memory. When a lookup misses,
//! [`discover`] rebuilds the entry in two phases: the durable store names the
//! owning server, then that server is asked over RPC which of its processes
//! holds the sub_key. Either phase may fail, the result then carries an
//! [`Unresolved`] reason instead of an error.

use std::fmt;
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use rpubsub_utils::{format_timestamp_millis_short, timestamp_millis, TextTable};

use crate::rpc::{Message, MessageReply, RpcClient, SendError};
use crate::store::DurableStore;
use crate::types::{
    ChannelName, ClusterId, EndpointType, HashMap, Pid, ServerName, SubKey, SubKeys, TimestampMillis,
};

/// Connection details of a WebSocket subscriber, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsxInfo {
    pub swc: Option<String>,
    pub name: Option<String>,
    pub pub_client_id: Option<String>,
    pub peer_fqdn: Option<String>,
    pub forwarded_for_fqdn: Option<String>,
    pub conn_id: Option<String>,
    pub peer_address: Option<String>,
}

impl WsxInfo {
    fn fields(&self) -> [(&'static str, &Option<String>); 7] {
        [
            ("swc", &self.swc),
            ("name", &self.name),
            ("pub_client_id", &self.pub_client_id),
            ("peer_fqdn", &self.peer_fqdn),
            ("forwarded_for_fqdn", &self.forwarded_for_fqdn),
            ("conn_id", &self.conn_id),
            ("peer_address", &self.peer_address),
        ]
    }
}

/// Which concrete process delivers for a sub_key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubKeyServer {
    pub sub_key: SubKey,
    pub cluster_id: ClusterId,
    pub server_name: ServerName,
    pub server_pid: Option<Pid>,
    pub channel_name: Option<ChannelName>,
    pub pub_client_id: Option<String>,
    pub endpoint_type: EndpointType,
    pub wsx_info: Option<WsxInfo>,
    pub creation_time: TimestampMillis,
}

impl SubKeyServer {
    pub fn new(
        sub_key: SubKey,
        cluster_id: ClusterId,
        server_name: ServerName,
        server_pid: Option<Pid>,
        endpoint_type: EndpointType,
    ) -> Self {
        Self {
            sub_key,
            cluster_id,
            server_name,
            server_pid,
            channel_name: None,
            pub_client_id: None,
            endpoint_type,
            wsx_info: None,
            creation_time: timestamp_millis(),
        }
    }

    #[inline]
    pub fn is_wsx(&self) -> bool {
        self.endpoint_type.is_wsx()
    }

    #[inline]
    pub fn task_key(&self) -> ServerKey {
        ServerKey {
            server_name: self.server_name.clone(),
            server_pid: self.server_pid,
            pub_client_id: self.pub_client_id.clone(),
            channel_name: self.channel_name.clone(),
            endpoint_type: self.endpoint_type,
        }
    }
}

/// Groups sub_keys that can be notified with one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub server_name: ServerName,
    pub server_pid: Option<Pid>,
    pub pub_client_id: Option<String>,
    pub channel_name: Option<ChannelName>,
    pub endpoint_type: EndpointType,
}

/// Why discovery could not produce a delivery server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    NoDurableRecord,
    ProbeFailed(String),
    ProbeTimeout,
    /// A record exists but the process delivering for it is not known yet
    PidUnknown(ServerName),
    /// The subscription was deleted while discovery was in flight
    SubscriptionGone,
}

impl Unresolved {
    /// The server is known but could not be reached, the next tick should try again.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Unresolved::ProbeFailed(_) | Unresolved::ProbeTimeout | Unresolved::PidUnknown(_))
    }
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unresolved::NoDurableRecord => write!(f, "no-durable-record"),
            Unresolved::ProbeFailed(reason) => write!(f, "probe-failed, {}", reason),
            Unresolved::ProbeTimeout => write!(f, "probe-timeout"),
            Unresolved::PidUnknown(server) => write!(f, "pid-unknown, server: {}", server),
            Unresolved::SubscriptionGone => write!(f, "subscription-gone"),
        }
    }
}

pub type Discovery = std::result::Result<SubKeyServer, Unresolved>;

/// Delivery servers for a batch of sub_keys.
#[derive(Debug, Default)]
pub struct TaskServers {
    pub found: HashMap<ServerKey, SubKeys>,
    pub not_found: Vec<(SubKey, Unresolved)>,
}

impl TaskServers {
    #[inline]
    pub fn add_found(&mut self, server: &SubKeyServer) {
        self.found.entry(server.task_key()).or_default().push(server.sub_key.clone());
    }

    #[inline]
    pub fn found_sub_keys(&self) -> SubKeys {
        self.found.values().flatten().cloned().collect()
    }
}

#[derive(Default)]
pub(crate) struct Directory {
    servers: HashMap<SubKey, SubKeyServer>,
}

impl Directory {
    /// Stores or overwrites, the newest record wins.
    #[inline]
    pub fn set(&mut self, server: SubKeyServer) -> Option<SubKeyServer> {
        self.servers.insert(server.sub_key.clone(), server)
    }

    #[inline]
    pub fn get(&self, sub_key: &str) -> Option<&SubKeyServer> {
        self.servers.get(sub_key)
    }

    #[inline]
    pub fn remove(&mut self, sub_key: &str) -> Option<SubKeyServer> {
        self.servers.remove(sub_key)
    }

    /// Removes whatever exists of the given keys, returns how many were removed.
    pub fn remove_many(&mut self, sub_keys: &[SubKey]) -> usize {
        sub_keys.iter().filter(|sk| self.servers.remove(*sk).is_some()).count()
    }

    #[inline]
    pub fn values(&self) -> impl Iterator<Item = &SubKeyServer> {
        self.servers.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Human-readable table of all records, newest first.
    pub fn format_table(&self, default: &str) -> String {
        let or_default = |v: Option<String>| v.filter(|s| !s.is_empty()).unwrap_or_else(|| default.to_owned());
        let mut table =
            TextTable::new(&[("#", 6), ("created", 15), ("name", 8), ("pid", 6), ("channel_name", 17), ("sub_key", 80)]);

        let sorted = self.servers.values().sorted_by(|a, b| {
            (b.creation_time, &b.channel_name, &b.sub_key).cmp(&(a.creation_time, &a.channel_name, &a.sub_key))
        });
        for (idx, server) in sorted.enumerate() {
            let mut sub_key = server.sub_key.to_string();
            if let Some(wsx) = server.wsx_info.as_ref() {
                for (name, value) in wsx.fields() {
                    sub_key.push_str(&format!("\n{}: {}", name, or_default(value.clone())));
                }
            }
            table.add_row(vec![
                (idx + 1).to_string(),
                or_default(Some(format_timestamp_millis_short(server.creation_time))),
                server.server_name.to_string(),
                or_default(server.server_pid.map(|p| p.to_string())),
                or_default(server.channel_name.as_ref().map(|c| c.to_string())),
                sub_key,
            ]);
        }
        table.render()
    }
}

/// Two-phase discovery, durable store lookup then liveness probe.
/// Never fails, a miss is reported through [`Unresolved`].
pub(crate) async fn discover(
    store: &dyn DurableStore,
    rpc: &RpcClient,
    sub_key: &SubKey,
    is_wsx: bool,
    probe_timeout: Duration,
) -> Discovery {
    let record = match store.get_delivery_server_for_sub_key(sub_key, is_wsx).await {
        Ok(Some(record)) => record,
        Ok(None) => return Err(Unresolved::NoDurableRecord),
        Err(e) => {
            log::warn!("Durable store lookup failed for sub_key: {}, {:?}", sub_key, e);
            return Err(Unresolved::NoDurableRecord);
        }
    };

    let pid = get_server_pid_for_sub_key(rpc, &record.server_name, sub_key, probe_timeout).await?;
    let endpoint_type = if is_wsx { EndpointType::WebSocket } else { record.endpoint_type };
    let mut server = SubKeyServer::new(sub_key.clone(), record.cluster_id, record.server_name, Some(pid), endpoint_type);
    server.channel_name = record.channel_name;
    server.pub_client_id = record.pub_client_id;
    Ok(server)
}

/// Asks `server_name` which of its processes delivers for `sub_key`.
pub(crate) async fn get_server_pid_for_sub_key(
    rpc: &RpcClient,
    server_name: &ServerName,
    sub_key: &SubKey,
    timeout: Duration,
) -> std::result::Result<Pid, Unresolved> {
    let reply =
        rpc.send_message(server_name, None, Message::GetServerPidForSubKey(sub_key.clone()), timeout).await;
    let unresolved = match reply {
        Ok(MessageReply::ServerPid(Some(pid))) => return Ok(pid),
        Ok(MessageReply::ServerPid(None)) => Unresolved::ProbeFailed(format!("no process of {} owns it", server_name)),
        Ok(other) => Unresolved::ProbeFailed(format!("unexpected reply {:?}", other)),
        Err(SendError::Timeout(_)) => Unresolved::ProbeTimeout,
        Err(SendError::Failed(e)) => Unresolved::ProbeFailed(e.to_string()),
    };
    log::warn!("Could not get server PID for sub_key: {}, server: {}, {}", sub_key, server_name, unresolved);
    Err(unresolved)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{MockRpc, MockStore};

    fn server(sub_key: &str, pid: Pid, created: TimestampMillis) -> SubKeyServer {
        let mut s = SubKeyServer::new(sub_key.into(), 1, "serverA".into(), Some(pid), EndpointType::Rest);
        s.creation_time = created;
        s
    }

    #[test]
    fn set_overwrites_and_bulk_remove_is_tolerant() {
        let mut dir = Directory::default();
        assert!(dir.set(server("sk1", 100, 1)).is_none());
        let old = dir.set(server("sk1", 200, 2)).unwrap();
        assert_eq!(old.server_pid, Some(100));
        assert_eq!(dir.get("sk1").unwrap().server_pid, Some(200));
        dir.set(server("sk2", 100, 3));
        assert_eq!(dir.remove_many(&["sk1".into(), "gone".into(), "sk2".into()]), 2);
        assert_eq!(dir.len(), 0);
    }

    #[test]
    fn table_is_newest_first_with_wsx_details() {
        let mut dir = Directory::default();
        dir.set(server("sk.old", 100, 1_000));
        let mut wsx = server("sk.new", 101, 2_000);
        wsx.endpoint_type = EndpointType::WebSocket;
        wsx.channel_name = Some("ws.channel".into());
        wsx.wsx_info = Some(WsxInfo { peer_address: Some("10.0.0.1:5000".into()), ..Default::default() });
        dir.set(wsx);
        let out = dir.format_table("---");
        let new_at = out.find("sk.new").unwrap();
        let old_at = out.find("sk.old").unwrap();
        assert!(new_at < old_at);
        assert!(out.contains("peer_address: 10.0.0.1:5000"));
        assert!(out.contains("swc: ---"));
        assert!(out.contains("| 1 "));
        assert!(out.contains("ws.channel"));
    }

    #[tokio::test]
    async fn discovery_branches() {
        let store = MockStore::default();
        let rpc = Arc::new(MockRpc::default());
        let client = RpcClient::new(rpc.clone());
        let timeout = Duration::from_millis(50);

        let sk = SubKey::from("sk1");
        assert_eq!(discover(&store, &client, &sk, false, timeout).await, Err(Unresolved::NoDurableRecord));

        store.set_owner("sk1", "serverA", EndpointType::Rest);
        rpc.set_pid("serverA", "sk1", None);
        assert!(matches!(discover(&store, &client, &sk, false, timeout).await, Err(Unresolved::ProbeFailed(_))));

        rpc.set_slow("serverA");
        assert_eq!(discover(&store, &client, &sk, false, timeout).await, Err(Unresolved::ProbeTimeout));

        rpc.set_pid("serverA", "sk1", Some(100));
        let found = discover(&store, &client, &sk, true, timeout).await.unwrap();
        assert_eq!(found.server_name, "serverA");
        assert_eq!(found.server_pid, Some(100));
        assert_eq!(found.endpoint_type, EndpointType::WebSocket);

        store.set_failing(true);
        assert_eq!(discover(&store, &client, &sk, false, timeout).await, Err(Unresolved::NoDurableRecord));
    }
}
