use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::broadcast::BrokerClient;
use crate::conf::Settings;
use crate::delivery::DeliveryTask;
use crate::hook::DefaultHookManager;
use crate::rpc::{RpcClient, ServerRpc};
use crate::store::DurableStore;
use crate::types::{ClusterId, Pid, ServerName};

/// Everything the broker needs from the hosting server process.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub cluster_id: ClusterId,
    pub server_name: ServerName,
    pub pid: Pid,
    pub store: Arc<dyn DurableStore>,
    pub rpc: RpcClient,
    pub broker: Arc<dyn BrokerClient>,
    pub delivery: Arc<dyn DeliveryTask>,
    pub hooks: DefaultHookManager,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    pub fn new(
        settings: Settings,
        store: Arc<dyn DurableStore>,
        rpc: Arc<dyn ServerRpc>,
        broker: Arc<dyn BrokerClient>,
        delivery: Arc<dyn DeliveryTask>,
    ) -> Self {
        let cluster_id = settings.node.cluster_id;
        let server_name = ServerName::from(settings.node.server_name.as_str());
        let pid = settings.node.pid();
        ServerContext {
            inner: Arc::new(ServerContextInner {
                settings,
                cluster_id,
                server_name,
                pid,
                store,
                rpc: RpcClient::new(rpc),
                broker,
                delivery,
                hooks: DefaultHookManager::new(),
            }),
        }
    }

    /// Whether `server_name`/`pid` designates this very process.
    #[inline]
    pub fn is_local(&self, server_name: &str, pid: Option<Pid>) -> bool {
        &*self.server_name == server_name && pid == Some(self.pid)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext ...")?;
        Ok(())
    }
}
