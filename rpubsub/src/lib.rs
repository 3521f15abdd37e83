#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rpubsub::conf::{Options, Settings};
//! use rpubsub::context::ServerContext;
//! use rpubsub::sync::{CleanupTask, SyncTrigger};
//! use rpubsub::{PubSub, Result};
//! # use rpubsub::broadcast::BrokerClient;
//! # use rpubsub::delivery::DeliveryTask;
//! # use rpubsub::rpc::ServerRpc;
//! # use rpubsub::store::DurableStore;
//!
//! # async fn run(
//! #     store: Arc<dyn DurableStore>,
//! #     rpc: Arc<dyn ServerRpc>,
//! #     broker: Arc<dyn BrokerClient>,
//! #     delivery: Arc<dyn DeliveryTask>,
//! # ) -> Result<()> {
//! let settings = Settings::init(Options::default())?.clone();
//! let logger = rpubsub::logger::config_logger(&settings.log);
//! rpubsub::logger::logger_init(logger, settings.log.level)?;
//!
//! let scx = ServerContext::new(settings, store, rpc, broker, delivery);
//! let pubsub = PubSub::new(scx);
//!
//! CleanupTask::new(pubsub.clone()).start();
//! SyncTrigger::new(pubsub.clone()).start().await?;
//! # Ok(())
//! # }
//! ```

/// Registries
pub mod acl; // Topic patterns of endpoints
pub mod endpoint; // Publishers and subscribers
pub mod subscription; // Sub_key to topic bindings
pub mod topic; // Topics with dirty flags and counters

/// Messages and delivery
pub mod backlog; // Bounded in-RAM queues per sub_key
pub mod delivery; // Delivery tasks of this process
pub mod directory; // Which server delivers for a sub_key
pub mod hook; // Per-topic hook services
pub mod pubsub; // The facade
pub mod sync; // Sync trigger and cleanup loops

/// Host integration
pub mod broadcast; // Cluster-wide broker bus
pub mod context; // Shared execution context
pub mod rpc; // Server to server calls
pub mod store; // Durable store of GD messages

/// Common
pub mod error;
pub mod logger;
pub mod types;

#[cfg(test)]
mod testing;

pub use crate::pubsub::PubSub;
pub use rpubsub_conf as conf;
pub use rpubsub_utils as utils;

pub type Error = anyhow::Error;
pub type Result<T, E = anyhow::Error> = anyhow::Result<T, E>;
