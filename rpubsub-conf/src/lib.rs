#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, ConfigBuilder, File, FileFormat};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use rpubsub_utils::*;

use self::logging::Log;

pub use self::options::Options;

pub mod logging;
pub mod options;

pub type Result<T> = anyhow::Result<T>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub pubsub: PubSub,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    #[inline]
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rpubsub/rpubsub").required(false))
            .add_source(File::with_name("rpubsub").required(false))
            .add_source(config::Environment::with_prefix("rpubsub").separator("__").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        Self::build(builder, opts)
    }

    /// Build settings from an inline TOML document, used by embedders and tests.
    pub fn from_toml(text: &str, opts: Options) -> Result<Self> {
        let builder = Config::builder().add_source(File::from_str(text, FileFormat::Toml));
        Self::build(builder, opts)
    }

    fn build(builder: ConfigBuilder<config::builder::DefaultState>, opts: Options) -> Result<Self> {
        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Embedder options override file configuration
        if let Some(cluster_id) = opts.cluster_id {
            inner.node.cluster_id = cluster_id;
        }
        if let Some(server_name) = opts.server_name.as_ref() {
            inner.node.server_name.clone_from(server_name);
        }
        if let Some(pid) = opts.pid {
            inner.node.pid = Some(pid);
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn try_instance() -> Option<&'static Self> {
        SETTINGS.get()
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() -> Result<()> {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("cluster_id is {}", cfg.node.cluster_id);
        log::info!("server_name is {}", cfg.node.server_name);
        log::info!("pid is {}", cfg.node.pid());
        log::info!("pubsub config is: {:?}", cfg.pubsub);
        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    #[serde(default = "Node::cluster_id_default")]
    pub cluster_id: u32,
    #[serde(default = "Node::server_name_default")]
    pub server_name: String,
    //OS pid of this server process, taken from the running process when absent
    #[serde(default)]
    pub pid: Option<Pid>,
}

impl Default for Node {
    #[inline]
    fn default() -> Self {
        Self { cluster_id: Self::cluster_id_default(), server_name: Self::server_name_default(), pid: None }
    }
}

impl Node {
    fn cluster_id_default() -> u32 {
        1
    }
    fn server_name_default() -> String {
        "server1".into()
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid.unwrap_or_else(process_id)
    }
}

/// What happens to a message evicted from a full in-RAM backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    Drop,
    Log,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PubSub {
    //Tick of the sync trigger loop.
    #[serde(default = "PubSub::sync_interval_default", deserialize_with = "deserialize_duration")]
    pub sync_interval: Duration,

    //Timeout of the liveness probe sent to a peer server during discovery.
    #[serde(default = "PubSub::probe_timeout_default", deserialize_with = "deserialize_duration")]
    pub probe_timeout: Duration,

    //How often expired messages are swept out of the in-RAM backlog.
    #[serde(default = "PubSub::cleanup_interval_default", deserialize_with = "deserialize_duration")]
    pub cleanup_interval: Duration,

    #[serde(default = "PubSub::overflow_policy_default")]
    pub overflow_policy: OverflowPolicy,

    #[serde(default = "PubSub::log_if_deliv_server_not_found_default")]
    pub log_if_deliv_server_not_found: bool,

    #[serde(default)]
    pub log_if_wsx_deliv_server_not_found: bool,

    //Stop the sync trigger after this many ticks, unbounded when absent.
    #[serde(default)]
    pub max_sync_iterations: Option<usize>,
}

impl Default for PubSub {
    #[inline]
    fn default() -> Self {
        Self {
            sync_interval: Self::sync_interval_default(),
            probe_timeout: Self::probe_timeout_default(),
            cleanup_interval: Self::cleanup_interval_default(),
            overflow_policy: Self::overflow_policy_default(),
            log_if_deliv_server_not_found: Self::log_if_deliv_server_not_found_default(),
            log_if_wsx_deliv_server_not_found: false,
            max_sync_iterations: None,
        }
    }
}

impl PubSub {
    fn sync_interval_default() -> Duration {
        Duration::from_millis(10)
    }
    fn probe_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn cleanup_interval_default() -> Duration {
        Duration::from_secs(2)
    }
    fn overflow_policy_default() -> OverflowPolicy {
        OverflowPolicy::Log
    }
    fn log_if_deliv_server_not_found_default() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml("", Options::default()).expect("Settings creation failed");
        assert_eq!(settings.node.cluster_id, 1);
        assert_eq!(settings.node.server_name, "server1");
        assert_eq!(settings.node.pid(), process_id());
        assert_eq!(settings.pubsub.sync_interval, Duration::from_millis(10));
        assert_eq!(settings.pubsub.overflow_policy, OverflowPolicy::Log);
        assert!(settings.pubsub.log_if_deliv_server_not_found);
        assert!(!settings.pubsub.log_if_wsx_deliv_server_not_found);
        assert!(settings.pubsub.max_sync_iterations.is_none());
    }

    #[test]
    fn test_toml_sections() {
        let text = r#"
            [node]
            cluster_id = 7
            server_name = "serverA"
            pid = 100

            [pubsub]
            sync_interval = "50ms"
            probe_timeout = "1s"
            overflow_policy = "drop"
            max_sync_iterations = 3

            [log]
            to = "off"
            level = "debug"
            overflow_file = "overflow.log"
        "#;
        let settings = Settings::from_toml(text, Options::default()).expect("Settings creation failed");
        assert_eq!(settings.node.cluster_id, 7);
        assert_eq!(settings.node.server_name, "serverA");
        assert_eq!(settings.node.pid(), 100);
        assert_eq!(settings.pubsub.sync_interval, Duration::from_millis(50));
        assert_eq!(settings.pubsub.probe_timeout, Duration::from_secs(1));
        assert_eq!(settings.pubsub.overflow_policy, OverflowPolicy::Drop);
        assert_eq!(settings.pubsub.max_sync_iterations, Some(3));
        assert!(settings.log.to.off());
        assert_eq!(settings.log.overflow_filename().as_deref(), Some("/var/log/rpubsub/overflow.log"));
    }

    #[test]
    fn test_options_override() {
        let opts = Options { server_name: Some("serverB".into()), pid: Some(42), ..Default::default() };
        let settings =
            Settings::from_toml("[node]\nserver_name = \"serverA\"", opts).expect("Settings creation failed");
        assert_eq!(settings.node.server_name, "serverB");
        assert_eq!(settings.node.pid(), 42);
    }
}
