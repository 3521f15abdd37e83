use std::fmt;

/// Overrides supplied by the embedding process, applied on top of file and environment sources.
#[derive(Default, Clone)]
pub struct Options {
    /// Extra configuration file, looked up without extension as the `config` crate does
    pub cfg_name: Option<String>,
    pub cluster_id: Option<u32>,
    pub server_name: Option<String>,
    pub pid: Option<u32>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("cfg_name", &self.cfg_name)
            .field("cluster_id", &self.cluster_id)
            .field("server_name", &self.server_name)
            .field("pid", &self.pid)
            .finish()
    }
}
