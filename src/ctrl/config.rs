//! Configuration.

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

use crate::ib::error::{Error, Result};
use crate::ib::{NodeId, NODE_ID_INVALID};

/// A configured peer: hostname plus the IPv4 address its exchange socket
/// is reachable at. Address resolution is the embedder's job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfEntry {
    pub hostname: String,
    pub addr: Ipv4Addr,
}

impl fmt::Display for NodeConfEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.addr)
    }
}

/// The initial set of peers to discover.
#[derive(Debug, Clone, Default)]
pub struct NodeConf {
    entries: Vec<NodeConfEntry>,
}

impl NodeConf {
    pub fn new(entries: Vec<NodeConfEntry>) -> Self {
        NodeConf { entries }
    }

    pub fn add_entry(&mut self, entry: NodeConfEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[NodeConfEntry] {
        &self.entries
    }
}

/// Recognized configuration options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// This node's identifier. Must not be `0xFFFF`.
    pub own_node_id: NodeId,
    /// This node's hostname, used to filter self out of the peer list.
    pub own_hostname: String,
    /// UDP port of the exchange socket; every node in the cluster uses the
    /// same one.
    pub socket_port: u16,
    /// Local address the exchange socket binds to. The default binds on
    /// all interfaces.
    pub bind_addr: Ipv4Addr,
    /// Budget for `get_connection` before it fails with a timeout.
    pub connection_creation_timeout_ms: u32,
    /// Number of connection ids in the free list.
    pub max_num_connections: u32,
    /// Size of the per-connection payload send buffer.
    pub send_buffer_size: u32,
    /// Size of one receive buffer; also the maximum slice a single send
    /// work request may carry.
    pub recv_buffer_size: u32,
    /// Total bytes of the receive buffer pool. Must yield a power-of-two
    /// buffer count.
    pub recv_pool_bytes: u64,
    /// Receive queue depth of the payload QP.
    pub max_recv_reqs: u16,
    /// Send queue depth of the payload QP.
    pub max_send_reqs: u16,
    /// Receive queue depth of the flow control QP.
    pub flow_control_max_recv_reqs: u16,
    /// Recognized for compatibility; signal handling is the embedder's
    /// concern.
    pub enable_signal_handler: bool,
    /// Spawn a thread that periodically logs engine statistics.
    pub enable_debug_thread: bool,
    /// Initial peers.
    pub nodes: Vec<NodeConfEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            own_node_id: NODE_ID_INVALID,
            own_hostname: String::new(),
            socket_port: 5731,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            connection_creation_timeout_ms: 5000,
            max_num_connections: 100,
            send_buffer_size: 1024 * 1024,
            recv_buffer_size: 8192,
            recv_pool_bytes: 32 * 1024 * 1024,
            max_recv_reqs: 128,
            max_send_reqs: 128,
            flow_control_max_recv_reqs: 64,
            enable_signal_handler: false,
            enable_debug_thread: false,
            nodes: Vec::new(),
        }
    }
}

impl Config {
    /// Load a configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the option values against the constraints the pools and
    /// queues rely on.
    pub fn validate(&self) -> Result<()> {
        if self.own_node_id == NODE_ID_INVALID {
            return Err(Error::Config("invalid own node id".into()));
        }
        if self.recv_buffer_size == 0 || self.send_buffer_size == 0 {
            return Err(Error::Config("buffer sizes must be nonzero".into()));
        }
        let pool_buffers = self.recv_pool_bytes / u64::from(self.recv_buffer_size);
        if pool_buffers == 0 || !pool_buffers.is_power_of_two() {
            return Err(Error::Config(format!(
                "recv pool of {} bytes yields {} buffers, must be a power of two",
                self.recv_pool_bytes, pool_buffers
            )));
        }
        if self.max_recv_reqs == 0
            || self.max_send_reqs == 0
            || self.flow_control_max_recv_reqs == 0
        {
            return Err(Error::Config("queue depths must be nonzero".into()));
        }
        if self.max_num_connections == 0 || self.max_num_connections > 0x10000 {
            return Err(Error::Config(
                "max_num_connections must be in [1, 65536]".into(),
            ));
        }
        Ok(())
    }

    pub fn node_conf(&self) -> NodeConf {
        NodeConf::new(self.nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_once_node_id_is_set() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let config = Config {
            own_node_id: 0,
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_pool() {
        let config = Config {
            own_node_id: 0,
            recv_buffer_size: 8192,
            recv_pool_bytes: 3 * 8192,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn parses_toml() {
        let toml_str = r#"
            own_node_id = 7
            own_hostname = "node07"
            socket_port = 6000
            recv_buffer_size = 4096
            recv_pool_bytes = 16384

            [[nodes]]
            hostname = "node08"
            addr = "10.0.0.8"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.own_node_id, 7);
        assert_eq!(config.socket_port, 6000);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].addr, Ipv4Addr::new(10, 0, 0, 8));
        // unspecified options keep their defaults
        assert_eq!(config.max_send_reqs, 128);
    }
}
