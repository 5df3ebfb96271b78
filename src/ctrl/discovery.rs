//! Peer discovery over the exchange channel.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::ib::NodeId;

use super::config::{NodeConf, NodeConfEntry};
use super::exchange::{ExchangeSocket, Packet};
use super::job::JobChannel;
use super::manager::ListenerSlot;

struct DiscoveryState {
    /// Configured peers whose node id we have not learned yet.
    info_to_get: Vec<NodeConfEntry>,
    /// Resolved peers, by node id.
    node_info: HashMap<NodeId, NodeConfEntry>,
}

/// Tracks which configured peers still need discovering and triggers the
/// datagram probes. One mutex guards both lists; the listener is always
/// invoked outside of it.
pub struct DiscoveryContext {
    own_node_id: NodeId,
    own_hostname: String,
    state: Mutex<DiscoveryState>,
    jobs: Arc<JobChannel>,
    socket: Arc<ExchangeSocket>,
    listener: Arc<ListenerSlot>,
}

impl DiscoveryContext {
    pub fn new(
        own_node_id: NodeId,
        own_hostname: String,
        node_conf: &NodeConf,
        jobs: Arc<JobChannel>,
        socket: Arc<ExchangeSocket>,
        listener: Arc<ListenerSlot>,
    ) -> Self {
        log::info!(
            "initializing node discovery list, own node id {:#x}",
            own_node_id
        );

        let info_to_get = node_conf
            .entries()
            .iter()
            // don't add self
            .filter(|entry| entry.hostname != own_hostname)
            .cloned()
            .collect();

        DiscoveryContext {
            own_node_id,
            own_hostname,
            state: Mutex::new(DiscoveryState {
                info_to_get,
                node_info: HashMap::new(),
            }),
            jobs,
            socket,
            listener,
        }
    }

    /// Register another peer and trigger discovery for it.
    pub fn add_node(&self, entry: NodeConfEntry) {
        if entry.hostname != self.own_hostname {
            log::info!("adding node {}", entry);
            self.state.lock().unwrap().info_to_get.push(entry);
        }

        self.jobs.add_discover_job();
    }

    /// Resolved address of a node, if its discovery response arrived.
    pub fn node_info(&self, node_id: NodeId) -> Option<NodeConfEntry> {
        self.state.lock().unwrap().node_info.get(&node_id).cloned()
    }

    /// One discovery pass: probe every still-pending peer, re-arm if any
    /// remain, and back off briefly to cap CPU use.
    pub fn discover(&self) {
        let pending = {
            let state = self.state.lock().unwrap();
            log::trace!("requesting node info of {} nodes", state.info_to_get.len());
            for entry in &state.info_to_get {
                log::trace!("requesting node info from {}", entry.addr);
                self.socket
                    .send_packet(&Packet::discovery_req(self.own_node_id), entry.addr);
            }
            state.info_to_get.len()
        };

        // there are more nodes to be discovered
        if pending != 0 {
            self.jobs.add_discover_job();
        }

        thread::sleep(Duration::from_millis(10));
    }

    /// A discovery response arrived: move the matching pending entry to
    /// the resolved set.
    pub fn discovered(&self, node_id: NodeId, remote_ip: Ipv4Addr) {
        let found = {
            let mut state = self.state.lock().unwrap();
            match state.info_to_get.iter().position(|e| e.addr == remote_ip) {
                Some(at) => {
                    let entry = state.info_to_get.remove(at);
                    log::info!("discovered node {} as node id {:#x}", entry, node_id);
                    state.node_info.insert(node_id, entry);
                    true
                }
                None => false,
            }
        };

        if found {
            self.listener.node_discovered(node_id);
        }
    }

    /// The connection is gone; move the peer back to pending so it gets
    /// re-discovered, unless the whole system is shutting down.
    pub fn invalidate(&self, node_id: NodeId, shutdown: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.node_info.remove(&node_id) {
                state.info_to_get.push(entry);
            }
        }

        if !shutdown {
            self.jobs.add_discover_job();
        }

        self.listener.node_invalidated(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DiscoveryContext {
        let jobs = Arc::new(JobChannel::new());
        let socket = Arc::new(ExchangeSocket::new(0).unwrap());
        let listener = Arc::new(ListenerSlot::new());
        let node_conf = NodeConf::new(vec![
            NodeConfEntry {
                hostname: "self".into(),
                addr: Ipv4Addr::new(10, 0, 0, 1),
            },
            NodeConfEntry {
                hostname: "peer".into(),
                addr: Ipv4Addr::new(10, 0, 0, 2),
            },
        ]);
        DiscoveryContext::new(0, "self".into(), &node_conf, jobs, socket, listener)
    }

    #[test]
    fn filters_self_out() {
        let ctx = context();
        assert_eq!(ctx.state.lock().unwrap().info_to_get.len(), 1);
    }

    #[test]
    fn discovered_moves_entry() {
        let ctx = context();
        ctx.discovered(5, Ipv4Addr::new(10, 0, 0, 2));
        assert!(ctx.node_info(5).is_some());
        assert!(ctx.state.lock().unwrap().info_to_get.is_empty());

        // an unknown address changes nothing
        ctx.discovered(6, Ipv4Addr::new(10, 0, 0, 99));
        assert!(ctx.node_info(6).is_none());
    }

    #[test]
    fn invalidate_requeues_entry_and_rearms_discovery() {
        let ctx = context();
        ctx.discovered(5, Ipv4Addr::new(10, 0, 0, 2));
        while ctx.jobs.take_discover_job() {}

        ctx.invalidate(5, false);
        assert!(ctx.node_info(5).is_none());
        assert_eq!(ctx.state.lock().unwrap().info_to_get.len(), 1);
        assert!(ctx.jobs.take_discover_job());
    }

    #[test]
    fn invalidate_on_shutdown_does_not_rearm() {
        let ctx = context();
        ctx.discovered(5, Ipv4Addr::new(10, 0, 0, 2));
        while ctx.jobs.take_discover_job() {}

        ctx.invalidate(5, true);
        assert!(!ctx.jobs.take_discover_job());
    }
}
