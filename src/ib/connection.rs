//! Connections aggregating queue pairs to a single peer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::verbs::{Lid, Qpn};

use super::error::{Error, Result};
use super::qp::QueuePair;
use super::{ConnectionId, NodeId};

/// Connection parameters of the remote endpoint, assembled from the
/// exchanged datagrams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub node_id: NodeId,
    pub lid: Lid,
    /// Incarnation of the remote connection manager. A different value on
    /// an established connection means the peer restarted.
    pub con_man_ident: u32,
    /// Physical QP numbers, index-aligned with the local QPs.
    pub physical_qp_ids: Vec<Qpn>,
}

impl fmt::Display for RemoteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {:#x}, lid {:#x}, ident {:#x}, qpIds {:x?}",
            self.node_id, self.lid, self.con_man_ident, self.physical_qp_ids
        )
    }
}

/// One or more queue pairs to a peer node, owned exclusively.
///
/// Created unconnected by the connection creator; `connect` opens every QP
/// against the remote parameters in lockstep and publishes the connected
/// flag. The QP sequence is fixed at creation time.
pub struct Connection {
    connection_id: ConnectionId,
    remote_node_id: NodeId,
    qps: Vec<QueuePair>,
    remote_info: Mutex<Option<RemoteInfo>>,
    is_connected: AtomicBool,
}

impl Connection {
    pub fn new(connection_id: ConnectionId, remote_node_id: NodeId) -> Self {
        Connection {
            connection_id,
            remote_node_id,
            qps: Vec::new(),
            remote_info: Mutex::new(None),
            is_connected: AtomicBool::new(false),
        }
    }

    /// Append a queue pair. Only the creator calls this, before the
    /// connection is shared.
    pub fn add_qp(&mut self, qp: QueuePair) {
        self.qps.push(qp);
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn remote_node_id(&self) -> NodeId {
        self.remote_node_id
    }

    pub fn qp(&self, index: usize) -> &QueuePair {
        &self.qps[index]
    }

    pub fn qps(&self) -> &[QueuePair] {
        &self.qps
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    /// Stored incarnation of the remote manager, if connected.
    pub fn remote_ident(&self) -> Option<u32> {
        self.remote_info
            .lock()
            .unwrap()
            .as_ref()
            .map(|info| info.con_man_ident)
    }

    /// Open every QP against the remote parameters: recv side first, then
    /// send side, per QP in order.
    pub fn connect(&self, remote_info: RemoteInfo) -> Result<()> {
        if remote_info.physical_qp_ids.len() != self.qps.len() {
            return Err(Error::Invariant(
                "number of remote physical QP ids does not match number of queue pairs",
            ));
        }

        for (qp, &remote_qpn) in self.qps.iter().zip(&remote_info.physical_qp_ids) {
            qp.recv_queue().open(remote_info.lid, remote_qpn)?;
            qp.send_queue().open()?;
        }

        *self.remote_info.lock().unwrap() = Some(remote_info);
        self.is_connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Tear the connection down. A graceful close first reaps all
    /// outstanding send completions on every QP; a forced close skips the
    /// flush.
    pub fn close(&self, force: bool) {
        if !force {
            for qp in &self.qps {
                if let Err(e) = qp.send_queue().flush() {
                    log::warn!(
                        "flushing send queue on close of connection {} failed: {}",
                        self.connection_id,
                        e
                    );
                }
            }
        }

        for qp in &self.qps {
            qp.close(force);
        }

        self.is_connected.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ib::qp::QueuePair;
    use crate::verbs::testing::SimVerbs;
    use crate::verbs::Verbs;

    fn connection_with_qps(count: usize) -> (Arc<SimVerbs>, Connection) {
        let sim = Arc::new(SimVerbs::new());
        let verbs: Arc<dyn Verbs> = sim.clone();
        let pd = verbs.alloc_pd().unwrap();
        let mut conn = Connection::new(3, 0x42);
        for _ in 0..count {
            conn.add_qp(QueuePair::new(&verbs, pd, 4, 4, None, None).unwrap());
        }
        (sim, conn)
    }

    fn remote_for(conn: &Connection) -> RemoteInfo {
        RemoteInfo {
            node_id: 0x42,
            lid: 7,
            con_man_ident: 0xDEAD_BEEF,
            physical_qp_ids: conn.qps().iter().map(|_| 0x900).collect(),
        }
    }

    #[test]
    fn connect_requires_matching_qp_count() {
        let (_sim, conn) = connection_with_qps(2);
        let mut remote = remote_for(&conn);
        remote.physical_qp_ids.pop();
        assert!(matches!(
            conn.connect(remote),
            Err(Error::Invariant(_))
        ));
        assert!(!conn.is_connected());
    }

    #[test]
    fn connect_publishes_state() {
        let (_sim, conn) = connection_with_qps(2);
        let remote = remote_for(&conn);
        conn.connect(remote).unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.remote_ident(), Some(0xDEAD_BEEF));
    }

    #[test]
    fn close_clears_connected_flag() {
        let (_sim, conn) = connection_with_qps(1);
        conn.connect(remote_for(&conn)).unwrap();
        conn.close(false);
        assert!(!conn.is_connected());
    }
}
