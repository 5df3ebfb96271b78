//! Connection creation strategies.

use std::sync::Arc;

use crate::verbs::{PdHandle, Verbs};

use super::connection::Connection;
use super::cq::CompQueue;
use super::error::Result;
use super::qp::QueuePair;
use super::queue::SharedRecvQueue;
use super::{ConnectionId, NodeId};

/// Strategy deciding QP count, queue depths and which shared resources a
/// new connection uses.
pub trait ConnectionCreator: Send + Sync {
    fn create_connection(
        &self,
        connection_id: ConnectionId,
        remote_node_id: NodeId,
        verbs: &Arc<dyn Verbs>,
        pd: PdHandle,
    ) -> Result<Connection>;
}

/// One QP per connection, private receive queue and CQs.
pub struct SimpleCreator {
    max_send_reqs: u16,
    max_recv_reqs: u16,
}

impl SimpleCreator {
    pub fn new(max_send_reqs: u16, max_recv_reqs: u16) -> Self {
        SimpleCreator {
            max_send_reqs,
            max_recv_reqs,
        }
    }
}

impl ConnectionCreator for SimpleCreator {
    fn create_connection(
        &self,
        connection_id: ConnectionId,
        remote_node_id: NodeId,
        verbs: &Arc<dyn Verbs>,
        pd: PdHandle,
    ) -> Result<Connection> {
        let mut connection = Connection::new(connection_id, remote_node_id);
        connection.add_qp(QueuePair::new(
            verbs,
            pd,
            self.max_send_reqs,
            self.max_recv_reqs,
            None,
            None,
        )?);
        Ok(connection)
    }
}

/// Datapath shape: QP\[0\] carries payload over the shared receive
/// queue/CQ, QP\[1\] carries flow control over its own shared pair.
///
/// The flow control send depth is 1: credits are accumulated by the
/// sender, not queued deeply.
pub struct DatapathCreator {
    max_send_reqs: u16,
    max_recv_reqs: u16,
    fc_max_recv_reqs: u16,
    shared_recv_queue: Arc<SharedRecvQueue>,
    shared_recv_comp_queue: Arc<CompQueue>,
    shared_fc_recv_queue: Arc<SharedRecvQueue>,
    shared_fc_recv_comp_queue: Arc<CompQueue>,
}

impl DatapathCreator {
    pub fn new(
        max_send_reqs: u16,
        max_recv_reqs: u16,
        fc_max_recv_reqs: u16,
        shared_recv_queue: Arc<SharedRecvQueue>,
        shared_recv_comp_queue: Arc<CompQueue>,
        shared_fc_recv_queue: Arc<SharedRecvQueue>,
        shared_fc_recv_comp_queue: Arc<CompQueue>,
    ) -> Self {
        DatapathCreator {
            max_send_reqs,
            max_recv_reqs,
            fc_max_recv_reqs,
            shared_recv_queue,
            shared_recv_comp_queue,
            shared_fc_recv_queue,
            shared_fc_recv_comp_queue,
        }
    }
}

impl ConnectionCreator for DatapathCreator {
    fn create_connection(
        &self,
        connection_id: ConnectionId,
        remote_node_id: NodeId,
        verbs: &Arc<dyn Verbs>,
        pd: PdHandle,
    ) -> Result<Connection> {
        let mut connection = Connection::new(connection_id, remote_node_id);

        connection.add_qp(QueuePair::new(
            verbs,
            pd,
            self.max_send_reqs,
            self.max_recv_reqs,
            Some(self.shared_recv_comp_queue.clone()),
            Some(self.shared_recv_queue.clone()),
        )?);

        // a single send work request is enough, flow control data is summed
        connection.add_qp(QueuePair::new(
            verbs,
            pd,
            1,
            self.fc_max_recv_reqs,
            Some(self.shared_fc_recv_comp_queue.clone()),
            Some(self.shared_fc_recv_queue.clone()),
        )?);

        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::testing::SimVerbs;

    #[test]
    fn simple_creator_one_private_qp() {
        let verbs: Arc<dyn Verbs> = Arc::new(SimVerbs::new());
        let pd = verbs.alloc_pd().unwrap();
        let conn = SimpleCreator::new(16, 32)
            .create_connection(0, 1, &verbs, pd)
            .unwrap();
        assert_eq!(conn.qps().len(), 1);
        assert!(!conn.qp(0).recv_queue().is_shared());
        assert_eq!(conn.qp(0).send_queue().capacity(), 16);
        assert_eq!(conn.qp(0).recv_queue().capacity(), 32);
    }

    #[test]
    fn datapath_creator_payload_and_fc_qps() {
        let verbs: Arc<dyn Verbs> = Arc::new(SimVerbs::new());
        let pd = verbs.alloc_pd().unwrap();

        let srq = Arc::new(SharedRecvQueue::new(&verbs, pd, 32).unwrap());
        let cq = Arc::new(CompQueue::new(&verbs, 32).unwrap());
        let fc_srq = Arc::new(SharedRecvQueue::new(&verbs, pd, 8).unwrap());
        let fc_cq = Arc::new(CompQueue::new(&verbs, 8).unwrap());

        let creator = DatapathCreator::new(16, 32, 8, srq, cq, fc_srq, fc_cq);
        let conn = creator.create_connection(5, 2, &verbs, pd).unwrap();

        assert_eq!(conn.qps().len(), 2);
        assert!(conn.qp(0).recv_queue().is_shared());
        assert!(conn.qp(1).recv_queue().is_shared());
        assert_eq!(conn.qp(1).send_queue().capacity(), 1);
        assert_eq!(conn.qp(1).recv_queue().capacity(), 8);
    }
}
