//! Shared fixture for the engine tests: a running connection manager with
//! the datapath creator over the mock verbs provider, plus both pools.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ctrl::manager::ConnectionManager;
use crate::ctrl::{Config, NodeConfEntry};
use crate::ib::cq::CompQueue;
use crate::ib::creator::DatapathCreator;
use crate::ib::queue::SharedRecvQueue;
use crate::ib::{NodeId, MAX_QPS_PER_CONNECTION};
use crate::verbs::testing::SimVerbs;
use crate::verbs::{Qpn, Verbs};

use crate::ctrl::job::QP_ID_UNUSED;

use super::recv_pool::RecvBufferPool;
use super::send_buffers::SendBuffers;

pub(crate) const RECV_BUFFER_SIZE: u32 = 2048;
pub(crate) const RECV_DEPTH: u16 = 8;
pub(crate) const FC_RECV_DEPTH: u16 = 4;
pub(crate) const SEND_DEPTH: u16 = 4;

pub(crate) struct DatapathFixture {
    pub sim: Arc<SimVerbs>,
    pub manager: Arc<ConnectionManager>,
    pub send_buffers: Arc<SendBuffers>,
    pub pool: Arc<RecvBufferPool>,
    pub recv_cq: Arc<CompQueue>,
    pub fc_cq: Arc<CompQueue>,
    pub recv_srq: Arc<SharedRecvQueue>,
    pub fc_srq: Arc<SharedRecvQueue>,
}

pub(crate) fn datapath_fixture() -> DatapathFixture {
    let config = Config {
        own_node_id: 0,
        own_hostname: "self".into(),
        bind_addr: Ipv4Addr::LOCALHOST,
        socket_port: 0,
        max_num_connections: 4,
        recv_buffer_size: RECV_BUFFER_SIZE,
        recv_pool_bytes: u64::from(RECV_BUFFER_SIZE) * 16,
        max_recv_reqs: RECV_DEPTH,
        max_send_reqs: SEND_DEPTH,
        flow_control_max_recv_reqs: FC_RECV_DEPTH,
        ..Config::default()
    };

    let sim = Arc::new(SimVerbs::new());
    let verbs: Arc<dyn Verbs> = sim.clone();
    let pd = verbs.alloc_pd().unwrap();
    let lid = verbs.open_device().unwrap().lid;

    let recv_srq = Arc::new(SharedRecvQueue::new(&verbs, pd, RECV_DEPTH).unwrap());
    let fc_srq = Arc::new(SharedRecvQueue::new(&verbs, pd, FC_RECV_DEPTH).unwrap());
    let recv_cq = Arc::new(CompQueue::new(&verbs, RECV_DEPTH).unwrap());
    let fc_cq = Arc::new(CompQueue::new(&verbs, FC_RECV_DEPTH).unwrap());

    let creator = DatapathCreator::new(
        SEND_DEPTH,
        RECV_DEPTH,
        FC_RECV_DEPTH,
        recv_srq.clone(),
        recv_cq.clone(),
        fc_srq.clone(),
        fc_cq.clone(),
    );

    let manager = Arc::new(
        ConnectionManager::start(&config, verbs.clone(), pd, lid, Box::new(creator)).unwrap(),
    );

    let send_buffers = Arc::new(
        SendBuffers::new(&verbs, pd, config.send_buffer_size, config.max_num_connections)
            .unwrap(),
    );
    let pool = Arc::new(
        RecvBufferPool::new(
            &verbs,
            pd,
            config.recv_pool_bytes,
            config.recv_buffer_size,
            config.flow_control_max_recv_reqs,
        )
        .unwrap(),
    );

    DatapathFixture {
        sim,
        manager,
        send_buffers,
        pool,
        recv_cq,
        fc_cq,
        recv_srq,
        fc_srq,
    }
}

/// Bring up a connection to `node_id` by replaying the discovery and
/// CON_INFO arrivals through the job worker.
pub(crate) fn establish(fixture: &DatapathFixture, node_id: NodeId) {
    let addr = Ipv4Addr::new(127, 0, 0, 9);
    fixture.manager.add_node(NodeConfEntry {
        hostname: format!("peer{}", node_id),
        addr,
    });
    fixture.manager.inject_discovered(node_id, addr);

    let mut qp_ids = [QP_ID_UNUSED; MAX_QPS_PER_CONNECTION];
    qp_ids[0] = 0x901;
    qp_ids[1] = 0x902;
    fixture.manager.inject_remote(node_id, 0xABCD, 2, qp_ids);

    wait_for(Duration::from_secs(5), || {
        fixture.manager.is_connection_available(node_id)
    });
}

/// Spin until `predicate` holds or the deadline passes (then panic).
pub(crate) fn wait_for<F: Fn() -> bool>(timeout: Duration, predicate: F) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Local physical QP numbers (payload, flow control) of the connection.
pub(crate) fn local_qpns(fixture: &DatapathFixture, node_id: NodeId) -> (Qpn, Qpn) {
    let guard = fixture.manager.get_connection(node_id).unwrap();
    let qpns = (
        guard.qp(0).physical_qp_num(),
        guard.qp(1).physical_qp_num(),
    );
    drop(guard);
    qpns
}
