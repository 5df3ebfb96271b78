//! The recv engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::ctrl::manager::ConnectionManager;
use crate::ib::connection::Connection;
use crate::ib::cq::CompQueue;
use crate::ib::error::{Error, Result};
use crate::ib::{NodeId, NODE_ID_INVALID};
use crate::utils::backoff::IdleBackoff;

use super::handler::RecvSink;
use super::recv_pool::RecvBufferPool;

/// State shared between the engine thread, the connection listener and
/// the stats thread.
pub struct RecvEngineShared {
    run: AtomicBool,
    pool: Arc<RecvBufferPool>,
    initial_fill: AtomicBool,
    recv_bytes: AtomicU64,
    recv_flow_control_bytes: AtomicU64,
}

impl RecvEngineShared {
    /// Created ahead of the engine itself so the connection listener can
    /// be wired up before any connection may establish.
    pub fn new(pool: Arc<RecvBufferPool>) -> Arc<Self> {
        Arc::new(RecvEngineShared {
            run: AtomicBool::new(true),
            pool,
            initial_fill: AtomicBool::new(false),
            recv_bytes: AtomicU64::new(0),
            recv_flow_control_bytes: AtomicU64::new(0),
        })
    }

    pub fn recv_bytes(&self) -> u64 {
        self.recv_bytes.load(Ordering::Relaxed)
    }

    pub fn recv_flow_control_bytes(&self) -> u64 {
        self.recv_flow_control_bytes.load(Ordering::Relaxed)
    }

    /// On the first connection, pre-fill every slot of both shared receive
    /// queues with buffers from the pools. Called from the connection
    /// listener.
    pub fn node_connected(&self, connection: &Arc<Connection>) -> Result<()> {
        if self
            .initial_fill
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Ok(());
        }

        let payload_queue = connection.qp(0).recv_queue();
        if !payload_queue.is_shared() {
            return Err(Error::Invariant("payload recv queue must be shared"));
        }
        for _ in 0..payload_queue.capacity() {
            let index = self.pool.acquire();
            // the buffer index is the work request id
            payload_queue.receive(&self.pool.payload_mem(index), u64::from(index))?;
        }

        let fc_queue = connection.qp(1).recv_queue();
        if !fc_queue.is_shared() {
            return Err(Error::Invariant("flow control recv queue must be shared"));
        }
        for _ in 0..fc_queue.capacity() {
            let Some(index) = self.pool.take_flow_control() else {
                break;
            };
            fc_queue.receive(&self.pool.flow_control_mem(index), u64::from(index))?;
        }

        Ok(())
    }
}

/// Drains the two shared completion queues, flow control first, maps each
/// completion back to its source node via the manager's QP number map and
/// hands the data upstream. Payload buffers are replaced from the pool;
/// flow control buffers are re-posted in place.
pub struct RecvEngine {
    shared: Arc<RecvEngineShared>,
    thread: Option<JoinHandle<()>>,
}

impl RecvEngine {
    pub fn start(
        manager: Arc<ConnectionManager>,
        shared: Arc<RecvEngineShared>,
        recv_cq: Arc<CompQueue>,
        flow_control_recv_cq: Arc<CompQueue>,
        sink: Arc<dyn RecvSink>,
    ) -> Result<Self> {
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("ibmsg-recv".into())
                .spawn(move || {
                    let mut engine = RecvLoop {
                        manager,
                        recv_cq,
                        flow_control_recv_cq,
                        sink,
                        shared,
                        backoff: IdleBackoff::new(),
                    };
                    engine.run();
                })
                .map_err(Error::Io)?
        };

        Ok(RecvEngine {
            shared,
            thread: Some(thread),
        })
    }

    pub fn shared(&self) -> &Arc<RecvEngineShared> {
        &self.shared
    }

    /// Stop the loop and join the thread.
    pub fn stop(&mut self) {
        self.shared.run.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                log::error!("recv engine panicked: {:?}", e);
            }
        }
    }
}

impl Drop for RecvEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RecvLoop {
    manager: Arc<ConnectionManager>,
    recv_cq: Arc<CompQueue>,
    flow_control_recv_cq: Arc<CompQueue>,
    sink: Arc<dyn RecvSink>,
    shared: Arc<RecvEngineShared>,
    backoff: IdleBackoff,
}

impl RecvLoop {
    fn run(&mut self) {
        while self.shared.run.load(Ordering::Relaxed) {
            // flow control has higher priority, always try its queue first
            if self.process_flow_control() || self.process_buffers() {
                self.backoff.reset();
            } else {
                self.backoff.idle();
            }
        }
    }

    fn poll(cq: &CompQueue, what: &str) -> Option<crate::ib::cq::Completion> {
        match cq.poll(false) {
            Ok(completion) => completion,
            Err(e) if e.is_fatal() => panic!("recv engine hit fatal error: {}", e),
            Err(e) => {
                log::error!("polling for {} completion failed: {}", what, e);
                None
            }
        }
    }

    /// Map a completion's QP number to its source node. A miss can only be
    /// the publication race between QP creation and map insert, so retry
    /// until it resolves; completions are never dropped. Bails out with
    /// INVALID only on shutdown.
    fn translate(&self, qp_num: u32) -> NodeId {
        loop {
            let node_id = self.manager.node_id_for_qp_num(qp_num);
            if node_id != NODE_ID_INVALID {
                return node_id;
            }
            if !self.shared.run.load(Ordering::Relaxed) {
                return NODE_ID_INVALID;
            }
            log::error!(
                "no node id mapping for qpNum {:#x}, retrying; completions are not dropped",
                qp_num
            );
            thread::yield_now();
        }
    }

    fn process_flow_control(&mut self) -> bool {
        let Some(completion) = Self::poll(&self.flow_control_recv_cq, "flow control") else {
            return false;
        };

        let source_node = self.translate(completion.qp_num);
        if source_node == NODE_ID_INVALID {
            return true;
        }

        let index = completion.wr_id as u32;
        let data = self.shared.pool.read_flow_control(index);
        self.shared
            .recv_flow_control_bytes
            .fetch_add(u64::from(completion.byte_len), Ordering::Relaxed);

        // keep the shared FC receive queue filled with the same buffer
        match self.manager.get_connection(source_node) {
            Ok(guard) => {
                match guard
                    .qp(1)
                    .recv_queue()
                    .receive(&self.shared.pool.flow_control_mem(index), completion.wr_id)
                {
                    Ok(()) | Err(Error::QueueClosed) => {}
                    Err(e) => log::error!("re-posting flow control buffer failed: {}", e),
                }
            }
            Err(e) => {
                log::warn!(
                    "cannot re-post flow control buffer for node {:#x}: {}",
                    source_node,
                    e
                );
            }
        }

        self.sink.received_flow_control(source_node, data);
        true
    }

    fn process_buffers(&mut self) -> bool {
        let Some(completion) = Self::poll(&self.recv_cq, "buffer") else {
            return false;
        };

        let source_node = self.translate(completion.qp_num);
        if source_node == NODE_ID_INVALID {
            return true;
        }

        self.shared
            .recv_bytes
            .fetch_add(u64::from(completion.byte_len), Ordering::Relaxed);

        // the sink owns the buffer now and returns it to the pool
        // asynchronously
        let buffer = self
            .shared
            .pool
            .loan(completion.wr_id as u32, completion.byte_len as usize);
        self.sink.received_buffer(source_node, buffer);

        // replace the consumed slot of the shared receive queue with a
        // fresh buffer from the pool
        match self.manager.get_connection(source_node) {
            Ok(guard) => {
                let index = self.shared.pool.acquire();
                match guard
                    .qp(0)
                    .recv_queue()
                    .receive(&self.shared.pool.payload_mem(index), u64::from(index))
                {
                    Ok(()) => {}
                    Err(e) => {
                        if !matches!(e, Error::QueueClosed) {
                            log::error!("re-posting recv buffer failed: {}", e);
                        }
                        // conservation: the unposted buffer goes back
                        self.shared.pool.return_buffer(self.shared.pool.loan(index, 0));
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "cannot re-post recv buffer for node {:#x}: {}",
                    source_node,
                    e
                );
            }
        }

        true
    }
}
