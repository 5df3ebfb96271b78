//! Process-level wiring of the messaging substrate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::ctrl::manager::{ConnectionListener, ConnectionManager};
use crate::ctrl::Config;
use crate::ib::connection::Connection;
use crate::ib::cq::CompQueue;
use crate::ib::creator::DatapathCreator;
use crate::ib::error::{Error, Result};
use crate::ib::queue::SharedRecvQueue;
use crate::ib::NodeId;
use crate::msg::recv_engine::{RecvEngine, RecvEngineShared};
use crate::msg::send_engine::{SendEngine, SendEngineStats};
use crate::msg::{RecvBufferPool, RecvSink, SendBuffers, SendSource};
use crate::verbs::Verbs;

/// Forwards lifecycle events to the embedder's listener and lets the recv
/// engine pre-fill the shared receive queues on the first connection.
struct RuntimeListener {
    recv_shared: Arc<RecvEngineShared>,
    inner: Option<Arc<dyn ConnectionListener>>,
}

impl ConnectionListener for RuntimeListener {
    fn node_discovered(&self, node_id: NodeId) {
        if let Some(inner) = &self.inner {
            inner.node_discovered(node_id);
        }
    }

    fn node_invalidated(&self, node_id: NodeId) {
        if let Some(inner) = &self.inner {
            inner.node_invalidated(node_id);
        }
    }

    fn node_connected(&self, node_id: NodeId, connection: &Arc<Connection>) {
        if let Err(e) = self.recv_shared.node_connected(connection) {
            log::error!("filling shared receive queues failed: {}", e);
        }
        if let Some(inner) = &self.inner {
            inner.node_connected(node_id, connection);
        }
    }

    fn node_disconnected(&self, node_id: NodeId) {
        if let Some(inner) = &self.inner {
            inner.node_disconnected(node_id);
        }
    }
}

struct StatsThread {
    run: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

fn start_stats_thread(
    send: Arc<SendEngineStats>,
    recv: Arc<RecvEngineShared>,
) -> Result<StatsThread> {
    let run = Arc::new(AtomicBool::new(true));
    let thread = {
        let run = run.clone();
        thread::Builder::new()
            .name("ibmsg-stats".into())
            .spawn(move || {
                while run.load(Ordering::Relaxed) {
                    log::debug!(
                        "sent {} B (+{} B fc), received {} B (+{} B fc)",
                        send.sent_bytes(),
                        send.sent_flow_control_bytes(),
                        recv.recv_bytes(),
                        recv.recv_flow_control_bytes()
                    );
                    for _ in 0..10 {
                        if !run.load(Ordering::Relaxed) {
                            break;
                        }
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            })
            .map_err(Error::Io)?
    };
    Ok(StatsThread { run, thread })
}

/// All long-lived state of the substrate: verbs resources, the connection
/// manager, buffer pools and both engines, with explicit start and stop.
///
/// Payload bytes travel application -> send buffer -> QP\[0\] -> fabric ->
/// shared receive queue -> recv sink; flow control credits take QP\[1\].
pub struct Runtime {
    stats: Option<StatsThread>,
    send_engine: SendEngine,
    recv_engine: RecvEngine,
    manager: Arc<ConnectionManager>,
    send_buffers: Arc<SendBuffers>,
    recv_pool: Arc<RecvBufferPool>,
}

impl Runtime {
    /// Bring everything up: device, protection domain, shared receive
    /// infrastructure, connection manager, pools and engines.
    pub fn start(
        config: Config,
        verbs: Arc<dyn Verbs>,
        source: Arc<dyn SendSource>,
        sink: Arc<dyn RecvSink>,
        listener: Option<Arc<dyn ConnectionListener>>,
    ) -> Result<Runtime> {
        config.validate()?;

        if config.enable_signal_handler {
            log::debug!("signal handling is left to the embedder");
        }

        log::info!("initializing messaging substrate...");

        let device = verbs.open_device()?;
        let pd = verbs.alloc_pd()?;

        let shared_recv_queue = Arc::new(SharedRecvQueue::new(&verbs, pd, config.max_recv_reqs)?);
        let shared_fc_recv_queue = Arc::new(SharedRecvQueue::new(
            &verbs,
            pd,
            config.flow_control_max_recv_reqs,
        )?);
        let shared_recv_cq = Arc::new(CompQueue::new(&verbs, config.max_recv_reqs)?);
        let shared_fc_recv_cq = Arc::new(CompQueue::new(&verbs, config.flow_control_max_recv_reqs)?);

        let creator = DatapathCreator::new(
            config.max_send_reqs,
            config.max_recv_reqs,
            config.flow_control_max_recv_reqs,
            shared_recv_queue,
            shared_recv_cq.clone(),
            shared_fc_recv_queue,
            shared_fc_recv_cq.clone(),
        );

        let manager = Arc::new(ConnectionManager::start(
            &config,
            verbs.clone(),
            pd,
            device.lid,
            Box::new(creator),
        )?);

        log::info!("initializing buffer pools...");

        let send_buffers = Arc::new(SendBuffers::new(
            &verbs,
            pd,
            config.send_buffer_size,
            config.max_num_connections,
        )?);
        let recv_pool = Arc::new(RecvBufferPool::new(
            &verbs,
            pd,
            config.recv_pool_bytes,
            config.recv_buffer_size,
            config.flow_control_max_recv_reqs,
        )?);

        log::info!("initializing send and recv engines...");

        // listener first: the prefill hook must be in place before the
        // first connection can come up
        let recv_shared = RecvEngineShared::new(recv_pool.clone());
        manager.set_listener(Arc::new(RuntimeListener {
            recv_shared: recv_shared.clone(),
            inner: listener,
        }));

        let recv_engine = RecvEngine::start(
            manager.clone(),
            recv_shared,
            shared_recv_cq,
            shared_fc_recv_cq,
            sink,
        )?;

        let send_engine = SendEngine::start(
            manager.clone(),
            send_buffers.clone(),
            source,
            config.recv_buffer_size,
        )?;

        let stats = if config.enable_debug_thread {
            Some(start_stats_thread(
                send_engine.stats().clone(),
                recv_engine.shared().clone(),
            )?)
        } else {
            None
        };

        log::info!("initializing messaging substrate done");

        Ok(Runtime {
            stats,
            send_engine,
            recv_engine,
            manager,
            send_buffers,
            recv_pool,
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Per-connection send buffers the application writes payloads into.
    pub fn send_buffers(&self) -> &Arc<SendBuffers> {
        &self.send_buffers
    }

    /// The pool the recv sink returns payload buffers to.
    pub fn recv_pool(&self) -> &Arc<RecvBufferPool> {
        &self.recv_pool
    }

    /// Stop the engines, close every connection and stop the workers.
    pub fn stop(mut self) {
        log::info!("shutting down messaging substrate...");

        if let Some(stats) = self.stats.take() {
            stats.run.store(false, Ordering::Relaxed);
            if let Err(e) = stats.thread.join() {
                log::error!("stats thread panicked: {:?}", e);
            }
        }

        self.send_engine.stop();
        self.recv_engine.stop();
        self.manager.shutdown();

        log::info!("shutting down messaging substrate done");
    }
}
