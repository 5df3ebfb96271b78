//! The connection manager facade and its job worker.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use quanta::Instant;

use crate::verbs::{Lid, PdHandle, Qpn, Verbs};

use crate::ib::connection::{Connection, RemoteInfo};
use crate::ib::creator::ConnectionCreator;
use crate::ib::error::{Error, Result};
use crate::ib::{ConnectionId, NodeId, MAX_NODES, MAX_QPS_PER_CONNECTION, NODE_ID_INVALID};
use crate::utils;

use super::config::{Config, NodeConfEntry};
use super::discovery::DiscoveryContext;
use super::exchange::{run_exchange_loop, ExchangeSocket, Packet, LID_UNUSED};
use super::job::{Job, JobChannel, QP_ID_UNUSED};

/// No connection exists or is being set up.
pub const CONNECTION_NOT_AVAILABLE: i32 = i32::MIN;
/// Connection ready; values above count outstanding handles.
pub const CONNECTION_AVAILABLE: i32 = 0;
/// Close in progress; new handles are denied.
pub const CONNECTION_CLOSING: i32 = i32::MIN / 2;

/// While a caller waits for a connection to come up, its create job is
/// refreshed at this interval in case the first one ran before discovery
/// finished.
const CREATE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Callbacks for connection lifecycle events. Fired from the job worker;
/// implementations must not block for long.
pub trait ConnectionListener: Send + Sync {
    fn node_discovered(&self, _node_id: NodeId) {}
    fn node_invalidated(&self, _node_id: NodeId) {}
    fn node_connected(&self, _node_id: NodeId, _connection: &Arc<Connection>) {}
    fn node_disconnected(&self, _node_id: NodeId) {}
}

/// Holds the registered listener; callbacks go through here so the slots
/// can be shared before a listener exists.
pub struct ListenerSlot {
    listener: RwLock<Option<Arc<dyn ConnectionListener>>>,
}

impl ListenerSlot {
    pub fn new() -> Self {
        ListenerSlot {
            listener: RwLock::new(None),
        }
    }

    pub fn set(&self, listener: Arc<dyn ConnectionListener>) {
        *self.listener.write().unwrap() = Some(listener);
    }

    fn get(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.read().unwrap().clone()
    }

    pub(crate) fn node_discovered(&self, node_id: NodeId) {
        if let Some(listener) = self.get() {
            listener.node_discovered(node_id);
        }
    }

    pub(crate) fn node_invalidated(&self, node_id: NodeId) {
        if let Some(listener) = self.get() {
            listener.node_invalidated(node_id);
        }
    }

    fn node_connected(&self, node_id: NodeId, connection: &Arc<Connection>) {
        if let Some(listener) = self.get() {
            listener.node_connected(node_id, connection);
        }
    }

    fn node_disconnected(&self, node_id: NodeId) {
        if let Some(listener) = self.get() {
            listener.node_disconnected(node_id);
        }
    }
}

impl Default for ListenerSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote QP parameters carried by a CON_INFO packet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteParams {
    pub ident: u32,
    pub lid: Lid,
    pub qp_ids: [Qpn; MAX_QPS_PER_CONNECTION],
}

/// A claimed handle on a connection. Every successful `get_connection`
/// yields exactly one; dropping it (or `return_connection`) releases the
/// claim.
pub struct ConnectionGuard {
    connection: Arc<Connection>,
    node_id: NodeId,
    ctx: Arc<ConnectionContext>,
}

impl ConnectionGuard {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

impl Deref for ConnectionGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let previous = self.ctx.available[self.node_id as usize].fetch_sub(1, Ordering::Relaxed);
        log::trace!(
            "returned connection {:#x}, avail {}",
            self.node_id,
            previous - 1
        );
    }
}

/// Per-peer connection slots and the state machines around them.
///
/// All mutation of the slots, the QP number map, the connection id free
/// list and the sentinel transitions of the handle counters happens on the
/// job worker; callers only claim and release handles.
pub(crate) struct ConnectionContext {
    own_node_id: NodeId,
    /// Incarnation of this manager, minted once per instance.
    ident: u32,
    creation_timeout: Duration,
    verbs: Arc<dyn Verbs>,
    pd: PdHandle,
    lid: Lid,
    creator: Box<dyn ConnectionCreator>,
    available: Box<[AtomicI32]>,
    slots: Box<[RwLock<Option<Arc<Connection>>>]>,
    qp_num_map: RwLock<HashMap<Qpn, NodeId>>,
    free_ids: Mutex<Vec<ConnectionId>>,
    open_connections: AtomicU32,
    discovery: Arc<DiscoveryContext>,
    jobs: Arc<JobChannel>,
    socket: Arc<ExchangeSocket>,
    listener: Arc<ListenerSlot>,
}

impl ConnectionContext {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: &Config,
        verbs: Arc<dyn Verbs>,
        pd: PdHandle,
        lid: Lid,
        creator: Box<dyn ConnectionCreator>,
        discovery: Arc<DiscoveryContext>,
        jobs: Arc<JobChannel>,
        socket: Arc<ExchangeSocket>,
        listener: Arc<ListenerSlot>,
    ) -> Result<Self> {
        if config.own_node_id == NODE_ID_INVALID {
            return Err(Error::Config("invalid own node id".into()));
        }

        let available = (0..MAX_NODES)
            .map(|_| AtomicI32::new(CONNECTION_NOT_AVAILABLE))
            .collect();
        let slots = (0..MAX_NODES).map(|_| RwLock::new(None)).collect();

        // ids are reused so the highest id ever issued stays below
        // max_num_connections; popping yields id 0 first
        let free_ids = (0..config.max_num_connections)
            .rev()
            .map(|id| id as ConnectionId)
            .collect();

        Ok(ConnectionContext {
            own_node_id: config.own_node_id,
            ident: utils::random_ident(),
            creation_timeout: Duration::from_millis(u64::from(
                config.connection_creation_timeout_ms,
            )),
            verbs,
            pd,
            lid,
            creator,
            available,
            slots,
            qp_num_map: RwLock::new(HashMap::new()),
            free_ids: Mutex::new(free_ids),
            open_connections: AtomicU32::new(0),
            discovery,
            jobs,
            socket,
            listener,
        })
    }

    pub fn is_connection_available(&self, node_id: NodeId) -> bool {
        self.available[node_id as usize].load(Ordering::Relaxed) >= CONNECTION_AVAILABLE
    }

    pub fn node_id_for_qp_num(&self, qp_num: Qpn) -> NodeId {
        self.qp_num_map
            .read()
            .unwrap()
            .get(&qp_num)
            .copied()
            .unwrap_or(NODE_ID_INVALID)
    }

    fn guard_for(self: &Arc<Self>, node_id: NodeId) -> Result<ConnectionGuard> {
        let connection = self.slots[node_id as usize].read().unwrap().clone();
        match connection {
            Some(connection) => Ok(ConnectionGuard {
                connection,
                node_id,
                ctx: self.clone(),
            }),
            None => Err(Error::Invariant("invalid connection state on get_connection")),
        }
    }

    /// Claim a handle, waiting for the connection to come up if necessary.
    pub fn get_connection(self: &Arc<Self>, node_id: NodeId) -> Result<ConnectionGuard> {
        if node_id == NODE_ID_INVALID {
            return Err(Error::InvalidNodeId);
        }
        let idx = node_id as usize;

        // keep track of handles issued
        let available = self.available[idx].fetch_add(1, Ordering::Acquire);
        if available >= CONNECTION_AVAILABLE {
            return self.guard_for(node_id);
        }

        log::trace!("get_connection {:#x}, avail {}", node_id, available + 1);

        self.jobs.add_create_job(node_id);

        let start = Instant::now();
        let mut last_create = start;
        loop {
            if self.available[idx].load(Ordering::Acquire) >= CONNECTION_AVAILABLE {
                let available = self.available[idx].fetch_add(1, Ordering::Acquire);
                if available >= CONNECTION_AVAILABLE {
                    return self.guard_for(node_id);
                }
            }

            thread::yield_now();

            let elapsed = start.elapsed();
            if elapsed >= self.creation_timeout {
                return Err(Error::Timeout {
                    node_id,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }

            // the first create job may have run before the peer was
            // discovered; refresh it until the wait resolves
            if last_create.elapsed() >= CREATE_RETRY_INTERVAL {
                self.jobs.add_create_job(node_id);
                last_create = Instant::now();
            }
        }
    }

    /// Job worker: ensure a connection to the node exists, finish it if
    /// the remote parameters are in, and push our own parameters to the
    /// peer.
    fn create(&self, node_id: NodeId, remote: Option<&RemoteParams>) -> Result<()> {
        let Some(remote_node_info) = self.discovery.node_info(node_id) else {
            log::warn!(
                "cannot create connection to remote {:#x}, not discovered yet",
                node_id
            );
            return Ok(());
        };

        let idx = node_id as usize;

        // allocate the connection if necessary
        {
            let mut slot = self.slots[idx].write().unwrap();
            if slot.is_none() {
                let connection_id = {
                    let mut free_ids = self.free_ids.lock().unwrap();
                    match free_ids.pop() {
                        Some(id) => id,
                        None => {
                            log::error!(
                                "no connection ids left, cannot connect to {:#x}",
                                node_id
                            );
                            return Ok(());
                        }
                    }
                };

                let connection = match self
                    .creator
                    .create_connection(connection_id, node_id, &self.verbs, self.pd)
                {
                    Ok(connection) => connection,
                    Err(e) => {
                        self.free_ids.lock().unwrap().push(connection_id);
                        return Err(e);
                    }
                };

                if connection.qps().len() > MAX_QPS_PER_CONNECTION {
                    return Err(Error::Invariant("exceeded max qps per connection limit"));
                }

                // publish the QP number mapping before anything can be
                // posted on the new QPs
                {
                    let mut map = self.qp_num_map.write().unwrap();
                    for qp in connection.qps() {
                        map.insert(qp.physical_qp_num(), node_id);
                    }
                }

                log::debug!(
                    "allocated new connection to remote {:#x} with {} QPs",
                    node_id,
                    connection.qps().len()
                );

                *slot = Some(Arc::new(connection));
            }
        }

        let connection = self.slots[idx]
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::Invariant("connection slot emptied during create"))?;

        // not connected yet and a usable remote QP context available ->
        // finish the connection
        if let Some(params) = remote {
            if !connection.is_connected() && params.lid != LID_UNUSED {
                let physical_qp_ids: Vec<Qpn> = params
                    .qp_ids
                    .iter()
                    .copied()
                    .take_while(|&id| id != QP_ID_UNUSED)
                    .collect();

                let remote_info = RemoteInfo {
                    node_id,
                    lid: params.lid,
                    con_man_ident: params.ident,
                    physical_qp_ids,
                };

                connection.connect(remote_info)?;
                log::info!("connected QPs to remote node {:#x}", node_id);
                self.open_connections.fetch_add(1, Ordering::Relaxed);

                self.available[idx].store(CONNECTION_AVAILABLE, Ordering::Release);

                self.listener.node_connected(node_id, &connection);
            } else if connection.is_connected()
                && params.lid != LID_UNUSED
                && connection.remote_ident().is_some_and(|stored| stored != params.ident)
            {
                // same node id, different manager incarnation: the remote
                // restarted and the old queue pairs are dead
                log::debug!(
                    "detected zombie connection to node {:#x} ({:#x} != {:#x}), killing...",
                    node_id,
                    connection.remote_ident().unwrap_or(0),
                    params.ident
                );
                self.jobs.add_close_job(node_id, true, false);
                self.jobs.add_create_job(node_id);
                return Ok(());
            }
        }

        // send our QP parameters to the remote; it may still be lacking
        // them even if our side is established
        let mut own_qp_ids = [QP_ID_UNUSED; MAX_QPS_PER_CONNECTION];
        for (own_id, qp) in own_qp_ids.iter_mut().zip(connection.qps()) {
            *own_id = qp.physical_qp_num();
        }
        self.socket.send_packet(
            &Packet::con_info(self.own_node_id, self.ident, self.lid, own_qp_ids),
            remote_node_info.addr,
        );

        Ok(())
    }

    /// Job worker: tear the connection down and recycle its id.
    fn close(&self, node_id: NodeId, force: bool, shutdown: bool) -> Result<()> {
        log::info!("closing connection of {:#x}, force {}", node_id, force);

        let idx = node_id as usize;
        let counter = self.available[idx].swap(CONNECTION_CLOSING, Ordering::Relaxed);

        if !force && counter >= CONNECTION_AVAILABLE {
            // wait until every outstanding handle has been returned
            loop {
                let current = self.available[idx].load(Ordering::Relaxed);
                if current == CONNECTION_CLOSING - counter {
                    break;
                }
                thread::yield_now();
            }
        }

        let connection = self.slots[idx].write().unwrap().take();

        // someone else was faster and removed it already
        let Some(connection) = connection else {
            return Ok(());
        };

        connection.close(force);

        {
            let mut map = self.qp_num_map.write().unwrap();
            for qp in connection.qps() {
                map.remove(&qp.physical_qp_num());
            }
        }

        // re-use the connection id
        self.free_ids.lock().unwrap().push(connection.connection_id());

        self.open_connections.fetch_sub(1, Ordering::Relaxed);

        self.available[idx].store(CONNECTION_NOT_AVAILABLE, Ordering::Relaxed);

        self.discovery.invalidate(node_id, shutdown);

        self.listener.node_disconnected(node_id);

        log::debug!("connection of {:#x}, force {} closed", node_id, force);
        Ok(())
    }
}

fn dispatch_job(ctx: &ConnectionContext, discovery: &DiscoveryContext, job: Job) {
    log::trace!("dispatching job {:?}", job);

    let result = match job {
        Job::Create { node_id } => ctx.create(node_id, None),
        Job::CreateWithRemote {
            node_id,
            ident,
            lid,
            qp_ids,
        } => ctx.create(node_id, Some(&RemoteParams { ident, lid, qp_ids })),
        Job::Close {
            node_id,
            force,
            shutdown,
        } => ctx.close(node_id, force, shutdown),
        Job::Discovered { node_id, ip } => {
            discovery.discovered(node_id, ip);
            Ok(())
        }
    };

    if let Err(e) = result {
        if e.is_fatal() {
            panic!("job worker hit fatal error: {}", e);
        }
        log::warn!("job failed: {}", e);
    }
}

/// Job worker loop: drain the job queue first so discovery never starves
/// connection establishment, then run a discovery pass if requested, else
/// idle briefly.
fn run_job_loop(run: &AtomicBool, ctx: &ConnectionContext, discovery: &DiscoveryContext) {
    while run.load(Ordering::Relaxed) {
        if let Some(job) = ctx.jobs.pop() {
            dispatch_job(ctx, discovery, job);
        } else if ctx.jobs.take_discover_job() {
            discovery.discover();
        } else {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

struct Workers {
    run: Arc<AtomicBool>,
    exchange: JoinHandle<()>,
    job: JoinHandle<()>,
}

/// Public facade over the connection machinery.
///
/// Starting a manager spawns the exchange and job workers; dropping it (or
/// calling [`shutdown`](Self::shutdown)) closes every open connection,
/// drains the job queue and stops them.
pub struct ConnectionManager {
    ctx: Arc<ConnectionContext>,
    discovery: Arc<DiscoveryContext>,
    jobs: Arc<JobChannel>,
    listener: Arc<ListenerSlot>,
    workers: Mutex<Option<Workers>>,
}

impl ConnectionManager {
    /// Build the contexts and start the workers.
    pub fn start(
        config: &Config,
        verbs: Arc<dyn Verbs>,
        pd: PdHandle,
        lid: Lid,
        creator: Box<dyn ConnectionCreator>,
    ) -> Result<Self> {
        log::info!("starting connection manager...");

        let jobs = Arc::new(JobChannel::new());
        let listener = Arc::new(ListenerSlot::new());
        let socket = Arc::new(ExchangeSocket::bound(config.bind_addr, config.socket_port)?);

        let discovery = Arc::new(DiscoveryContext::new(
            config.own_node_id,
            config.own_hostname.clone(),
            &config.node_conf(),
            jobs.clone(),
            socket.clone(),
            listener.clone(),
        ));

        let ctx = Arc::new(ConnectionContext::new(
            config,
            verbs,
            pd,
            lid,
            creator,
            discovery.clone(),
            jobs.clone(),
            socket.clone(),
            listener.clone(),
        )?);

        let run = Arc::new(AtomicBool::new(true));

        let exchange = {
            let run = run.clone();
            let socket = socket.clone();
            let jobs = jobs.clone();
            let own_node_id = config.own_node_id;
            thread::Builder::new()
                .name("ibmsg-exchange".into())
                .spawn(move || run_exchange_loop(&run, own_node_id, &socket, &jobs))
                .map_err(Error::Io)?
        };

        let job = {
            let run = run.clone();
            let ctx = ctx.clone();
            let discovery = discovery.clone();
            thread::Builder::new()
                .name("ibmsg-job".into())
                .spawn(move || run_job_loop(&run, &ctx, &discovery))
                .map_err(Error::Io)?
        };

        // initial discovery job to get everything started
        jobs.add_discover_job();

        Ok(ConnectionManager {
            ctx,
            discovery,
            jobs,
            listener,
            workers: Mutex::new(Some(Workers { run, exchange, job })),
        })
    }

    pub fn own_node_id(&self) -> NodeId {
        self.ctx.own_node_id
    }

    /// Register another peer and trigger its discovery.
    pub fn add_node(&self, entry: NodeConfEntry) {
        self.discovery.add_node(entry);
    }

    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listener.set(listener);
    }

    pub fn is_connection_available(&self, node_id: NodeId) -> bool {
        self.ctx.is_connection_available(node_id)
    }

    /// Claim a connection handle, waiting up to the configured creation
    /// timeout for the connection to come up.
    pub fn get_connection(&self, node_id: NodeId) -> Result<ConnectionGuard> {
        self.ctx.get_connection(node_id)
    }

    /// Release a handle claimed with `get_connection`. Equivalent to
    /// dropping the guard; must happen exactly once per claim.
    pub fn return_connection(&self, guard: ConnectionGuard) {
        drop(guard);
    }

    /// Enqueue an asynchronous close of the peer's connection.
    pub fn close_connection(&self, node_id: NodeId, force: bool) {
        self.jobs.add_close_job(node_id, force, false);
    }

    /// Source node of a completion, via the physical QP number.
    pub fn node_id_for_qp_num(&self, qp_num: Qpn) -> NodeId {
        self.ctx.node_id_for_qp_num(qp_num)
    }

    /// Close every open connection, drain the job queue and stop the
    /// workers. Idempotent.
    pub fn shutdown(&self) {
        let Some(workers) = self.workers.lock().unwrap().take() else {
            return;
        };

        log::info!("shutting down connection manager...");

        for node_id in 0..MAX_NODES as u32 {
            let node_id = node_id as NodeId;
            if self.ctx.is_connection_available(node_id) {
                self.jobs.add_close_job(node_id, true, true);
            }
        }

        // wait until all jobs are processed
        while !self.jobs.is_empty() {
            thread::sleep(Duration::from_millis(100));
        }

        workers.run.store(false, Ordering::Relaxed);
        if let Err(e) = workers.exchange.join() {
            log::error!("exchange worker panicked: {:?}", e);
        }
        if let Err(e) = workers.job.join() {
            log::error!("job worker panicked: {:?}", e);
        }

        log::debug!("shutting down connection manager done");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
impl ConnectionManager {
    /// Feed the job worker as if a discovery response had arrived.
    pub(crate) fn inject_discovered(&self, node_id: NodeId, ip: std::net::Ipv4Addr) {
        self.jobs.add_discovered_job(node_id, ip);
    }

    /// Feed the job worker as if a CON_INFO packet had arrived.
    pub(crate) fn inject_remote(
        &self,
        node_id: NodeId,
        ident: u32,
        lid: Lid,
        qp_ids: [Qpn; MAX_QPS_PER_CONNECTION],
    ) {
        self.jobs.add_create_with_remote_job(node_id, ident, lid, qp_ids);
    }
}
