//! Send and receive queues of a queue pair.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::verbs::{Lid, PdHandle, QpHandle, QpTransition, Qpn, RecvWr, SendWr, SrqHandle, Verbs, WrId};

use super::cq::CompQueue;
use super::error::{Error, Result};
use super::mr::MemReg;

/// Fixed path MTU for all reliable connections.
const PATH_MTU: u32 = 2048;
/// Minimum RNR NAK timer (RTR).
const MIN_RNR_TIMER: u8 = 12;
/// Local ACK timeout (RTS).
const ACK_TIMEOUT: u8 = 14;
/// Retry count on no answer on the primary path (RTS).
const RETRY_COUNT: u8 = 7;
/// RNR retry; 7 = infinite, always wait for the receiver to become ready.
const RNR_RETRY: u8 = 7;

fn map_post_error(e: io::Error) -> Error {
    if e.raw_os_error() == Some(libc::ENOMEM) {
        Error::QueueFull
    } else {
        Error::Io(e)
    }
}

/// A shared receive queue backing the payload (or flow control) QPs of all
/// connections with one common buffer pool.
pub struct SharedRecvQueue {
    verbs: Arc<dyn Verbs>,
    srq: SrqHandle,
    capacity: u16,
}

impl SharedRecvQueue {
    pub fn new(verbs: &Arc<dyn Verbs>, pd: PdHandle, capacity: u16) -> Result<Self> {
        let srq = verbs.create_srq(pd, u32::from(capacity))?;
        Ok(SharedRecvQueue {
            verbs: verbs.clone(),
            srq,
            capacity,
        })
    }

    pub fn handle(&self) -> SrqHandle {
        self.srq
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}

impl Drop for SharedRecvQueue {
    fn drop(&mut self) {
        if let Err(e) = self.verbs.destroy_srq(self.srq) {
            log::error!("destroying SRQ {:?} failed: {}", self.srq, e);
        }
    }
}

/// Receive side of a queue pair.
///
/// Holds either a private receive completion queue sized to the receive
/// depth or references to the shared SRQ/CQ pair handed in by the
/// connection creator.
pub struct RecvQueue {
    verbs: Arc<dyn Verbs>,
    qp: QpHandle,
    capacity: u16,
    comp_queue: Arc<CompQueue>,
    shared_queue: Option<Arc<SharedRecvQueue>>,
    is_closed: AtomicBool,
}

impl RecvQueue {
    pub(super) fn new(
        verbs: Arc<dyn Verbs>,
        qp: QpHandle,
        capacity: u16,
        comp_queue: Arc<CompQueue>,
        shared_queue: Option<Arc<SharedRecvQueue>>,
    ) -> Self {
        if shared_queue.is_some() {
            log::debug!("using shared recv queue");
        }
        RecvQueue {
            verbs,
            qp,
            capacity,
            comp_queue,
            shared_queue,
            is_closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn is_shared(&self) -> bool {
        self.shared_queue.is_some()
    }

    pub fn comp_queue(&self) -> &Arc<CompQueue> {
        &self.comp_queue
    }

    /// Transition the QP to ready-to-receive, addressed at the remote
    /// port/QP. Must happen before the send side is opened.
    pub fn open(&self, remote_lid: Lid, remote_qpn: Qpn) -> Result<()> {
        self.verbs.modify_qp(
            self.qp,
            &QpTransition::ReadyToReceive {
                remote_lid,
                remote_qpn,
                path_mtu: PATH_MTU,
                min_rnr_timer: MIN_RNR_TIMER,
            },
        )?;
        Ok(())
    }

    /// Post a receive work request covering `mem`, to the SRQ if this
    /// queue is shared, else to the QP's private receive queue.
    pub fn receive(&self, mem: &MemReg, wr_id: WrId) -> Result<()> {
        if self.is_closed.load(Ordering::Relaxed) {
            return Err(Error::QueueClosed);
        }

        let wr = RecvWr {
            wr_id,
            sge: mem.full_sge(),
        };

        match &self.shared_queue {
            Some(shared) => self.verbs.post_recv_srq(shared.handle(), &wr),
            None => self.verbs.post_recv_qp(self.qp, &wr),
        }
        .map_err(map_post_error)?;

        self.comp_queue.add_outstanding()
    }

    /// Close the queue. Unless forced, waits for all outstanding
    /// completions to be reaped first.
    pub fn close(&self, force: bool) {
        if !force {
            while self.comp_queue.outstanding() > 0 {
                thread::yield_now();
            }
        }
        self.is_closed.store(true, Ordering::Relaxed);
    }
}

/// Send side of a queue pair. Always owns a private completion queue sized
/// to the send depth.
pub struct SendQueue {
    verbs: Arc<dyn Verbs>,
    qp: QpHandle,
    capacity: u16,
    comp_queue: Arc<CompQueue>,
    is_closed: AtomicBool,
}

impl SendQueue {
    pub(super) fn new(
        verbs: Arc<dyn Verbs>,
        qp: QpHandle,
        capacity: u16,
        comp_queue: Arc<CompQueue>,
    ) -> Self {
        SendQueue {
            verbs,
            qp,
            capacity,
            comp_queue,
            is_closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn comp_queue(&self) -> &Arc<CompQueue> {
        &self.comp_queue
    }

    /// Transition the QP to ready-to-send. The QP must be in
    /// ready-to-receive state already.
    pub fn open(&self) -> Result<()> {
        self.verbs.modify_qp(
            self.qp,
            &QpTransition::ReadyToSend {
                timeout: ACK_TIMEOUT,
                retry_count: RETRY_COUNT,
                rnr_retry: RNR_RETRY,
            },
        )?;
        Ok(())
    }

    /// Post a signaled SEND of `size` bytes at `offset` within `mem`.
    pub fn send(&self, mem: &MemReg, offset: u32, size: u32, wr_id: WrId) -> Result<()> {
        if self.is_closed.load(Ordering::Relaxed) {
            return Err(Error::QueueClosed);
        }

        let wr = SendWr {
            wr_id,
            sge: mem.sge(offset, size),
        };

        self.verbs.post_send(self.qp, &wr).map_err(map_post_error)?;

        self.comp_queue.add_outstanding()
    }

    /// Blockingly poll one send completion.
    pub fn poll_completion(&self, blocking: bool) -> Result<Option<Qpn>> {
        if self.is_closed.load(Ordering::Relaxed) {
            return Err(Error::QueueClosed);
        }
        Ok(self.comp_queue.poll(blocking)?.map(|c| c.qp_num))
    }

    /// Reap every outstanding send completion.
    pub fn flush(&self) -> Result<u32> {
        if self.is_closed.load(Ordering::Relaxed) {
            return Err(Error::QueueClosed);
        }
        self.comp_queue.flush()
    }

    /// Close the queue. Unless forced, waits for all outstanding
    /// completions to be reaped first.
    pub fn close(&self, force: bool) {
        if !force {
            while self.comp_queue.outstanding() > 0 {
                thread::yield_now();
            }
        }
        self.is_closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ib::mr::RegisteredBuffer;
    use crate::ib::qp::QueuePair;
    use crate::verbs::testing::SimVerbs;

    fn setup() -> (Arc<SimVerbs>, Arc<dyn Verbs>, PdHandle) {
        let sim = Arc::new(SimVerbs::new());
        let verbs: Arc<dyn Verbs> = sim.clone();
        let pd = verbs.alloc_pd().unwrap();
        (sim, verbs, pd)
    }

    #[test]
    fn post_paths_track_outstanding() {
        let (sim, verbs, pd) = setup();
        let qp = QueuePair::new(&verbs, pd, 4, 4, None, None).unwrap();
        let buf = RegisteredBuffer::new(&verbs, pd, 256).unwrap();

        qp.recv_queue().receive(&buf.mem(), 1).unwrap();
        assert_eq!(qp.recv_queue().comp_queue().outstanding(), 1);
        // landed on the private queue, not an SRQ
        assert_eq!(sim.take_qp_recv(qp.handle()).unwrap().wr_id, 1);

        qp.recv_queue().open(1, 0x200).unwrap();
        qp.send_queue().open().unwrap();

        qp.send_queue().send(&buf.mem(), 0, 128, 2).unwrap();
        assert_eq!(qp.send_queue().comp_queue().outstanding(), 1);
        qp.send_queue().poll_completion(true).unwrap();
        assert_eq!(qp.send_queue().comp_queue().outstanding(), 0);
    }

    #[test]
    fn shared_queue_posts_to_srq() {
        let (sim, verbs, pd) = setup();
        let srq = Arc::new(SharedRecvQueue::new(&verbs, pd, 8).unwrap());
        let shared_cq = Arc::new(CompQueue::new(&verbs, 8).unwrap());
        let qp = QueuePair::new(
            &verbs,
            pd,
            4,
            8,
            Some(shared_cq),
            Some(srq.clone()),
        )
        .unwrap();
        let buf = RegisteredBuffer::new(&verbs, pd, 256).unwrap();

        assert!(qp.recv_queue().is_shared());
        qp.recv_queue().receive(&buf.mem(), 9).unwrap();
        assert_eq!(sim.srq_pending(srq.handle()), 1);
        assert_eq!(sim.take_srq_recv(srq.handle()).unwrap().wr_id, 9);
    }

    #[test]
    fn enomem_maps_to_queue_full() {
        let (sim, verbs, pd) = setup();
        let qp = QueuePair::new(&verbs, pd, 4, 4, None, None).unwrap();
        let buf = RegisteredBuffer::new(&verbs, pd, 256).unwrap();

        qp.recv_queue().open(1, 0x200).unwrap();
        qp.send_queue().open().unwrap();

        sim.reject_sends(true);
        assert!(matches!(
            qp.send_queue().send(&buf.mem(), 0, 16, 0),
            Err(Error::QueueFull)
        ));
        // the failed post must not count as outstanding
        assert_eq!(qp.send_queue().comp_queue().outstanding(), 0);
    }

    #[test]
    fn closed_queue_rejects_operations() {
        let (_sim, verbs, pd) = setup();
        let qp = QueuePair::new(&verbs, pd, 4, 4, None, None).unwrap();
        let buf = RegisteredBuffer::new(&verbs, pd, 256).unwrap();

        qp.send_queue().close(true);
        qp.recv_queue().close(true);

        assert!(matches!(
            qp.send_queue().send(&buf.mem(), 0, 16, 0),
            Err(Error::QueueClosed)
        ));
        assert!(matches!(
            qp.recv_queue().receive(&buf.mem(), 0),
            Err(Error::QueueClosed)
        ));
        assert!(matches!(qp.send_queue().flush(), Err(Error::QueueClosed)));
    }
}
